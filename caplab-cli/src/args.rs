//! CLI argument parsing

use clap::{ArgGroup, Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "caplab")]
#[command(version, about = "Supervised packet capture and protocol analysis", long_about = None)]
pub struct Cli {
    /// Verbose output (-v, -vv, -vvv for increasing verbosity)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// YAML settings file
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Capture packets, then analyze the capture
    Capture(CaptureArgs),

    /// Analyze an existing pcap or pcapng file
    Analyze {
        /// Capture file to analyze
        #[arg(value_name = "FILE")]
        file: PathBuf,

        #[command(flatten)]
        report: ReportArgs,
    },

    /// List available network interfaces
    Interfaces,

    /// List filter presets and their expressions
    Presets,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("source").required(true).args(["interface", "read"])))]
pub struct CaptureArgs {
    /// Network interface to capture on (`any` for all)
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Replay packets from a capture file instead of a live interface
    #[arg(short, long, value_name = "FILE")]
    pub read: Option<PathBuf>,

    /// BPF filter expression
    #[arg(short, long, default_value = "")]
    pub filter: String,

    /// Named filter preset, combined with --filter using `and`
    #[arg(long, value_name = "NAME")]
    pub preset: Option<String>,

    /// Stop after this many packets
    #[arg(short = 'c', long)]
    pub count: Option<u64>,

    /// Stop after this many seconds
    #[arg(short = 't', long, value_name = "SECONDS")]
    pub duration: Option<u64>,

    /// Run until interrupted or the safety ceiling is hit
    #[arg(long, conflicts_with_all = ["count", "duration"])]
    pub unbounded: bool,

    /// Write the capture to this file
    #[arg(short = 'w', long, value_name = "FILE")]
    pub write: Option<PathBuf>,

    /// Directory for generated capture file names
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Delete the capture file after analysis
    #[arg(long)]
    pub delete: bool,

    /// Capture only, skip analysis
    #[arg(long)]
    pub no_analyze: bool,

    #[command(flatten)]
    pub report: ReportArgs,
}

/// Options shared by every command that produces a report
#[derive(Args, Debug, Default)]
pub struct ReportArgs {
    /// Number of entries in ranked lists
    #[arg(short = 'n', long = "top", value_name = "N")]
    pub top: Option<usize>,

    /// Number of sample packets to include
    #[arg(long, value_name = "N")]
    pub samples: Option<usize>,

    /// Fields to extract (timestamp, source, destination, ports, protocols, length, flags)
    #[arg(long, value_delimiter = ',', value_name = "FIELDS")]
    pub fields: Vec<String>,

    /// Write the report to this file instead of stdout
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
