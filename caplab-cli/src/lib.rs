//! Command-line interface for caplab
//!
//! Argument parsing, YAML settings and the capture → analyze → report
//! driver behind the `caplab` binary.

pub mod args;
pub mod run;
pub mod settings;

pub use args::{CaptureArgs, Cli, Commands, ReportArgs};
pub use settings::Settings;
