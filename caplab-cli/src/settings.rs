//! YAML settings
//!
//! Every section and field is optional. Command-line flags override the
//! file, and the file overrides the built-in defaults.
//!
//! ```yaml
//! supervisor:
//!   grace_ms: 2000
//!   safety_ceiling_secs: 3600
//! engine:
//!   binary: /usr/sbin/tcpdump
//!   snaplen: 65535
//! analysis:
//!   top_n: 10
//!   samples: 5
//! output_dir: /var/tmp/caplab
//! ```

use caplab_analysis::aggregate::{DEFAULT_BUCKET_COUNT, DEFAULT_BUCKET_WIDTH, DEFAULT_TOP_N};
use caplab_capture::{SupervisorConfig, TcpdumpEngine};
use caplab_core::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level settings file
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub analysis: AnalysisSettings,
    /// Directory for generated capture file names
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

/// Capture engine settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_binary")]
    pub binary: PathBuf,
    #[serde(default = "default_snaplen")]
    pub snaplen: u32,
}

fn default_binary() -> PathBuf {
    PathBuf::from("tcpdump")
}
fn default_snaplen() -> u32 {
    65535
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            snaplen: default_snaplen(),
        }
    }
}

impl EngineSettings {
    pub fn engine(&self) -> TcpdumpEngine {
        TcpdumpEngine::new(&self.binary).with_snaplen(self.snaplen)
    }
}

/// Analysis and report settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AnalysisSettings {
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_bucket_width")]
    pub bucket_width: u32,
    #[serde(default = "default_bucket_count")]
    pub bucket_count: usize,
    /// Sample packets shown at the end of the report
    #[serde(default = "default_samples")]
    pub samples: usize,
}

fn default_top_n() -> usize {
    DEFAULT_TOP_N
}
fn default_bucket_width() -> u32 {
    DEFAULT_BUCKET_WIDTH
}
fn default_bucket_count() -> usize {
    DEFAULT_BUCKET_COUNT
}
fn default_samples() -> usize {
    5
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
            bucket_width: default_bucket_width(),
            bucket_count: default_bucket_count(),
            samples: default_samples(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    /// Parse settings from a YAML string
    pub fn parse(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| {
            let line = e.location().map(|l| l.line()).unwrap_or(0);
            Error::Config(format!("line {}: {}", line, e))
        })
    }

    /// Load from `path` when given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
