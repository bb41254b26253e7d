//! Capture requests
//!
//! A [`CaptureRequest`] is immutable once built. The builder rejects
//! unset or zero bounds instead of treating them as "run forever";
//! unbounded capture has to be asked for with
//! [`CaptureRequestBuilder::unbounded`].

use caplab_core::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::artifact;
use crate::filters::{self, FilterPreset};

/// Where packets come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    /// Live capture on a network interface (`any` is allowed)
    Interface(String),
    /// Replay of an existing capture file
    File(PathBuf),
}

impl CaptureSource {
    /// Short label used in logs and generated file names
    pub fn label(&self) -> String {
        match self {
            CaptureSource::Interface(name) => name.clone(),
            CaptureSource::File(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "replay".to_string()),
        }
    }

    /// Check whether this is a replay source
    pub fn is_replay(&self) -> bool {
        matches!(self, CaptureSource::File(_))
    }
}

impl fmt::Display for CaptureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureSource::Interface(name) => write!(f, "interface {}", name),
            CaptureSource::File(path) => write!(f, "file {}", path.display()),
        }
    }
}

/// How a capture is bounded
///
/// With both bounds set, whichever triggers first ends the capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureBound {
    /// Stop after this many packets
    Count(u64),
    /// Stop after this much wall-clock time
    Duration(Duration),
    /// Stop at the packet count or the duration, whichever comes first
    Both { count: u64, duration: Duration },
    /// No bound; ends only on cancellation or the supervisor's safety ceiling
    Unbounded,
}

impl CaptureBound {
    /// Packet-count bound, if any
    pub fn count(&self) -> Option<u64> {
        match self {
            CaptureBound::Count(n) | CaptureBound::Both { count: n, .. } => Some(*n),
            _ => None,
        }
    }

    /// Duration bound, if any
    pub fn duration(&self) -> Option<Duration> {
        match self {
            CaptureBound::Duration(d) | CaptureBound::Both { duration: d, .. } => Some(*d),
            _ => None,
        }
    }
}

impl fmt::Display for CaptureBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureBound::Count(n) => write!(f, "{} packets", n),
            CaptureBound::Duration(d) => write!(f, "{:.1}s", d.as_secs_f64()),
            CaptureBound::Both { count, duration } => {
                write!(f, "{} packets or {:.1}s", count, duration.as_secs_f64())
            }
            CaptureBound::Unbounded => f.write_str("unbounded"),
        }
    }
}

/// Immutable description of one capture run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    source: CaptureSource,
    filter: String,
    bound: CaptureBound,
    output: PathBuf,
    verbose: bool,
}

impl CaptureRequest {
    /// Start building a request for a source
    pub fn builder(source: CaptureSource) -> CaptureRequestBuilder {
        CaptureRequestBuilder::new(source)
    }

    /// Capture source
    pub fn source(&self) -> &CaptureSource {
        &self.source
    }

    /// Normalized filter expression; empty means capture everything
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Capture bound
    pub fn bound(&self) -> CaptureBound {
        self.bound
    }

    /// Artifact path the engine writes to
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Verbose engine output requested
    pub fn verbose(&self) -> bool {
        self.verbose
    }
}

/// Builder for [`CaptureRequest`]
#[derive(Debug, Clone)]
pub struct CaptureRequestBuilder {
    source: CaptureSource,
    filter: String,
    preset: Option<FilterPreset>,
    count: Option<u64>,
    duration: Option<Duration>,
    unbounded: bool,
    output: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    verbose: bool,
}

impl CaptureRequestBuilder {
    fn new(source: CaptureSource) -> Self {
        Self {
            source,
            filter: String::new(),
            preset: None,
            count: None,
            duration: None,
            unbounded: false,
            output: None,
            output_dir: None,
            verbose: false,
        }
    }

    /// Set the free-form filter expression
    pub fn filter(mut self, expression: impl Into<String>) -> Self {
        self.filter = expression.into();
        self
    }

    /// Combine a named preset with the filter expression
    pub fn preset(mut self, preset: FilterPreset) -> Self {
        self.preset = Some(preset);
        self
    }

    /// Bound the capture by packet count
    pub fn packet_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    /// Bound the capture by wall-clock duration
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Explicitly request an unbounded capture
    pub fn unbounded(mut self) -> Self {
        self.unbounded = true;
        self
    }

    /// Write the artifact to this path
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    /// Generate the artifact name inside this directory when no output path is set
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Ask the engine for verbose output
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Validate and build the request
    pub fn build(self) -> Result<CaptureRequest> {
        let filter = filters::compose(self.preset, &self.filter)?;

        if self.count == Some(0) {
            return Err(Error::invalid_request(
                "count",
                "packet-count bound must be positive",
            ));
        }
        if self.duration == Some(Duration::ZERO) {
            return Err(Error::invalid_request(
                "duration",
                "duration bound must be positive",
            ));
        }

        let bound = match (self.count, self.duration, self.unbounded) {
            (Some(_), _, true) | (_, Some(_), true) => {
                return Err(Error::invalid_request(
                    "bound",
                    "an unbounded capture cannot also set a count or duration",
                ))
            }
            (None, None, true) => CaptureBound::Unbounded,
            (Some(count), Some(duration), false) => CaptureBound::Both { count, duration },
            (Some(count), None, false) => CaptureBound::Count(count),
            (None, Some(duration), false) => CaptureBound::Duration(duration),
            (None, None, false) => {
                return Err(Error::invalid_request(
                    "bound",
                    "set a packet count, a duration, or both",
                ))
            }
        };

        match &self.source {
            CaptureSource::Interface(name) if name.trim().is_empty() => {
                return Err(Error::invalid_request("interface", "interface name is empty"));
            }
            CaptureSource::File(path) if path.as_os_str().is_empty() => {
                return Err(Error::invalid_request("file", "replay path is empty"));
            }
            _ => {}
        }

        let output = match self.output {
            Some(path) if path.as_os_str().is_empty() => {
                return Err(Error::invalid_request("output", "output path is empty"));
            }
            Some(path) => path,
            None => {
                let dir = self.output_dir.unwrap_or_else(std::env::temp_dir);
                artifact::generate_path(&dir, &self.source)
            }
        };

        if let CaptureSource::File(input) = &self.source {
            if input == &output {
                return Err(Error::invalid_request(
                    "output",
                    "output path must differ from the replay file",
                ));
            }
        }

        Ok(CaptureRequest {
            source: self.source,
            filter,
            bound,
            output,
            verbose: self.verbose,
        })
    }
}
