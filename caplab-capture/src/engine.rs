//! Capture engine boundary
//!
//! The supervisor never captures packets itself. An engine turns a
//! [`CaptureRequest`] into the command line of an external capture tool
//! that writes frames to the request's output path, exits 0 when it stops
//! on its own or is asked to stop gracefully, and exits non-zero on error.

use std::ffi::OsString;
use std::path::PathBuf;
use tokio::process::Command;

use crate::request::{CaptureRequest, CaptureSource};

/// Default snapshot length (maximum bytes recorded per packet)
pub const DEFAULT_SNAPLEN: u32 = 65_535;

/// Something that can launch a capture
pub trait CaptureEngine: Send + Sync {
    /// Engine name used in logs and errors
    fn name(&self) -> &str;

    /// Build the command that runs the capture described by `request`
    fn command(&self, request: &CaptureRequest) -> Command;
}

/// tcpdump-compatible capture engine
#[derive(Debug, Clone)]
pub struct TcpdumpEngine {
    binary: PathBuf,
    snaplen: u32,
}

impl Default for TcpdumpEngine {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("tcpdump"),
            snaplen: DEFAULT_SNAPLEN,
        }
    }
}

impl TcpdumpEngine {
    /// Create an engine that runs `binary`
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            ..Default::default()
        }
    }

    /// Set the snapshot length
    pub fn with_snaplen(mut self, snaplen: u32) -> Self {
        self.snaplen = snaplen;
        self
    }

    /// Arguments passed to the binary for `request`
    pub fn args(&self, request: &CaptureRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-n".into(),
            // packet-buffered output so a terminated capture keeps what it saw
            "-U".into(),
            "-s".into(),
            self.snaplen.to_string().into(),
        ];

        match request.source() {
            CaptureSource::Interface(name) => {
                args.push("-i".into());
                args.push(name.into());
            }
            CaptureSource::File(path) => {
                args.push("-r".into());
                args.push(path.into());
            }
        }

        if let Some(count) = request.bound().count() {
            args.push("-c".into());
            args.push(count.to_string().into());
        }

        args.push("-w".into());
        args.push(request.output().into());

        // passed as a single argv entry, never through a shell
        if !request.filter().is_empty() {
            args.push(request.filter().into());
        }

        args
    }
}

impl CaptureEngine for TcpdumpEngine {
    fn name(&self) -> &str {
        "tcpdump"
    }

    fn command(&self, request: &CaptureRequest) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.args(request));
        cmd
    }
}
