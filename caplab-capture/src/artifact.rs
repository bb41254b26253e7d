//! Capture artifacts
//!
//! An artifact is usable only when the file exists and holds at least one
//! frame. The store never deletes or rewrites an artifact on its own;
//! deletion is an explicit call so failed captures can be inspected.

use caplab_core::{Error, Result};
use chrono::{DateTime, Utc};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{create_reader, Block, PcapBlockOwned, PcapError};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::request::CaptureSource;
use crate::session::CaptureSession;
use crate::state::TerminalState;

/// Read buffer for the frame check; must hold the largest block in the file
const READ_BUFFER: usize = 1 << 20;

/// A finalized, read-only capture file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureArtifact {
    path: PathBuf,
    size: u64,
    modified: Option<DateTime<Utc>>,
    state: Option<TerminalState>,
}

impl CaptureArtifact {
    /// Path of the capture file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Last modification time
    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.modified
    }

    /// Terminal state of the session that produced it; `None` for files
    /// opened directly
    pub fn state(&self) -> Option<TerminalState> {
        self.state
    }
}

/// Hands out artifact paths and validates finished captures
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl ArtifactStore {
    /// Create a store rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory generated artifact paths live in
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fresh artifact path for a capture of `source`
    pub fn allocate(&self, source: &CaptureSource) -> PathBuf {
        generate_path(&self.dir, source)
    }

    /// Validate the artifact of a terminal session
    ///
    /// A `Failed` session yields `CaptureFailed`. A session that ended
    /// otherwise but left no frames yields `EmptyCapture`.
    pub fn finalize(&self, session: &CaptureSession) -> Result<CaptureArtifact> {
        let outcome = session.outcome().ok_or_else(|| {
            Error::Supervisor(format!(
                "session {} has not reached a terminal state",
                session.id()
            ))
        })?;
        let path = session.output();

        if outcome.state == TerminalState::Failed {
            error!(
                session = %session.id(),
                path = %path.display(),
                exit_code = ?outcome.exit_code,
                stderr = %outcome.stderr,
                "Capture failed, no analyzable data"
            );
            return Err(Error::CaptureFailed {
                path: path.to_path_buf(),
                exit_code: outcome.exit_code,
                stderr: outcome.stderr,
            });
        }

        let state = outcome.state.to_string();
        let artifact = inspect(path, Some(outcome.state), &state)?;
        info!(
            session = %session.id(),
            path = %artifact.path.display(),
            size = artifact.size,
            state = %state,
            "Capture finalized"
        );
        Ok(artifact)
    }

    /// Open an existing capture file for analysis
    pub fn open(&self, path: impl AsRef<Path>) -> Result<CaptureArtifact> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::UnreadableArtifact {
                path: path.to_path_buf(),
                reason: "file not found".to_string(),
            });
        }
        inspect(path, None, "supplied")
    }

    /// Delete an artifact
    ///
    /// A file that is already gone is not an error.
    pub fn delete(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => {
                info!(path = %path.display(), "Deleted capture artifact");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Artifact already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn inspect(path: &Path, state: Option<TerminalState>, label: &str) -> Result<CaptureArtifact> {
    let empty = || {
        warn!(path = %path.display(), state = %label, "Capture produced no analyzable data");
        Error::EmptyCapture {
            path: path.to_path_buf(),
            state: label.to_string(),
        }
    };

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(empty()),
        Err(e) => return Err(e.into()),
    };
    if !metadata.is_file() || metadata.len() == 0 {
        return Err(empty());
    }
    if !has_frames(path)? {
        return Err(empty());
    }

    Ok(CaptureArtifact {
        path: path.to_path_buf(),
        size: metadata.len(),
        modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        state,
    })
}

/// Check whether a capture file holds at least one complete frame
///
/// Unknown formats count as having frames; the decoder decides whether
/// it can read them. A trailing partial record does not count.
fn has_frames(path: &Path) -> io::Result<bool> {
    let file = File::open(path)?;
    let mut reader = match create_reader(READ_BUFFER, file) {
        Ok(reader) => reader,
        Err(e) => {
            debug!(path = %path.display(), error = ?e, "Not a pcap or pcapng file");
            return Ok(true);
        }
    };

    let mut refilled = false;
    loop {
        match reader.next() {
            Ok((offset, block)) => {
                let frame = matches!(
                    block,
                    PcapBlockOwned::Legacy(_)
                        | PcapBlockOwned::NG(Block::EnhancedPacket(_))
                        | PcapBlockOwned::NG(Block::SimplePacket(_))
                );
                if frame {
                    return Ok(true);
                }
                reader.consume(offset);
                refilled = false;
            }
            Err(PcapError::Eof) => return Ok(false),
            Err(PcapError::Incomplete { .. }) if !refilled => {
                if let Err(e) = reader.refill() {
                    debug!(path = %path.display(), error = ?e, "Refill failed");
                    return Ok(false);
                }
                refilled = true;
            }
            Err(e) => {
                debug!(path = %path.display(), error = ?e, "No complete frame");
                return Ok(false);
            }
        }
    }
}

/// Generate `<dir>/capture_<source>_<UTC timestamp>_<suffix>.pcap`
pub fn generate_path(dir: &Path, source: &CaptureSource) -> PathBuf {
    let label: String = source
        .label()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    // the tail of a v7 UUID is random; the head is a timestamp
    let id = Uuid::now_v7().simple().to_string();
    let suffix = &id[id.len() - 8..];
    dir.join(format!("capture_{}_{}_{}.pcap", label, stamp, suffix))
}
