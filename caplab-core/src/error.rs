//! Error types for caplab

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for caplab operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for caplab
///
/// Every variant that ends a capture run names the stage that failed and
/// carries enough context (artifact path, exit code, engine stderr) for the
/// caller to retry with a narrower filter or a longer bound.
#[derive(Error, Debug)]
pub enum Error {
    /// Filesystem or process I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Capture filter failed the structural checks
    #[error("Invalid filter syntax in '{expression}': {reason}")]
    InvalidFilterSyntax { expression: String, reason: String },

    /// Capture request failed validation
    #[error("Invalid capture request '{field}': {reason}")]
    InvalidRequest { field: String, reason: String },

    /// The capture engine could not be started
    #[error("Capture launch failed ({engine}): {reason}")]
    LaunchFailed { engine: String, reason: String },

    /// The capture ran but the artifact holds no analyzable data
    #[error("Capture {state} but produced no analyzable data at {}", path.display())]
    EmptyCapture { path: PathBuf, state: String },

    /// The capture process itself errored
    #[error("Capture failed at {} (exit code {}): {stderr}", path.display(), display_code(*exit_code))]
    CaptureFailed {
        path: PathBuf,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// The decode engine rejected the artifact
    #[error("Unreadable capture artifact {}: {reason}", path.display())]
    UnreadableArtifact { path: PathBuf, reason: String },

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// The session controller went away without committing a terminal state
    #[error("Supervisor error: {0}")]
    Supervisor(String),
}

fn display_code(code: Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

impl Error {
    /// Create an invalid filter error
    pub fn invalid_filter<E: Into<String>, R: Into<String>>(expression: E, reason: R) -> Self {
        Error::InvalidFilterSyntax {
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Error::InvalidRequest {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a launch failure for the named engine
    pub fn launch_failed<E: Into<String>, R: Into<String>>(engine: E, reason: R) -> Self {
        Error::LaunchFailed {
            engine: engine.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error means "nothing to analyze" (empty or failed capture)
    pub fn is_no_data(&self) -> bool {
        matches!(self, Error::EmptyCapture { .. } | Error::CaptureFailed { .. })
    }

    /// Process exit code the command-line driver reports for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidFilterSyntax { .. } | Error::InvalidRequest { .. } | Error::Config(_) => 2,
            Error::LaunchFailed { .. } => 3,
            Error::EmptyCapture { .. } => 4,
            Error::CaptureFailed { .. } => 5,
            Error::UnreadableArtifact { .. } => 6,
            Error::Io(_) | Error::Supervisor(_) => 1,
        }
    }
}
