//! Session lifecycle states and outcomes

use std::fmt;
use std::time::Duration;

/// Lifecycle state of a capture session
///
/// `Created -> Running -> {Completed | TimedOut | Cancelled | Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Request accepted, engine not yet confirmed running
    Created,
    /// Engine process confirmed launched
    Running,
    /// Engine exited on its own after reaching its count bound or the end of input
    Completed,
    /// Duration bound or safety ceiling elapsed
    TimedOut,
    /// Cancellation requested or the engine was interrupted
    Cancelled,
    /// Engine exited with an error
    Failed,
}

impl SessionState {
    /// Check whether the state is final
    pub fn is_terminal(&self) -> bool {
        self.terminal().is_some()
    }

    /// Terminal view of the state, if it is final
    pub fn terminal(&self) -> Option<TerminalState> {
        match self {
            SessionState::Created | SessionState::Running => None,
            SessionState::Completed => Some(TerminalState::Completed),
            SessionState::TimedOut => Some(TerminalState::TimedOut),
            SessionState::Cancelled => Some(TerminalState::Cancelled),
            SessionState::Failed => Some(TerminalState::Failed),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => f.write_str("created"),
            SessionState::Running => f.write_str("running"),
            other => match other.terminal() {
                Some(t) => t.fmt(f),
                None => Ok(()),
            },
        }
    }
}

/// Final outcome of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalState {
    Completed,
    TimedOut,
    Cancelled,
    Failed,
}

impl TerminalState {
    /// Whether the engine ran without error, regardless of how it was stopped
    pub fn is_clean(&self) -> bool {
        !matches!(self, TerminalState::Failed)
    }
}

impl From<TerminalState> for SessionState {
    fn from(state: TerminalState) -> Self {
        match state {
            TerminalState::Completed => SessionState::Completed,
            TerminalState::TimedOut => SessionState::TimedOut,
            TerminalState::Cancelled => SessionState::Cancelled,
            TerminalState::Failed => SessionState::Failed,
        }
    }
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminalState::Completed => "completed",
            TerminalState::TimedOut => "timed out",
            TerminalState::Cancelled => "cancelled",
            TerminalState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What the session controller recorded when it committed the terminal state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOutcome {
    /// Terminal state
    pub state: TerminalState,
    /// Engine exit code, if it exited normally
    pub exit_code: Option<i32>,
    /// Time from launch to terminal state
    pub elapsed: Duration,
    /// Whether graceful termination had to be escalated to a forced kill
    pub escalated: bool,
    /// Tail of the engine's stderr
    pub stderr: String,
}
