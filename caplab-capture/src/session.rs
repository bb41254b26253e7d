//! Capture session handles
//!
//! A [`CaptureSession`] is a cheap, cloneable view of one supervised
//! capture. It never changes the session's state itself: the per-session
//! controller task spawned by the [`Supervisor`](crate::Supervisor) is the
//! only writer of the terminal state, and handles talk to it through a
//! cancellation signal.

use caplab_core::{Error, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::request::CaptureRequest;
use crate::state::{CaptureOutcome, SessionState};

/// Controller-side view of the session lifecycle
#[derive(Debug, Clone)]
pub(crate) enum Phase {
    Created,
    Running,
    Finished(CaptureOutcome),
}

impl Phase {
    fn outcome(&self) -> Option<&CaptureOutcome> {
        match self {
            Phase::Created | Phase::Running => None,
            Phase::Finished(outcome) => Some(outcome),
        }
    }
}

struct SessionInner {
    id: Uuid,
    request: CaptureRequest,
    engine: String,
    pid: OnceLock<u32>,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    cancel: watch::Sender<bool>,
    phase: watch::Receiver<Phase>,
}

/// Handle to one capture run
#[derive(Clone)]
pub struct CaptureSession {
    inner: Arc<SessionInner>,
}

/// Controller ends of a session's channels
pub(crate) struct SessionLink {
    pub cancel: watch::Receiver<bool>,
    pub phase: watch::Sender<Phase>,
}

impl SessionLink {
    /// Move `Created` to `Running`; later phases are left alone
    pub fn confirm_running(&self) {
        self.phase.send_if_modified(|phase| {
            if !matches!(phase, Phase::Created) {
                return false;
            }
            *phase = Phase::Running;
            true
        });
    }

    /// Commit the terminal outcome; returns false if one was already committed
    pub fn commit(&self, outcome: CaptureOutcome) -> bool {
        self.phase.send_if_modified(|phase| {
            if matches!(phase, Phase::Finished(_)) {
                return false;
            }
            *phase = Phase::Finished(outcome);
            true
        })
    }
}

impl CaptureSession {
    /// New session in the `Created` phase; the engine is not running yet
    pub(crate) fn created(request: CaptureRequest, engine: &str) -> (Self, SessionLink) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (phase_tx, phase_rx) = watch::channel(Phase::Created);

        let session = Self {
            inner: Arc::new(SessionInner {
                id: Uuid::now_v7(),
                request,
                engine: engine.to_string(),
                pid: OnceLock::new(),
                started_at: Instant::now(),
                started_wall: Utc::now(),
                cancel: cancel_tx,
                phase: phase_rx,
            }),
        };

        (
            session,
            SessionLink {
                cancel: cancel_rx,
                phase: phase_tx,
            },
        )
    }

    /// Unique session ID
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Request this session was started from
    pub fn request(&self) -> &CaptureRequest {
        &self.inner.request
    }

    /// Artifact path the engine writes to
    pub fn output(&self) -> &Path {
        self.inner.request.output()
    }

    /// Name of the engine running the capture
    pub fn engine(&self) -> &str {
        &self.inner.engine
    }

    /// OS process ID of the capture engine, once it has been spawned
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid.get().copied()
    }

    pub(crate) fn set_pid(&self, pid: u32) {
        let _ = self.inner.pid.set(pid);
    }

    pub(crate) fn started_at(&self) -> Instant {
        self.inner.started_at
    }

    /// Wall-clock launch time
    pub fn started(&self) -> DateTime<Utc> {
        self.inner.started_wall
    }

    /// Time since launch, or launch-to-finish once terminal
    pub fn elapsed(&self) -> Duration {
        match self.outcome() {
            Some(outcome) => outcome.elapsed,
            None => self.inner.started_at.elapsed(),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        match &*self.inner.phase.borrow() {
            Phase::Created => SessionState::Created,
            Phase::Running => SessionState::Running,
            Phase::Finished(outcome) => outcome.state.into(),
        }
    }

    /// Check whether the session has reached its terminal state
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Outcome, once the session is terminal
    pub fn outcome(&self) -> Option<CaptureOutcome> {
        self.inner.phase.borrow().outcome().cloned()
    }

    /// Whether cancellation has been requested
    pub fn is_cancel_requested(&self) -> bool {
        *self.inner.cancel.borrow()
    }

    /// Request cooperative termination
    ///
    /// Never blocks. Calling it again, or after the session is terminal,
    /// has no effect.
    pub fn cancel(&self) {
        let already = self.inner.cancel.send_replace(true);
        if !already && !self.is_terminal() {
            debug!(session = %self.inner.id, "Cancellation requested");
        }
    }

    /// Wait until the controller commits the terminal state
    pub async fn wait(&self) -> Result<CaptureOutcome> {
        let mut phase = self.inner.phase.clone();
        let outcome = match phase.wait_for(|p| p.outcome().is_some()).await {
            Ok(current) => current.outcome().cloned(),
            Err(_) => None,
        };
        // the controller may have gone away after committing
        outcome
            .or_else(|| self.outcome())
            .ok_or_else(|| {
                Error::Supervisor(format!(
                    "controller for session {} exited without a terminal state",
                    self.inner.id
                ))
            })
    }
}

impl fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSession")
            .field("id", &self.inner.id)
            .field("engine", &self.inner.engine)
            .field("pid", &self.pid())
            .field("source", self.inner.request.source())
            .field("state", &self.state())
            .finish()
    }
}
