//! Capture process supervisor
//!
//! The `Supervisor` is the entry point for running captures. It:
//!
//! - launches the capture engine as a separate OS process
//! - spawns one controller task per session that races process exit,
//!   the duration bound, cancellation and the safety ceiling
//! - terminates with SIGTERM first and escalates to SIGKILL after the
//!   grace window
//! - tracks live sessions so they can all be cancelled at shutdown

use caplab_core::{Error, Result};
use dashmap::DashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::engine::CaptureEngine;
use crate::interface;
use crate::request::{CaptureRequest, CaptureSource};
use crate::session::{CaptureSession, SessionLink};
use crate::state::{CaptureOutcome, TerminalState};

/// Supervises capture engine processes
pub struct Supervisor {
    engine: Arc<dyn CaptureEngine>,
    config: SupervisorConfig,
    /// Sessions whose controller has not committed a terminal state yet
    sessions: Arc<DashMap<Uuid, CaptureSession>>,
    closing: AtomicBool,
}

impl Supervisor {
    /// Create a supervisor for `engine`
    pub fn new(engine: impl CaptureEngine + 'static, config: SupervisorConfig) -> Self {
        info!(engine = %engine.name(), "Creating capture supervisor");
        Self {
            engine: Arc::new(engine),
            config,
            sessions: Arc::new(DashMap::new()),
            closing: AtomicBool::new(false),
        }
    }

    /// Supervisor configuration
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Launch a capture
    ///
    /// The session is registered in the `Created` phase before the engine is
    /// spawned, so it can be looked up and cancelled while the launch is
    /// being confirmed. Returns once the engine survived the launch window,
    /// has already finished cleanly, or was cancelled during launch. Anything
    /// that keeps the engine from starting is reported as `LaunchFailed`.
    pub async fn start(&self, request: CaptureRequest) -> Result<CaptureSession> {
        let engine = self.engine.name().to_string();

        self.preflight(&request)?;
        prepare_output(&engine, request.output()).await?;

        info!(
            engine = %engine,
            source = %request.source(),
            bound = %request.bound(),
            filter = %request.filter(),
            output = %request.output().display(),
            "Launching capture"
        );

        let mut cmd = self.engine.command(&request);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // own process group: a terminal Ctrl-C reaches us, not the engine
        #[cfg(unix)]
        cmd.process_group(0);

        let (session, mut link) = CaptureSession::created(request, &engine);
        let registration = Registration::new(&self.sessions, &session);
        if self.closing.load(Ordering::SeqCst) {
            debug!(session = %session.id(), "Supervisor shutting down, cancelling new session");
            session.cancel();
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("cannot start engine: {}", e);
                return Err(abandon(&link, &session, &engine, reason, None));
            }
        };
        let pid = child.id();
        if let Some(pid) = pid {
            session.set_pid(pid);
        }

        let mut stderr = child.stderr.take().map(|pipe| {
            tokio::spawn(read_stderr(
                pipe,
                self.config.stderr_limit,
                pid,
                session.request().verbose(),
            ))
        });

        let launch = tokio::select! {
            biased;
            status = child.wait() => Launch::Exited(status),
            _ = cancelled(&mut link.cancel) => Launch::Interrupted,
            _ = sleep(self.config.launch_probe()) => Launch::Confirmed,
        };

        let early_exit = match launch {
            Launch::Confirmed => None,
            Launch::Interrupted => {
                info!(session = %session.id(), pid = ?pid, "Cancelled during launch");
                None
            }
            Launch::Exited(Ok(status)) if status.success() => Some(status),
            Launch::Exited(Ok(status)) => {
                let tail = collect_stderr(&mut stderr, self.config.grace_window()).await;
                warn!(engine = %engine, pid = ?pid, status = %status, "Engine exited during launch");
                let mut reason = format!("engine exited during launch ({})", status);
                if !tail.is_empty() {
                    reason.push_str(": ");
                    reason.push_str(&tail);
                }
                return Err(abandon(&link, &session, &engine, reason, status.code()));
            }
            Launch::Exited(Err(e)) => {
                let reason = format!("cannot confirm engine launch: {}", e);
                return Err(abandon(&link, &session, &engine, reason, None));
            }
        };

        link.confirm_running();
        registration.hand_over();
        info!(session = %session.id(), pid = ?pid, "Capture running");

        let started_at = session.started_at();
        let bound = session.request().bound().duration();
        let controller = Controller {
            session: session.id(),
            child,
            pid,
            started_at,
            deadline: bound.map(|d| started_at + d),
            ceiling: started_at + self.config.effective_ceiling(bound),
            grace: self.config.grace_window(),
            link,
            stderr,
            early_exit,
            sessions: Arc::clone(&self.sessions),
        };
        tokio::spawn(controller.run());

        Ok(session)
    }

    /// Wait for a session to reach its terminal state
    ///
    /// `Completed`, `TimedOut` and `Cancelled` are returned as outcomes. A
    /// `Failed` session is returned as `CaptureFailed` with the engine's
    /// exit code and stderr tail.
    pub async fn wait(&self, session: &CaptureSession) -> Result<CaptureOutcome> {
        let outcome = session.wait().await?;
        if outcome.state == TerminalState::Failed {
            return Err(Error::CaptureFailed {
                path: session.output().to_path_buf(),
                exit_code: outcome.exit_code,
                stderr: outcome.stderr,
            });
        }
        Ok(outcome)
    }

    /// Request cooperative termination of a session
    pub fn cancel(&self, session: &CaptureSession) {
        session.cancel();
    }

    /// Request termination of every live session
    ///
    /// Sessions still in the `Created` phase are included.
    pub fn cancel_all(&self) {
        let count = self.sessions.len();
        if count > 0 {
            info!(count, "Cancelling all capture sessions");
        }
        for entry in self.sessions.iter() {
            entry.value().cancel();
        }
    }

    /// Cancel every live session and every launch still in progress
    ///
    /// Captures started after this call are cancelled as soon as they are
    /// created.
    pub fn shutdown(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            debug!("Supervisor shutting down");
        }
        self.cancel_all();
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Snapshot of the sessions that have not reached a terminal state
    pub fn sessions(&self) -> Vec<CaptureSession> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Number of sessions that have not reached a terminal state
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Look up a live session
    pub fn session(&self, id: Uuid) -> Option<CaptureSession> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    fn preflight(&self, request: &CaptureRequest) -> Result<()> {
        match request.source() {
            CaptureSource::Interface(name) if !interface::interface_exists(name) => Err(
                Error::launch_failed(self.engine.name(), format!("interface {} not found", name)),
            ),
            CaptureSource::File(path) if !path.is_file() => Err(Error::launch_failed(
                self.engine.name(),
                format!("replay file {} not found", path.display()),
            )),
            _ => Ok(()),
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Keeps a `Created` session in the live table until its controller takes
/// over; removes it if the launch fails or the `start` future is dropped
struct Registration<'a> {
    sessions: &'a DashMap<Uuid, CaptureSession>,
    id: Uuid,
    armed: bool,
}

impl<'a> Registration<'a> {
    fn new(sessions: &'a DashMap<Uuid, CaptureSession>, session: &CaptureSession) -> Self {
        sessions.insert(session.id(), session.clone());
        Self {
            sessions,
            id: session.id(),
            armed: true,
        }
    }

    fn hand_over(mut self) {
        self.armed = false;
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.sessions.remove(&self.id);
        }
    }
}

/// Commit a `Failed` outcome for a session whose engine never got going
fn abandon(
    link: &SessionLink,
    session: &CaptureSession,
    engine: &str,
    reason: String,
    exit_code: Option<i32>,
) -> Error {
    link.commit(CaptureOutcome {
        state: TerminalState::Failed,
        exit_code,
        elapsed: session.started_at().elapsed(),
        escalated: false,
        stderr: reason.clone(),
    });
    Error::launch_failed(engine, reason)
}

/// Remove a stale artifact and make sure the output directory exists
async fn prepare_output(engine: &str, output: &Path) -> Result<()> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            Error::launch_failed(
                engine,
                format!("cannot create output directory {}: {}", parent.display(), e),
            )
        })?;
    }
    match tokio::fs::remove_file(output).await {
        Ok(()) => {
            debug!(path = %output.display(), "Removed stale artifact");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::launch_failed(
            engine,
            format!("cannot replace {}: {}", output.display(), e),
        )),
    }
}

enum Launch {
    Confirmed,
    Exited(std::io::Result<ExitStatus>),
    Interrupted,
}

enum Event {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    DurationElapsed,
    Ceiling,
}

/// Per-session controller; the only writer of the session's terminal state
struct Controller {
    session: Uuid,
    child: Child,
    pid: Option<u32>,
    started_at: Instant,
    deadline: Option<Instant>,
    ceiling: Instant,
    grace: Duration,
    link: SessionLink,
    stderr: Option<JoinHandle<String>>,
    early_exit: Option<ExitStatus>,
    sessions: Arc<DashMap<Uuid, CaptureSession>>,
}

impl Controller {
    async fn run(mut self) {
        let (state, status, escalated) = match self.early_exit.take() {
            Some(status) => (classify(status), Some(status), false),
            None => self.race().await,
        };
        let elapsed = self.started_at.elapsed();
        let stderr = collect_stderr(&mut self.stderr, self.grace).await;

        let outcome = CaptureOutcome {
            state,
            exit_code: status.and_then(|s| s.code()),
            elapsed,
            escalated,
            stderr,
        };

        match outcome.state {
            TerminalState::Failed => error!(
                session = %self.session,
                exit_code = ?outcome.exit_code,
                stderr = %outcome.stderr,
                "Capture engine failed"
            ),
            state => info!(
                session = %self.session,
                state = %state,
                elapsed_ms = elapsed.as_millis() as u64,
                escalated,
                "Capture finished"
            ),
        }

        if !self.link.commit(outcome) {
            warn!(session = %self.session, "Terminal state already committed");
        }

        self.sessions.remove(&self.session);
    }

    /// Race process exit against the stop signals; the first one decides
    async fn race(&mut self) -> (TerminalState, Option<ExitStatus>, bool) {
        let deadline = self.deadline;
        let ceiling = self.ceiling;
        let cancel = &mut self.link.cancel;

        let event = tokio::select! {
            biased;
            status = self.child.wait() => Event::Exited(status),
            _ = cancelled(cancel) => Event::Cancelled,
            _ = deadline_reached(deadline) => Event::DurationElapsed,
            _ = sleep_until(ceiling.into()) => Event::Ceiling,
        };

        match event {
            Event::Exited(Ok(status)) => {
                debug!(session = %self.session, status = %status, "Engine exited");
                (classify(status), Some(status), false)
            }
            Event::Exited(Err(e)) => {
                error!(session = %self.session, error = %e, "Lost track of engine process");
                (TerminalState::Failed, None, false)
            }
            Event::Cancelled => {
                info!(session = %self.session, "Stopping capture: cancelled");
                let (status, escalated) = self.terminate().await;
                (TerminalState::Cancelled, status, escalated)
            }
            Event::DurationElapsed => {
                info!(session = %self.session, "Stopping capture: duration elapsed");
                let (status, escalated) = self.terminate().await;
                (TerminalState::TimedOut, status, escalated)
            }
            Event::Ceiling => {
                warn!(session = %self.session, "Safety ceiling reached, killing engine");
                let status = self.kill().await;
                (TerminalState::TimedOut, status, true)
            }
        }
    }

    /// SIGTERM, then SIGKILL if the engine outlives the grace window
    async fn terminate(&mut self) -> (Option<ExitStatus>, bool) {
        if let Ok(Some(status)) = self.child.try_wait() {
            return (Some(status), false);
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            signal_group(pid, libc::SIGTERM);
            if let Ok(Ok(status)) = timeout(self.grace, self.child.wait()).await {
                return (Some(status), false);
            }
            warn!(
                session = %self.session,
                grace_ms = self.grace.as_millis() as u64,
                "Engine ignored graceful termination, escalating"
            );
        }

        (self.kill().await, true)
    }

    async fn kill(&mut self) -> Option<ExitStatus> {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            signal_group(pid, libc::SIGKILL);
        }
        if let Err(e) = self.child.kill().await {
            debug!(session = %self.session, error = %e, "Kill after exit");
        }
        self.child.wait().await.ok()
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let requested = cancel.wait_for(|c| *c).await.is_ok();
    if !requested {
        // every handle is gone, nobody can cancel any more
        std::future::pending::<()>().await;
    }
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at.into()).await,
        None => std::future::pending::<()>().await,
    }
}

/// Signal the engine's process group (the engine leads its own group)
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc != 0 {
        // group already gone; fall back to the leader alone
        // SAFETY: as above
        unsafe { libc::kill(pid, signal) };
    }
}

/// Map an engine exit status to a terminal state
pub(crate) fn classify(status: ExitStatus) -> TerminalState {
    if status.success() {
        return TerminalState::Completed;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return if signal == libc::SIGINT || signal == libc::SIGTERM {
                TerminalState::Cancelled
            } else {
                TerminalState::Failed
            };
        }
    }

    match status.code() {
        // shells report death by SIGINT/SIGTERM as 128 + signal
        Some(130) | Some(143) => TerminalState::Cancelled,
        _ => TerminalState::Failed,
    }
}

/// Read engine stderr, keeping at most `limit` bytes from the end
async fn read_stderr(pipe: ChildStderr, limit: usize, pid: Option<u32>, verbose: bool) -> String {
    let mut reader = BufReader::new(pipe);
    let mut tail = String::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if verbose {
                    info!(pid = ?pid, "{}", text);
                } else {
                    debug!(pid = ?pid, "{}", text);
                }
                tail.push_str(text);
                tail.push('\n');
                keep_tail(&mut tail, limit);
            }
            Err(e) => {
                debug!(pid = ?pid, error = %e, "Stopped reading engine stderr");
                break;
            }
        }
    }

    tail.trim_end().to_string()
}

fn keep_tail(buf: &mut String, limit: usize) {
    if buf.len() <= limit {
        return;
    }
    let mut cut = buf.len() - limit;
    while !buf.is_char_boundary(cut) {
        cut += 1;
    }
    buf.drain(..cut);
}

async fn collect_stderr(handle: &mut Option<JoinHandle<String>>, wait: Duration) -> String {
    let Some(mut task) = handle.take() else {
        return String::new();
    };
    match timeout(wait, &mut task).await {
        Ok(Ok(tail)) => tail,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            // a stray grandchild still holds the pipe open
            task.abort();
            String::new()
        }
    }
}
