//! Helper process lifecycle.
//!
//! # States
//!
//! ```text
//! NotStarted ──start──▶ Starting ──200ms──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!                          │                                                 ▲
//!                          └──────────── exited during settle ───────────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Delay before a freshly spawned process counts as running.
pub const SETTLE_DELAY: Duration = Duration::from_millis(200);

/// Time a terminated process gets before it is killed.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

// ============================================================================
// ProcessState
// ============================================================================

/// Lifecycle state of a [`ProxyProcess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Never started.
    NotStarted,
    /// Spawned, waiting out the settle delay.
    Starting,
    /// Spawned and alive after the settle delay.
    Running,
    /// Termination requested.
    Stopping,
    /// Exited or stopped.
    Stopped,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// ============================================================================
// ProxyProcess
// ============================================================================

/// One helper child process, such as `ios_webkit_debug_proxy`.
///
/// The child is killed when the handle is dropped.
pub struct ProxyProcess {
    program: PathBuf,
    args: Vec<String>,
    state: ProcessState,
    child: Option<Child>,
    pid: Option<u32>,
}

impl fmt::Debug for ProxyProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyProcess")
            .field("program", &self.program)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl ProxyProcess {
    /// Creates a handle; nothing is spawned yet.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            state: ProcessState::NotStarted,
            child: None,
            pid: None,
        }
    }

    /// Executable this handle launches.
    #[inline]
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Process id of the live child.
    #[inline]
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns `true` if the child is alive.
    ///
    /// Moves to [`ProcessState::Stopped`] if it exited on its own.
    pub fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };

        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                info!(pid = ?self.pid, %status, "Proxy process exited");
                self.child = None;
                self.pid = None;
                self.state = ProcessState::Stopped;
                false
            }
            Err(e) => {
                warn!(pid = ?self.pid, error = %e, "Failed to poll proxy process");
                false
            }
        }
    }

    /// Spawns the child and waits [`SETTLE_DELAY`].
    ///
    /// # Errors
    ///
    /// - [`Error::ProcessAlreadyRunning`] while starting or running
    /// - [`Error::ProcessLaunchFailed`] if spawning fails or the child exits
    ///   during the settle delay
    pub async fn start(&mut self) -> Result<()> {
        if matches!(self.state, ProcessState::Starting | ProcessState::Running) && self.is_running() {
            return Err(Error::ProcessAlreadyRunning {
                pid: self.pid.unwrap_or_default(),
            });
        }

        self.state = ProcessState::Starting;

        let mut child = match self.command().spawn() {
            Ok(child) => child,
            Err(e) => {
                self.state = ProcessState::Stopped;
                return Err(Error::process_launch_failed(format!(
                    "{}: {e}",
                    self.program.display()
                )));
            }
        };

        let pid = child.id();
        debug!(program = %self.program.display(), ?pid, "Proxy process spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(log_lines(stdout, "stdout", pid));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_lines(stderr, "stderr", pid));
        }

        self.child = Some(child);
        self.pid = pid;

        sleep(SETTLE_DELAY).await;

        if !self.is_running() {
            self.state = ProcessState::Stopped;
            return Err(Error::process_launch_failed(format!(
                "{} exited during startup",
                self.program.display()
            )));
        }

        self.state = ProcessState::Running;
        info!(program = %self.program.display(), ?pid, "Proxy process running");
        Ok(())
    }

    /// Terminates the child, killing it after [`STOP_GRACE`].
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            if self.state != ProcessState::NotStarted {
                self.state = ProcessState::Stopped;
            }
            return;
        };

        self.state = ProcessState::Stopping;
        let pid = self.pid.take();
        debug!(?pid, "Stopping proxy process");

        terminate(&mut child, pid);

        match timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!(?pid, %status, "Proxy process exited"),
            Ok(Err(e)) => warn!(?pid, error = %e, "Failed to wait for proxy process"),
            Err(_) => {
                warn!(?pid, "Proxy process ignored SIGTERM, killing");
                if let Err(e) = child.kill().await {
                    warn!(?pid, error = %e, "Failed to kill proxy process");
                }
            }
        }

        self.state = ProcessState::Stopped;
        info!(?pid, "Proxy process stopped");
    }

    /// Stops and starts the child again.
    ///
    /// # Errors
    ///
    /// Same as [`ProxyProcess::start`].
    pub async fn refresh(&mut self) -> Result<()> {
        self.stop().await;
        self.start().await
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);

        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }
}

impl Drop for ProxyProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take()
            && let Err(e) = child.start_kill()
        {
            debug!(pid = ?self.pid, error = %e, "Failed to send kill signal in Drop");
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

#[cfg(unix)]
fn terminate(child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };

    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM failed, killing");
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _pid: Option<u32>) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Failed to kill proxy process");
    }
}

async fn log_lines<R>(stream: R, name: &'static str, pid: Option<u32>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(?pid, stream = name, "{line}");
    }
}

// ============================================================================
// Tests
// ============================================================================
