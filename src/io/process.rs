//! Process supervision primitives
//!
//! Spawns the language server JVM with piped stdio, drains its stderr, and
//! watches for exit. Knows nothing about LSP; the stdio pipes are handed
//! out as a [`StdioTransport`].

use crate::io::transport::StdioTransport;
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// How long a graceful stop waits for the process before killing it
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);

// ============================================================================
// Launch Command
// ============================================================================

/// Program, arguments and environment of a child process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Layered over the inherited environment
    pub env: Vec<(String, String)>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

// ============================================================================
// Process State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// SIGTERM, then SIGKILL after [`STOP_GRACE_PERIOD`]
    Graceful,
    /// SIGKILL immediately
    Force,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running { pid: u32 },
    /// Exited; `code` is `None` when killed by a signal
    Exited { code: Option<i32> },
}

impl ProcessState {
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

/// Fired once when the process exits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExitEvent {
    pub pid: Option<u32>,
    /// Exit code, `None` when killed by a signal or when waiting failed
    pub code: Option<i32>,
    /// The exit followed a call to `stop`
    pub requested: bool,
}

#[async_trait]
pub trait ProcessExitHandler: Send + Sync {
    async fn on_process_exit(&self, event: ProcessExitEvent);
}

/// Receives the process's stderr, one line at a time
pub trait StderrMonitor: Send + Sync {
    /// Install the handler; must be called before `start`
    ///
    /// Stderr is drained with or without a handler.
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static;
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Process not started")]
    NotStarted,

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Stdin not available")]
    StdinNotAvailable,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,
}

#[async_trait]
pub trait ProcessManager: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn start(&mut self) -> Result<(), Self::Error>;

    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error>;

    fn is_running(&self) -> bool;

    /// Take the transport over the process's stdin/stdout (once)
    fn create_stdio_transport(&mut self) -> Result<StdioTransport, Self::Error>;

    /// Force kill without awaiting, for `Drop`
    fn kill_sync(&mut self);
}

// ============================================================================
// Child Process Manager
// ============================================================================

pub struct ChildProcessManager {
    launch: LaunchCommand,
    state: Arc<Mutex<ProcessState>>,
    stop_requested: Arc<AtomicBool>,
    stdio_transport: Option<StdioTransport>,
    stderr_handler: Option<Arc<dyn Fn(String) + Send + Sync>>,
    stderr_task: Option<JoinHandle<()>>,
    wait_task: Option<JoinHandle<()>>,
    exit_handler: Option<Arc<dyn ProcessExitHandler>>,
}

impl ChildProcessManager {
    pub fn new(launch: LaunchCommand) -> Self {
        Self {
            launch,
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            stdio_transport: None,
            stderr_handler: None,
            stderr_task: None,
            wait_task: None,
            exit_handler: None,
        }
    }

    pub fn with_exit_handler(mut self, handler: Arc<dyn ProcessExitHandler>) -> Self {
        self.exit_handler = Some(handler);
        self
    }

    pub fn launch_command(&self) -> &LaunchCommand {
        &self.launch
    }

    pub fn get_state(&self) -> ProcessState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, new_state: ProcessState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = new_state;
    }

    /// A JVM blocks once its stderr pipe fills, so stderr is always read
    fn spawn_stderr_drain(&mut self, stderr: ChildStderr) {
        let handler = self.stderr_handler.clone();

        self.stderr_task = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim_end();
                        if line.is_empty() {
                            continue;
                        }
                        match &handler {
                            Some(handler) => handler(line.to_string()),
                            None => trace!("stderr: {}", line),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Stopped reading stderr: {}", e);
                        break;
                    }
                }
            }
            trace!("ChildProcessManager: stderr closed");
        }));
    }

    fn spawn_wait_task(&mut self, mut child: Child, pid: u32) {
        let exit_handler = self.exit_handler.clone();
        let state = Arc::clone(&self.state);
        let stop_requested = Arc::clone(&self.stop_requested);

        self.wait_task = Some(tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => {
                    debug!("Process {} exited: {}", pid, status);
                    status.code()
                }
                Err(e) => {
                    error!("Waiting for process {} failed: {}", pid, e);
                    None
                }
            };
            *state.lock().unwrap_or_else(PoisonError::into_inner) = ProcessState::Exited { code };

            if let Some(handler) = &exit_handler {
                handler
                    .on_process_exit(ProcessExitEvent {
                        pid: Some(pid),
                        code,
                        requested: stop_requested.load(Ordering::SeqCst),
                    })
                    .await;
            }
        }));
    }

    #[cfg(unix)]
    fn signal(pid: u32, mode: StopMode) {
        let signal = match mode {
            StopMode::Graceful => libc::SIGTERM,
            StopMode::Force => libc::SIGKILL,
        };
        // SAFETY: kill(2) has no memory-safety preconditions; a stale pid only yields ESRCH.
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc != 0 {
            trace!("Signal to process {} failed, it has likely exited", pid);
        }
    }

    #[cfg(not(unix))]
    fn signal(pid: u32, _mode: StopMode) {
        warn!("Process termination for PID {} is only implemented on unix", pid);
    }
}

#[async_trait]
impl ProcessManager for ChildProcessManager {
    type Error = ProcessError;

    async fn start(&mut self) -> Result<(), Self::Error> {
        if self.is_running() {
            return Err(ProcessError::AlreadyStarted);
        }

        info!(
            "Starting {} with {} argument(s)",
            self.launch.program.display(),
            self.launch.args.len()
        );
        trace!("Arguments: {:?}", self.launch.args);

        let mut child = self.launch.command().spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| ProcessError::Io(io::Error::other("Failed to get process ID")))?;

        let stdin = child.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::StderrNotAvailable)?;

        info!("Process started with PID {}", pid);
        self.stop_requested.store(false, Ordering::SeqCst);
        self.set_state(ProcessState::Running { pid });
        self.stdio_transport = Some(StdioTransport::new(stdin, stdout));
        self.spawn_stderr_drain(stderr);
        self.spawn_wait_task(child, pid);
        Ok(())
    }

    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error> {
        let pid = self.get_state().pid().ok_or(ProcessError::NotStarted)?;
        info!("Stopping process {} ({:?})", pid, mode);
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stdio_transport = None;

        Self::signal(pid, mode);
        if let Some(mut wait_task) = self.wait_task.take()
            && tokio::time::timeout(STOP_GRACE_PERIOD, &mut wait_task)
                .await
                .is_err()
        {
            warn!(
                "Process {} still running after {:?}, killing it",
                pid, STOP_GRACE_PERIOD
            );
            Self::signal(pid, StopMode::Force);
            let _ = tokio::time::timeout(STOP_GRACE_PERIOD, wait_task).await;
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        if self.get_state().is_running() {
            self.set_state(ProcessState::Exited { code: None });
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.get_state().is_running()
    }

    fn create_stdio_transport(&mut self) -> Result<StdioTransport, Self::Error> {
        self.stdio_transport.take().ok_or(ProcessError::NotStarted)
    }

    fn kill_sync(&mut self) {
        let Some(pid) = self.get_state().pid() else {
            return;
        };
        debug!("Force killing process {} on drop", pid);
        self.stop_requested.store(true, Ordering::SeqCst);
        Self::signal(pid, StopMode::Force);
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        self.set_state(ProcessState::Exited { code: None });
    }
}

impl StderrMonitor for ChildProcessManager {
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Arc::new(handler));
    }
}

impl Drop for ChildProcessManager {
    fn drop(&mut self) {
        self.kill_sync();
    }
}
