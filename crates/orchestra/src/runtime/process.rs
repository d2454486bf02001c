//! Managed process abstraction

use crate::runtime::completion::Completion;
use crate::runtime::exit::{ExitError, ExitInfo};
use crate::runtime::lock;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

/// Callback invoked once when a process exits, before waiters are released
pub type ExitCallback = Arc<dyn Fn(&ExitInfo) + Send + Sync>;

/// Configuration for spawning a process
#[derive(Debug, Clone, Default)]
pub struct ProcessConfig {
    /// Process name (for logging)
    pub name: String,
    /// Executable path, or the command line when `shell` is set
    pub executable: String,
    /// Command line arguments
    pub args: Vec<String>,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Working directory
    pub working_dir: Option<PathBuf>,
    /// Run the command line through the platform shell
    pub shell: bool,
    /// Prefix for forwarded output lines (defaults to the name)
    pub label: Option<String>,
}

impl ProcessConfig {
    /// Configuration for a direct executable invocation
    pub fn new(name: impl Into<String>, executable: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            ..Default::default()
        }
    }

    /// Configuration for a command line run through `sh -c` (`cmd /c` on Windows)
    pub fn shell(name: impl Into<String>, command_line: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executable: command_line.into(),
            shell: true,
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Full command line, as shown in logs
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.executable.clone()
        } else {
            format!("{} {}", self.executable, self.args.join(" "))
        }
    }

    fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }

    fn command(&self) -> Command {
        let mut cmd = if self.shell {
            let (shell, flag) = shell_base_command();
            let mut cmd = Command::new(shell);
            cmd.arg(flag).arg(self.command_line());
            cmd
        } else {
            let mut cmd = Command::new(&self.executable);
            cmd.args(&self.args);
            cmd
        };

        cmd.envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group, so stop signals reach everything a shell spawned
        #[cfg(unix)]
        cmd.process_group(0);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        cmd
    }
}

/// Shell and flag used to run a command line
fn shell_base_command() -> (&'static str, &'static str) {
    if cfg!(windows) {
        ("cmd", "/c")
    } else {
        ("sh", "-c")
    }
}

struct KillRequest {
    force: bool,
    ack: oneshot::Sender<std::io::Result<()>>,
}

enum State {
    /// Not started yet
    Pending,
    /// Spawned; the exit watcher owns the child
    Running {
        kill_tx: mpsc::UnboundedSender<KillRequest>,
    },
    /// Exit information captured (or stopped before it was ever started)
    Exited,
}

struct Inner {
    config: ProcessConfig,
    state: Mutex<State>,
    pid: Mutex<Option<u32>>,
    started: AtomicBool,
    stopped: AtomicBool,
    on_exit: Mutex<Option<ExitCallback>>,
    exit: Completion<ExitInfo>,
}

impl Inner {
    fn finish(&self, info: ExitInfo) {
        let callback = lock(&self.on_exit).clone();
        if let Some(callback) = callback {
            callback(&info);
        }
        self.exit.complete(info);
    }
}

/// A child process with background exit capture.
///
/// Handles are cheap to clone; all clones observe the same process. A process
/// is started at most once and never reused after it exits.
#[derive(Clone)]
pub struct Process {
    inner: Arc<Inner>,
}

impl Process {
    /// Create a new process without starting it
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::Pending),
                pid: Mutex::new(None),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                on_exit: Mutex::new(None),
                exit: Completion::new(),
            }),
        }
    }

    /// Create and immediately start a process
    pub fn spawn(config: ProcessConfig) -> Result<Self, ProcessError> {
        let process = Self::new(config);
        process.start()?;
        Ok(process)
    }

    /// Set the callback invoked when the process exits
    pub fn with_exit_callback(self, callback: ExitCallback) -> Self {
        *lock(&self.inner.on_exit) = Some(callback);
        self
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.inner.config
    }

    /// Process ID, once spawned
    pub fn pid(&self) -> Option<u32> {
        *lock(&self.inner.pid)
    }

    /// Start the process if it has not been started yet.
    ///
    /// Must be called from within a tokio runtime. On spawn failure the
    /// process is left not-started.
    pub fn start(&self) -> Result<(), ProcessError> {
        let mut state = lock(&self.inner.state);
        if !matches!(*state, State::Pending) {
            return Ok(());
        }

        let config = &self.inner.config;
        log::info!("[{}] Starting: {}", config.name, config.command_line());

        let mut child = config.command().spawn().map_err(|source| {
            log::error!("[{}] Failed to spawn process: {}", config.name, source);
            ProcessError::SpawnFailed {
                name: config.name.clone(),
                source,
            }
        })?;

        let pid = child.id();
        log::debug!("[{}] Process started with PID: {:?}", config.name, pid);
        *lock(&self.inner.pid) = pid;
        self.inner.started.store(true, Ordering::SeqCst);

        forward_output(config.label(), &mut child);

        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        *state = State::Running { kill_tx };
        drop(state);

        tokio::spawn(watch_exit(Arc::clone(&self.inner), child, kill_rx));
        Ok(())
    }

    /// Wait for the process to exit. Every call returns the same exit information.
    pub async fn wait(&self) -> ExitInfo {
        self.inner.exit.wait().await
    }

    /// Request the process to terminate without waiting for it to exit.
    ///
    /// Returns once the signal has been delivered by the exit watcher, which
    /// owns the child. `force` sends SIGKILL instead of a graceful termination
    /// request. The stopped flag is set before signaling, so the exit is never
    /// reported as an error. No-op if the process already exited.
    pub async fn kill(&self, force: bool) -> Result<(), ProcessError> {
        let kill_tx = {
            let mut state = lock(&self.inner.state);
            match &*state {
                State::Exited => return Ok(()),
                State::Running { kill_tx } => {
                    self.inner.stopped.store(true, Ordering::SeqCst);
                    kill_tx.clone()
                }
                State::Pending => {
                    self.inner.stopped.store(true, Ordering::SeqCst);
                    *state = State::Exited;
                    drop(state);

                    log::debug!("[{}] Stopped before being started", self.name());
                    self.inner.finish(ExitInfo::stopped());
                    return Ok(());
                }
            }
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if kill_tx.send(KillRequest { force, ack: ack_tx }).is_err() {
            return Ok(());
        }

        match ack_rx.await {
            Ok(result) => result.map_err(|source| ProcessError::SignalFailed {
                name: self.name().to_string(),
                source,
            }),
            // The process exited before the request was handled
            Err(_) => Ok(()),
        }
    }

    /// Kill the process and wait for it to exit
    pub async fn stop(&self, force: bool) -> Result<ExitInfo, ProcessError> {
        self.kill(force).await?;
        Ok(self.wait().await)
    }

    pub fn started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Check if the exit information has been captured
    pub fn exited(&self) -> bool {
        self.inner.exit.is_complete()
    }

    /// Check if the process was stopped through this handle
    pub fn stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Exit information, if the process has exited
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.inner.exit.get()
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("name", &self.inner.config.name)
            .field("pid", &self.pid())
            .field("started", &self.started())
            .field("stopped", &self.stopped())
            .field("exited", &self.exited())
            .finish()
    }
}

/// Forward stdout/stderr lines to the log
fn forward_output(label: &str, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, label.to_string(), log::Level::Info));
    }

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, label.to_string(), log::Level::Warn));
    }
}

/// Log every line of `pipe` until it closes.
///
/// Lines are read as raw bytes so non-UTF-8 output never closes the pipe
/// early (the child would get SIGPIPE on its next write).
async fn forward_lines<R>(pipe: R, label: String, level: log::Level)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                log::log!(level, "[{}] {}", label, line.trim_end_matches(['\n', '\r']));
            }
            Err(e) => {
                log::debug!("[{}] Stopped reading output: {}", label, e);
                break;
            }
        }
    }
}

/// Owns the child until it exits, serving kill requests meanwhile
async fn watch_exit(
    inner: Arc<Inner>,
    mut child: Child,
    mut kill_rx: mpsc::UnboundedReceiver<KillRequest>,
) {
    let result = loop {
        tokio::select! {
            result = child.wait() => break result,
            Some(request) = kill_rx.recv() => {
                let outcome = if request.force {
                    force_stop(&mut child)
                } else {
                    graceful_stop(&child)
                };
                let _ = request.ack.send(outcome);
            }
        }
    };

    // Read the stopped flag under the state lock: a concurrent `kill` either
    // sees `Exited` or has already set the flag
    let stopped = {
        let mut state = lock(&inner.state);
        *state = State::Exited;
        inner.stopped.load(Ordering::SeqCst)
    };

    let mut info = ExitInfo {
        stopped,
        ..Default::default()
    };

    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            if !stopped {
                info.code = status.code().unwrap_or(-1);
                info.error = Some(ExitError::from_status(status));
            }
        }
        Err(e) => {
            if !stopped {
                info.error = Some(ExitError::Wait(e.to_string()));
            }
        }
    }

    let name = &inner.config.name;
    if info.has_error() {
        log::warn!("[{}] Process exited with error: {:?}", name, info.error);
    } else if stopped {
        log::info!("[{}] Process stopped", name);
    } else {
        log::info!("[{}] Process exited with code: {}", name, info.code);
    }

    inner.finish(info);
}

/// Ask the process (group) to terminate: SIGTERM on Unix, `taskkill` on Windows
#[cfg(unix)]
fn graceful_stop(child: &Child) -> std::io::Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => killpg(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(Into::into),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn graceful_stop(child: &Child) -> std::io::Result<()> {
    match child.id() {
        Some(pid) => std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string()])
            .spawn()
            .map(|_| ()),
        None => Ok(()),
    }
}

/// Terminate immediately, including everything in the process group
fn force_stop(child: &mut Child) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if killpg(Pid::from_raw(pid as i32), Signal::SIGKILL).is_ok() {
                return Ok(());
            }
        }
    }

    child.start_kill()
}

/// Errors that can occur with managed processes
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn process '{name}': {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal process '{name}': {source}")]
    SignalFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_clean_exit() {
        let process = Process::spawn(ProcessConfig::shell("ok", "true")).unwrap();
        let info = process.wait().await;
        assert_eq!(info, ExitInfo::default());
        assert!(process.started());
        assert!(process.exited());
        assert!(!process.stopped());
    }

    #[tokio::test]
    async fn test_exit_code_is_captured() {
        let process = Process::spawn(ProcessConfig::shell("fail", "exit 3")).unwrap();
        let info = process.wait().await;
        assert_eq!(info.code, 3);
        assert_eq!(info.error, Some(ExitError::Code(3)));
        assert!(info.has_error());
    }

    #[tokio::test]
    async fn test_wait_is_idempotent() {
        let process = Process::spawn(ProcessConfig::shell("fail", "exit 7")).unwrap();
        let first = process.wait().await;
        let second = process.wait().await;
        let third = process.clone().wait().await;
        assert_eq!(first, second);
        assert_eq!(second, third);
    }

    #[tokio::test]
    async fn test_stop_suppresses_error() {
        let process = Process::spawn(ProcessConfig::new("sleep", "sleep").with_args(["10"])).unwrap();
        let info = process.stop(false).await.unwrap();
        assert!(info.stopped);
        assert!(!info.has_error());
        assert!(process.stopped());
    }

    #[tokio::test]
    async fn test_force_stop_ignores_sigterm() {
        let process =
            Process::spawn(ProcessConfig::shell("stubborn", "trap '' TERM; sleep 60")).unwrap();
        let begin = Instant::now();
        let info = process.stop(true).await.unwrap();
        assert!(begin.elapsed() < Duration::from_secs(5));
        assert!(!info.has_error());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let process = Process::new(ProcessConfig::shell("once", "true"));
        process.start().unwrap();
        let pid = process.pid();
        process.start().unwrap();
        assert_eq!(process.pid(), pid);
        process.wait().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_not_started() {
        let process = Process::new(ProcessConfig::new("missing", "/nonexistent/binary"));
        let err = process.start().unwrap_err();
        assert!(matches!(err, ProcessError::SpawnFailed { .. }));
        assert!(!process.started());
        assert!(!process.exited());
    }

    #[tokio::test]
    async fn test_kill_before_start_is_terminal() {
        let process = Process::new(ProcessConfig::shell("never", "true"));
        let info = process.stop(false).await.unwrap();
        assert_eq!(info, ExitInfo::stopped());
        process.start().unwrap();
        assert!(!process.started());
    }

    #[tokio::test]
    async fn test_kill_after_exit_is_noop() {
        let process = Process::spawn(ProcessConfig::shell("fail", "exit 1")).unwrap();
        process.wait().await;
        process.kill(true).await.unwrap();
        let info = process.wait().await;
        assert!(info.has_error());
        assert!(!process.stopped());
    }

    #[tokio::test]
    async fn test_exit_callback_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let process = Process::new(ProcessConfig::shell("cb", "exit 0")).with_exit_callback(
            Arc::new(move |info: &ExitInfo| {
                assert!(!info.has_error());
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        process.start().unwrap();
        process.wait().await;
        process.wait().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_command_line() {
        let config = ProcessConfig::new("ls", "ls").with_args(["-l", "/tmp"]);
        assert_eq!(config.command_line(), "ls -l /tmp");
        assert_eq!(config.label(), "ls");
        assert_eq!(config.with_label("files").label(), "files");
    }
}
