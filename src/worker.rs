//! Supervision of a single worker child process
//!
//! A worker moves through `absent -> spawning -> ready -> busy -> ready`
//! during normal operation and through `quitting -> absent` on the way
//! down. Readiness is negotiated over a FIFO: the child opens the pipe's
//! write side and closes it once its socket is listening, then holds the
//! read side open; the supervisor reads to EOF and reopens the pipe for
//! writing, and that successful open marks the worker ready. Bytes written
//! to the pipe before the close are a boot-failure report.

use std::collections::HashMap;
use std::ffi::CString;
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::client::{CloseGuard, Connection};
use crate::error::WorkerError;

/// Program looked up on PATH to host workers.
pub const WORKER_PROGRAM: &str = "rackgate-worker";

/// Environment variable that overrides worker program discovery.
pub const WORKER_PROGRAM_ENV: &str = "RACKGATE_WORKER";

/// Capacity of the per-worker event channel.
const EVENT_CAPACITY: usize = 64;

/// State of a supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    /// No child process; owns no OS resources
    #[default]
    Absent,
    /// Child spawned, handshake pipe not yet completed
    Spawning,
    /// Live child with a writable handshake pipe, accepting an exchange
    Ready,
    /// Exactly one exchange in flight
    Busy,
    /// Graceful or forcible shutdown initiated
    Quitting,
}

/// Notifications emitted as a worker moves through its lifecycle.
///
/// Events are sent after the state field has been updated, so a listener
/// reading `Worker::state` always observes the post-transition value.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Spawn was requested and the child is starting
    Spawning,
    /// The child signalled that its socket is listening
    Spawned,
    /// The worker can accept an exchange
    Ready,
    /// An exchange was claimed
    Busy,
    /// The idle timer expired; a graceful quit follows
    Idle,
    /// Shutdown was initiated
    Quitting,
    /// The child exited with the given code
    Exit(Option<i32>),
    /// A supervision or boot error occurred
    Error(WorkerError),
}

/// Spawn options for a single worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Working directory for the child
    pub cwd: Option<PathBuf>,
    /// Environment overrides merged over the inherited environment
    pub env: HashMap<String, String>,
    /// Quit the worker after this long without a new exchange
    pub idle: Option<Duration>,
    /// Pass `--debug` to the worker program
    pub debug: bool,
}

#[derive(Default)]
struct Inner {
    state: WorkerState,
    pid: Option<u32>,
    socket_path: Option<PathBuf>,
    pipe_path: Option<PathBuf>,
    /// Write end of the handshake pipe; dropping it tells the child the
    /// supervisor is gone.
    heartbeat: Option<std::fs::File>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    idle_timer: Option<AbortHandle>,
}

/// One supervised worker process.
pub struct Worker {
    config: PathBuf,
    options: WorkerOptions,
    inner: Mutex<Inner>,
    events: broadcast::Sender<WorkerEvent>,
}

impl Worker {
    /// Create a worker in the `absent` state. Nothing is spawned until
    /// [`spawn`](Worker::spawn) or [`create_connection`](Worker::create_connection).
    pub fn new(config: impl AsRef<Path>, options: WorkerOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            config: config.as_ref().to_path_buf(),
            options,
            inner: Mutex::new(Inner::default()),
            events,
        })
    }

    pub fn state(&self) -> WorkerState {
        self.inner.lock().state
    }

    pub fn is_alive(&self) -> bool {
        self.state() != WorkerState::Absent
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Path of the worker's listening socket, while a child is running.
    pub fn socket_path(&self) -> Option<PathBuf> {
        self.inner.lock().socket_path.clone()
    }

    /// Take the child's stdout stream. Available once per spawn.
    pub fn take_stdout(&self) -> Option<ChildStdout> {
        self.inner.lock().stdout.take()
    }

    /// Take the child's stderr stream. Available once per spawn.
    pub fn take_stderr(&self) -> Option<ChildStderr> {
        self.inner.lock().stderr.take()
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }

    /// Spawn the child process. Refused unless the worker is `absent`.
    pub async fn spawn(self: &Arc<Self>) -> Result<(), WorkerError> {
        {
            let mut inner = self.inner.lock();
            if inner.state != WorkerState::Absent {
                return Err(WorkerError::InvalidState("spawn requires an absent worker"));
            }
            inner.state = WorkerState::Spawning;
        }
        self.emit(WorkerEvent::Spawning);

        if let Err(e) = self.spawn_inner().await {
            {
                let mut inner = self.inner.lock();
                if inner.pid.is_none() {
                    inner.state = WorkerState::Absent;
                }
            }
            self.emit(WorkerEvent::Error(e.clone()));
            return Err(e);
        }
        Ok(())
    }

    async fn spawn_inner(self: &Arc<Self>) -> Result<(), WorkerError> {
        if !self.config.exists() {
            return Err(WorkerError::ConfigMissing(self.config.clone()));
        }
        let program = worker_program()?;

        let stem = format!(
            "rackgate.{}.{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        );
        let socket_path = std::env::temp_dir().join(format!("{}.sock", stem));
        let pipe_path = std::env::temp_dir().join(format!("{}.pipe", stem));
        mkfifo(&pipe_path)?;

        let mut cmd = Command::new(&program);
        cmd.arg("--file").arg(&socket_path);
        cmd.arg("--pipe").arg(&pipe_path);
        if self.options.debug {
            cmd.arg("--debug");
        }
        cmd.arg(&self.config);
        if let Some(cwd) = &self.options.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&self.options.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = std::fs::remove_file(&pipe_path);
                return Err(WorkerError::SpawnIo(Arc::new(e)));
            }
        };
        let pid = child.id();
        debug!(pid, config = %self.config.display(), "worker spawned");

        {
            let mut inner = self.inner.lock();
            inner.pid = pid;
            inner.socket_path = Some(socket_path);
            inner.pipe_path = Some(pipe_path.clone());
            inner.stdout = child.stdout.take();
            inner.stderr = child.stderr.take();
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.handshake(pipe_path).await });
        let this = Arc::clone(self);
        tokio::spawn(async move { this.monitor(child).await });
        Ok(())
    }

    /// Drive the FIFO handshake for the current spawn.
    async fn handshake(self: Arc<Self>, pipe: PathBuf) {
        if self.state() != WorkerState::Spawning {
            return;
        }

        // Blocks until the child opens the write end, then collects
        // anything written before the close.
        let read_side = {
            let pipe = pipe.clone();
            tokio::task::spawn_blocking(move || -> io::Result<Vec<u8>> {
                let mut report = Vec::new();
                std::fs::File::open(&pipe)?.read_to_end(&mut report)?;
                Ok(report)
            })
        };
        let report = match read_side.await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                if self.state() == WorkerState::Spawning {
                    self.emit(WorkerEvent::Error(WorkerError::SpawnIo(Arc::new(e))));
                }
                return;
            }
            Err(_) => return,
        };

        if !report.is_empty() {
            let message = String::from_utf8_lossy(&report).trim().to_string();
            warn!(config = %self.config.display(), message = %message, "worker boot failed");
            self.emit(WorkerEvent::Error(WorkerError::SpawnFailed(message)));
            return;
        }

        // An empty read is also what the unstick poke produces when the
        // child dies before ever opening the pipe; only a worker still
        // spawning may treat it as the ready signal.
        if self.state() != WorkerState::Spawning {
            return;
        }

        // Reopen for writing; completes once the child holds the read side.
        let write_side =
            tokio::task::spawn_blocking(move || std::fs::OpenOptions::new().write(true).open(&pipe));
        let heartbeat = match write_side.await {
            Ok(Ok(file)) => file,
            Ok(Err(e)) => {
                if self.state() == WorkerState::Spawning {
                    self.emit(WorkerEvent::Error(WorkerError::SpawnIo(Arc::new(e))));
                }
                return;
            }
            Err(_) => return,
        };

        {
            let mut inner = self.inner.lock();
            if inner.state != WorkerState::Spawning {
                // Exited or began quitting during the handshake; dropping
                // the write end lets the child observe EOF.
                return;
            }
            inner.heartbeat = Some(heartbeat);
            inner.state = WorkerState::Ready;
        }
        self.emit(WorkerEvent::Spawned);
        self.emit(WorkerEvent::Ready);
    }

    /// Wait for the child to exit and release everything it owned.
    async fn monitor(self: Arc<Self>, mut child: Child) {
        let code = child.wait().await.ok().and_then(|status| status.code());

        let (socket_path, pipe_path) = {
            let mut inner = self.inner.lock();
            if let Some(timer) = inner.idle_timer.take() {
                timer.abort();
            }
            inner.heartbeat = None;
            inner.pid = None;
            inner.stdout = None;
            inner.stderr = None;
            inner.state = WorkerState::Absent;
            (inner.socket_path.take(), inner.pipe_path.take())
        };

        if let Some(pipe) = pipe_path {
            unstick_pipe(&pipe);
            let _ = std::fs::remove_file(&pipe);
        }
        if let Some(socket) = socket_path {
            let _ = std::fs::remove_file(&socket);
        }

        debug!(code, config = %self.config.display(), "worker exited");
        self.emit(WorkerEvent::Exit(code));
    }

    /// Open a framing connection, spawning first if needed. Waits for the
    /// worker to become ready, then claims it for one exchange.
    pub async fn create_connection(self: &Arc<Self>) -> Result<Connection, WorkerError> {
        let mut events = self.subscribe();
        if self.state() == WorkerState::Absent {
            self.spawn().await?;
        }

        loop {
            {
                let mut inner = self.inner.lock();
                match inner.state {
                    WorkerState::Ready => {
                        inner.state = WorkerState::Busy;
                        break;
                    }
                    WorkerState::Quitting => {
                        return Err(WorkerError::InvalidState("worker is shutting down"));
                    }
                    WorkerState::Absent => return Err(WorkerError::ConnectionLost),
                    WorkerState::Spawning | WorkerState::Busy => {}
                }
            }
            match events.recv().await {
                Ok(WorkerEvent::Error(e)) => return Err(e),
                Ok(WorkerEvent::Exit(_)) => return Err(WorkerError::ConnectionLost),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(WorkerError::ConnectionLost)
                }
            }
        }

        self.emit(WorkerEvent::Busy);
        self.arm_idle();

        let socket = self.socket_path().ok_or(WorkerError::ConnectionLost)?;
        match Connection::connect(&socket).await {
            Ok(mut connection) => {
                let this = Arc::clone(self);
                connection.on_close(CloseGuard::new(move || this.exchange_closed()));
                Ok(connection)
            }
            Err(e) => {
                self.exchange_closed();
                Err(e)
            }
        }
    }

    /// Socket closed; the worker can take another exchange.
    fn exchange_closed(&self) {
        let mut inner = self.inner.lock();
        if inner.state == WorkerState::Busy {
            inner.state = WorkerState::Ready;
            drop(inner);
            self.emit(WorkerEvent::Ready);
        }
    }

    /// Rearm the idle timer. Called on every transition into `busy`.
    fn arm_idle(self: &Arc<Self>) {
        let Some(idle) = self.options.idle else {
            return;
        };
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            info!(config = %this.config.display(), idle_secs = idle.as_secs_f64(), "worker idle timeout");
            this.emit(WorkerEvent::Idle);
            this.quit();
        });
        let mut inner = self.inner.lock();
        if let Some(old) = inner.idle_timer.replace(task.abort_handle()) {
            old.abort();
        }
    }

    /// Ask the child to finish its current request and exit (SIGQUIT).
    pub fn quit(&self) {
        self.signal(libc::SIGQUIT);
    }

    /// Force the child to exit immediately (SIGTERM).
    pub fn terminate(&self) {
        self.signal(libc::SIGTERM);
    }

    fn signal(&self, signal: i32) {
        let (pid, first) = {
            let mut inner = self.inner.lock();
            let Some(pid) = inner.pid else { return };
            if inner.state == WorkerState::Absent {
                return;
            }
            let first = inner.state != WorkerState::Quitting;
            inner.state = WorkerState::Quitting;
            (pid, first)
        };
        if first {
            self.emit(WorkerEvent::Quitting);
        }
        debug!(pid, signal, "signalling worker");
        unsafe {
            libc::kill(pid as i32, signal);
        }
    }

    /// Gracefully cycle the child: quit, wait for the exit, spawn again.
    pub async fn restart(self: &Arc<Self>) -> Result<(), WorkerError> {
        let mut events = self.subscribe();
        if self.is_alive() {
            self.quit();
            loop {
                match events.recv().await {
                    Ok(WorkerEvent::Exit(_)) => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if !self.is_alive() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        self.spawn().await
    }
}

static WORKER_PROGRAM_PATH: OnceLock<Option<PathBuf>> = OnceLock::new();

/// Resolve the worker executable. The first successful lookup is cached
/// for the rest of the process.
fn worker_program() -> Result<PathBuf, WorkerError> {
    let found = WORKER_PROGRAM_PATH.get_or_init(|| {
        if let Some(path) = std::env::var_os(WORKER_PROGRAM_ENV) {
            return Some(PathBuf::from(path));
        }
        let path_var = std::env::var_os("PATH")?;
        std::env::split_paths(&path_var)
            .map(|dir| dir.join(WORKER_PROGRAM))
            .find(|candidate| is_executable(candidate))
    });
    found.clone().ok_or(WorkerError::ProgramMissing)
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn mkfifo(path: &Path) -> Result<(), WorkerError> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        WorkerError::SpawnIo(Arc::new(io::Error::new(
            io::ErrorKind::InvalidInput,
            "pipe path contains a NUL byte",
        )))
    })?;
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(WorkerError::SpawnIo(Arc::new(io::Error::last_os_error())));
    }
    Ok(())
}

/// Release a handshake open still blocked on the other end of the FIFO.
fn unstick_pipe(pipe: &Path) {
    use std::os::unix::fs::OpenOptionsExt;
    let _ = std::fs::OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(pipe);
    let _ = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(pipe);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_worker_is_absent() {
        let worker = Worker::new("/tmp/does-not-matter.toml", WorkerOptions::default());
        assert_eq!(worker.state(), WorkerState::Absent);
        assert!(!worker.is_alive());
        assert!(worker.socket_path().is_none());
    }

    #[test]
    fn test_signal_on_absent_worker_is_a_no_op() {
        let worker = Worker::new("/tmp/does-not-matter.toml", WorkerOptions::default());
        let mut events = worker.subscribe();
        worker.quit();
        worker.terminate();
        assert_eq!(worker.state(), WorkerState::Absent);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_spawn_with_missing_config_fails_and_reverts() {
        let worker = Worker::new("/nonexistent/rackgate-config.toml", WorkerOptions::default());
        let mut events = worker.subscribe();

        let err = worker.spawn().await.expect_err("spawn must fail");
        assert!(matches!(err, WorkerError::ConfigMissing(_)));
        assert_eq!(worker.state(), WorkerState::Absent);

        assert!(matches!(events.try_recv(), Ok(WorkerEvent::Spawning)));
        assert!(matches!(
            events.try_recv(),
            Ok(WorkerEvent::Error(WorkerError::ConfigMissing(_)))
        ));
    }

    #[test]
    fn test_is_executable_rejects_directories_and_missing_paths() {
        assert!(!is_executable(Path::new("/tmp")));
        assert!(!is_executable(Path::new("/nonexistent/rackgate-worker")));
    }
}
