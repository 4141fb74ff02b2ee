//! Worker session - owns the worker process and the framed pipes to it.
//!
//! Lifecycle:
//! 1. `start()` launches the worker (stdin/stdout piped, stderr inherited)
//! 2. `initialize()` performs the mandatory handshake
//! 3. `exchange()` writes one request frame and reads exactly one reply frame
//! 4. `terminate()` closes stdin, signals the process, and reaps it
//!
//! Every method takes `&mut self`: the worker protocol has no request IDs, so a
//! second exchange started before the first reply is read would interleave frames.
//! Callers share a session through the request serializer, never directly.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{CodecError, FrameCodec};
use crate::bridge::protocol::Message;
use crate::error::BridgeError;
use crate::health::{SessionSnapshot, SessionState};

/// Where the worker launch script lives unless configured otherwise.
pub const DEFAULT_WORKER_PATH: &str = "./cpp/build/start_host.sh";

pub type WorkerInput = Box<dyn AsyncWrite + Send + Unpin>;
pub type WorkerOutput = Box<dyn AsyncRead + Send + Unpin>;

/// A launched worker: its pipes and, for real processes, the child handle.
pub struct WorkerProcess {
    pub child: Option<Child>,
    pub stdin: WorkerInput,
    pub stdout: WorkerOutput,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StartError {
    #[error("worker not found at {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to spawn worker {}: {reason}", .path.display())]
    SpawnFailed { path: PathBuf, reason: String },
}

/// Extension point for how the worker gets launched.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<WorkerProcess, StartError>;
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Working directory for the worker; relative program paths resolve against it.
    pub working_dir: Option<PathBuf>,
    /// How long a terminated worker gets to exit before it is killed.
    pub terminate_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_WORKER_PATH),
            args: Vec::new(),
            working_dir: None,
            terminate_grace: Duration::from_secs(2),
        }
    }
}

impl SessionConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }
}

/// Launches the configured program as a child process.
pub struct ProcessSpawner {
    config: SessionConfig,
}

impl ProcessSpawner {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    fn resolved_program(&self) -> PathBuf {
        let program = &self.config.program;
        match &self.config.working_dir {
            Some(dir) if program.is_relative() && is_path_like(program) => dir.join(program),
            _ => program.clone(),
        }
    }
}

/// Bare names (`python`) go through PATH lookup; anything with a separator is a path.
fn is_path_like(program: &Path) -> bool {
    program.is_absolute() || program.components().count() > 1
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self) -> Result<WorkerProcess, StartError> {
        let mut program = self.resolved_program();
        if is_path_like(&program) {
            if !program.exists() {
                tracing::error!(path = %program.display(), "Worker not found");
                return Err(StartError::NotFound(program));
            }
            // The child's working directory may differ from ours.
            if let Ok(absolute) = std::fs::canonicalize(&program) {
                program = absolute;
            }
        }

        let mut command = Command::new(&program);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StartError::NotFound(program.clone()),
            _ => StartError::SpawnFailed {
                path: program.clone(),
                reason: e.to_string(),
            },
        })?;

        let stdin = child.stdin.take().ok_or_else(|| StartError::SpawnFailed {
            path: program.clone(),
            reason: "stdin not captured".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| StartError::SpawnFailed {
            path: program.clone(),
            reason: "stdout not captured".to_string(),
        })?;

        Ok(WorkerProcess {
            child: Some(child),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
        })
    }
}

pub struct WorkerSession {
    spawner: Arc<dyn WorkerSpawner>,
    terminate_grace: Duration,
    child: Option<Child>,
    writer: Option<FramedWrite<WorkerInput, FrameCodec>>,
    reader: Option<FramedRead<WorkerOutput, FrameCodec>>,
    state: SessionState,
    failure: Option<BridgeError>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl WorkerSession {
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());
        Self {
            spawner,
            terminate_grace: SessionConfig::default().terminate_grace,
            child: None,
            writer: None,
            reader: None,
            state: SessionState::NotStarted,
            failure: None,
            snapshot_tx,
        }
    }

    /// Session around a [`ProcessSpawner`] for `config`.
    pub fn from_config(config: SessionConfig) -> Self {
        let grace = config.terminate_grace;
        Self::new(Arc::new(ProcessSpawner::new(config))).with_terminate_grace(grace)
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The error that made this session unusable, if any.
    pub fn failure(&self) -> Option<&BridgeError> {
        self.failure.as_ref()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Launch a fresh worker process. Any attached process is stopped first.
    pub async fn start(&mut self) -> Result<(), StartError> {
        if self.child.is_some() || self.writer.is_some() {
            tracing::warn!("Starting worker while a previous process is attached, stopping it");
            self.stop_process().await;
        }
        self.failure = None;
        self.set_state(SessionState::Starting);

        match self.spawner.spawn() {
            Ok(process) => {
                let pid = process.child.as_ref().and_then(Child::id);
                tracing::info!(?pid, "Worker process started");
                self.child = process.child;
                self.writer = Some(FramedWrite::new(process.stdin, FrameCodec::new()));
                self.reader = Some(FramedRead::new(process.stdout, FrameCodec::new()));
                self.snapshot_tx.send_modify(|s| {
                    s.pid = pid;
                    s.started_at = Some(chrono::Utc::now().to_rfc3339());
                    s.exchanges = 0;
                    s.last_error = None;
                });
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to start worker");
                self.record_failure(BridgeError::Start(e.clone()));
                Err(e)
            }
        }
    }

    /// Send the initialize handshake. Must directly follow a successful `start()`.
    ///
    /// A reply carrying an `error` field fails the session.
    pub async fn initialize(&mut self, request: Message) -> Result<Message, BridgeError> {
        if self.state != SessionState::Starting {
            return Err(self.unavailable());
        }
        self.set_state(SessionState::Initializing);
        tracing::debug!("Sending initialize to worker");

        let reply = match self.round_trip(request).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::error!(error = %err, "Initialize exchange failed");
                self.fail(err.clone()).await;
                return Err(err);
            }
        };

        if let Some(error) = reply.error() {
            let err = BridgeError::Initialize(error.to_string());
            tracing::error!(%error, "Worker rejected initialize");
            self.fail(err.clone()).await;
            return Err(err);
        }

        tracing::info!(?reply, "Worker initialized");
        self.set_state(SessionState::Ready);
        Ok(reply)
    }

    /// Write one request frame, flush, and read exactly one reply frame.
    ///
    /// Any failure other than an unencodable request leaves the session `Failed`.
    pub async fn exchange(&mut self, request: Message) -> Result<Message, BridgeError> {
        if self.state != SessionState::Ready {
            return Err(self.unavailable());
        }
        let command = request.command_name().unwrap_or_default().to_string();
        self.set_state(SessionState::Busy);

        match self.round_trip(request).await {
            Ok(reply) => {
                self.set_state(SessionState::Ready);
                self.snapshot_tx.send_modify(|s| s.exchanges += 1);
                tracing::debug!(%command, "Exchange complete");
                Ok(reply)
            }
            Err(BridgeError::Encoding(msg)) => {
                // Nothing reached the pipe, so the stream is still in sync.
                self.set_state(SessionState::Ready);
                Err(BridgeError::Encoding(msg))
            }
            Err(err) => {
                tracing::error!(%command, error = %err, "Exchange failed, worker session is unusable");
                self.fail(err.clone()).await;
                Err(err)
            }
        }
    }

    /// Stop the worker and release the pipes. Safe to call repeatedly.
    pub async fn terminate(&mut self) {
        self.stop_process().await;
        if self.state != SessionState::Failed {
            self.set_state(SessionState::Terminated);
        }
    }

    /// Record `err` as the reason this session is unusable and stop the worker.
    pub async fn fail(&mut self, err: BridgeError) {
        self.stop_process().await;
        self.record_failure(err);
    }

    async fn round_trip(&mut self, request: Message) -> Result<Message, BridgeError> {
        let (Some(writer), Some(reader)) = (self.writer.as_mut(), self.reader.as_mut()) else {
            return Err(BridgeError::NotReady);
        };

        writer.send(request).await.map_err(|e| match e {
            CodecError::Encoding(msg) => BridgeError::Encoding(msg),
            other => BridgeError::WorkerDead(format!("failed to write request: {other}")),
        })?;

        match reader.next().await {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(e)) => Err(e.into()),
            None => Err(BridgeError::WorkerDead(
                "worker closed its output before replying".to_string(),
            )),
        }
    }

    fn unavailable(&self) -> BridgeError {
        match (&self.failure, self.state) {
            (Some(err), _) => err.clone(),
            (None, SessionState::Terminated) => BridgeError::ShuttingDown,
            _ => BridgeError::NotReady,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.snapshot_tx.send_modify(|s| s.state = state);
    }

    fn record_failure(&mut self, err: BridgeError) {
        let message = err.to_string();
        self.failure = Some(err);
        self.snapshot_tx.send_modify(|s| s.last_error = Some(message));
        self.set_state(SessionState::Failed);
    }

    async fn stop_process(&mut self) {
        // Closing stdin is the worker's cue to exit.
        self.writer = None;
        self.reader = None;

        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Ok(Some(status)) = child.try_wait() {
            tracing::debug!(?status, "Worker already exited");
            return;
        }

        request_exit(&child);

        match tokio::time::timeout(self.terminate_grace, child.wait()).await {
            Ok(Ok(status)) => tracing::info!(?status, "Worker exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to wait for worker"),
            Err(_) => {
                tracing::warn!(grace = ?self.terminate_grace, "Worker did not exit in time, killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill worker");
                }
            }
        }
    }
}

/// Ask the worker to exit with SIGTERM.
#[cfg(unix)]
fn request_exit(child: &Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "Failed to signal worker");
    }
}

/// No signal to send; closing stdin and the kill fallback have to do.
#[cfg(not(unix))]
fn request_exit(_child: &Child) {}
