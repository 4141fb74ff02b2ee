//! Request serializer - a single actor task owns the worker session.
//!
//! Callers hold a cloneable [`RequestSerializer`] handle and send commands over a
//! bounded channel. The actor runs them one at a time, so the worker never sees a
//! second request before it has answered the first, and each reply goes back to
//! the caller that sent the request. Queued submissions wait (backpressure), they
//! are never rejected for being queued.
//!
//! A caller that gives up waiting only drops its reply receiver: the exchange
//! already handed to the actor still runs to completion, keeping the pipe in sync.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};

use crate::bootstrap::{Bootstrap, BootstrapMode};
use crate::bridge::protocol::Message;
use crate::error::BridgeError;
use crate::health::{SessionSnapshot, SessionState};
use crate::session::WorkerSession;

pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// What to do with a session that lost its worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Every later submission fails with the recorded error until an explicit restart.
    #[default]
    Never,
    /// The next submission after a worker loss respawns and re-initializes the worker.
    /// Start and initialize failures are never retried.
    OnFailure,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bootstrap: Bootstrap,
    pub restart: RestartPolicy,
    /// Bound on a single exchange. `None` waits forever.
    pub exchange_timeout: Option<Duration>,
    pub queue_depth: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bootstrap: Bootstrap::default(),
            restart: RestartPolicy::default(),
            exchange_timeout: None,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl BridgeConfig {
    pub fn with_bootstrap(mut self, bootstrap: Bootstrap) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = Some(timeout);
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }
}

/// The interface both transports call.
#[async_trait]
pub trait Bridge: Send + Sync {
    /// Forward one request to the worker and wait for its reply.
    async fn submit(&self, request: Message) -> Result<Message, BridgeError>;

    /// Current session state without contacting the worker.
    fn snapshot(&self) -> SessionSnapshot;

    /// Finish queued work, then stop the worker.
    async fn shutdown(&self);
}

enum Command {
    Submit {
        request: Message,
        reply: oneshot::Sender<Result<Message, BridgeError>>,
    },
    Restart {
        reply: oneshot::Sender<Result<(), BridgeError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the actor that owns the worker session.
#[derive(Clone)]
pub struct RequestSerializer {
    tx: mpsc::Sender<Command>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
}

impl RequestSerializer {
    /// Take ownership of `session` and start the actor. In eager mode the
    /// bootstrap begins immediately.
    pub fn spawn(session: WorkerSession, config: BridgeConfig) -> Self {
        let snapshot_rx = session.subscribe();
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));

        let actor = Actor {
            session,
            config,
            bootstrapped: false,
        };
        tokio::spawn(actor.run(rx));

        Self { tx, snapshot_rx }
    }

    pub async fn submit(&self, request: Message) -> Result<Message, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Submit { request, reply })
            .await
            .map_err(|_| BridgeError::ShuttingDown)?;
        rx.await.map_err(|_| BridgeError::ShuttingDown)?
    }

    /// Stop the current worker and bootstrap a fresh one.
    pub async fn restart(&self) -> Result<(), BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Restart { reply })
            .await
            .map_err(|_| BridgeError::ShuttingDown)?;
        rx.await.map_err(|_| BridgeError::ShuttingDown)?
    }

    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }
}

#[async_trait]
impl Bridge for RequestSerializer {
    async fn submit(&self, request: Message) -> Result<Message, BridgeError> {
        RequestSerializer::submit(self, request).await
    }

    fn snapshot(&self) -> SessionSnapshot {
        RequestSerializer::snapshot(self)
    }

    async fn shutdown(&self) {
        RequestSerializer::shutdown(self).await
    }
}

struct Actor {
    session: WorkerSession,
    config: BridgeConfig,
    /// Last bootstrap succeeded. Only then is a lost worker worth respawning.
    bootstrapped: bool,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        if self.config.bootstrap.mode() == BootstrapMode::Eager {
            let keep_running = self.eager_bootstrap(&mut rx).await;
            if !keep_running {
                self.session.terminate().await;
                return;
            }
        }

        while let Some(command) = rx.recv().await {
            match command {
                Command::Submit { request, reply } => {
                    let result = self.submit(request).await;
                    if reply.send(result).is_err() {
                        tracing::debug!("Caller went away before its reply was ready");
                    }
                }
                Command::Restart { reply } => {
                    let result = self.restart().await;
                    let _ = reply.send(result);
                }
                Command::Shutdown { reply } => {
                    tracing::info!("Shutting down worker session");
                    self.session.terminate().await;
                    let _ = reply.send(());
                    return;
                }
            }
        }

        tracing::debug!("All bridge handles dropped, stopping worker");
        self.session.terminate().await;
    }

    /// Bootstrap while answering anything that arrives meanwhile with `NotReady`.
    /// Returns false if the actor should stop.
    async fn eager_bootstrap(&mut self, rx: &mut mpsc::Receiver<Command>) -> bool {
        let run = self.config.bootstrap.run(&mut self.session);
        tokio::pin!(run);

        let outcome = loop {
            tokio::select! {
                result = &mut run => break Some(result),
                command = rx.recv() => match command {
                    Some(Command::Submit { reply, .. }) => {
                        let _ = reply.send(Err(BridgeError::NotReady));
                    }
                    Some(Command::Restart { reply }) => {
                        let _ = reply.send(Err(BridgeError::NotReady));
                    }
                    Some(Command::Shutdown { reply }) => {
                        tracing::info!("Shutdown requested during bootstrap");
                        let _ = reply.send(());
                        break None;
                    }
                    None => break None,
                },
            }
        };

        match outcome {
            Some(Ok(_)) => {
                self.bootstrapped = true;
                true
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Worker bootstrap failed, requests will be refused");
                true
            }
            None => false,
        }
    }

    async fn submit(&mut self, request: Message) -> Result<Message, BridgeError> {
        self.prepare().await?;

        let Some(limit) = self.config.exchange_timeout else {
            return self.session.exchange(request).await;
        };
        match tokio::time::timeout(limit, self.session.exchange(request)).await {
            Ok(result) => result,
            Err(_) => {
                // A late reply would be read as the answer to the next request.
                let err = BridgeError::Timeout(limit);
                tracing::error!(error = %err, "Exchange timed out, terminating worker");
                self.session.fail(err.clone()).await;
                Err(err)
            }
        }
    }

    /// Bring the session up if policy allows. Errors for sessions that stay
    /// down come from `exchange` itself.
    async fn prepare(&mut self) -> Result<(), BridgeError> {
        match self.session.state() {
            SessionState::NotStarted if self.config.bootstrap.mode() == BootstrapMode::Lazy => {
                self.bootstrap().await
            }
            SessionState::Failed if self.should_respawn() => {
                tracing::warn!(
                    error = ?self.session.failure().map(ToString::to_string),
                    "Respawning worker after failure"
                );
                self.bootstrap().await
            }
            _ => Ok(()),
        }
    }

    fn should_respawn(&self) -> bool {
        self.config.restart == RestartPolicy::OnFailure
            && self.bootstrapped
            && self.session.failure().is_some_and(BridgeError::is_worker_loss)
    }

    async fn bootstrap(&mut self) -> Result<(), BridgeError> {
        let result = self.config.bootstrap.run(&mut self.session).await;
        self.bootstrapped = result.is_ok();
        result.map(|_| ())
    }

    async fn restart(&mut self) -> Result<(), BridgeError> {
        tracing::info!("Restarting worker on request");
        self.session.terminate().await;
        self.bootstrap().await
    }
}
