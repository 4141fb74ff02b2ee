//! Session bootstrap: start the worker and complete the initialize handshake.

use std::time::Duration;

use serde_json::Value;

use crate::bridge::protocol::Message;
use crate::error::BridgeError;
use crate::session::WorkerSession;

/// Default bound on start + initialize. Model loading is slow.
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(300);

/// When the worker is brought up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BootstrapMode {
    /// Before the bridge accepts its first request.
    #[default]
    Eager,
    /// On the first submitted request.
    Lazy,
}

#[derive(Debug, Clone)]
pub struct Bootstrap {
    init: Message,
    setup_timeout: Duration,
    mode: BootstrapMode,
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self {
            init: Message::initialize(),
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            mode: BootstrapMode::Eager,
        }
    }
}

impl Bootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra field carried on the initialize request (e.g. `onnx_dir`).
    pub fn with_init_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.init.insert(key, value);
        self
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    pub fn with_mode(mut self, mode: BootstrapMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> BootstrapMode {
        self.mode
    }

    pub fn init_message(&self) -> &Message {
        &self.init
    }

    /// Start `session` and send initialize. On failure the session is left
    /// `Failed` with the returned error recorded.
    pub async fn run(&self, session: &mut WorkerSession) -> Result<Message, BridgeError> {
        tracing::info!(timeout = ?self.setup_timeout, "Bootstrapping worker");
        let started = std::time::Instant::now();

        session.start().await?;

        match tokio::time::timeout(self.setup_timeout, session.initialize(self.init.clone())).await
        {
            Ok(Ok(reply)) => {
                tracing::info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Worker bootstrap complete"
                );
                Ok(reply)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let err = BridgeError::Timeout(self.setup_timeout);
                tracing::error!(error = %err, "Worker did not finish initialize in time");
                session.fail(err.clone()).await;
                Err(err)
            }
        }
    }
}
