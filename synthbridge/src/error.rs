//! Errors surfaced to callers of the bridge.

use std::time::Duration;

use crate::bridge::codec::CodecError;
use crate::session::StartError;

/// Failure of a submitted request or of the session behind it.
///
/// Cloneable so the error that broke a session can be handed to every later caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    #[error("worker session is not ready")]
    NotReady,

    #[error(transparent)]
    Start(#[from] StartError),

    #[error("worker rejected initialize: {0}")]
    Initialize(String),

    #[error("worker died: {0}")]
    WorkerDead(String),

    #[error("worker protocol error: {0}")]
    Protocol(String),

    #[error("could not encode request: {0}")]
    Encoding(String),

    #[error("worker did not answer within {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("bridge is shutting down")]
    ShuttingDown,
}

impl BridgeError {
    /// The worker process was lost mid-operation. A respawn may fix these; start and
    /// initialize failures are configuration problems and will not go away on retry.
    pub fn is_worker_loss(&self) -> bool {
        matches!(
            self,
            BridgeError::WorkerDead(_) | BridgeError::Protocol(_) | BridgeError::Timeout(_)
        )
    }
}

impl From<CodecError> for BridgeError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Encoding(msg) => BridgeError::Encoding(msg),
            CodecError::Framing(msg) => BridgeError::WorkerDead(msg),
            CodecError::Protocol(msg) => BridgeError::Protocol(msg),
            CodecError::Io(e) => BridgeError::WorkerDead(e.to_string()),
        }
    }
}
