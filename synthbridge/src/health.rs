//! Worker session state as seen by observers.

use serde::{Deserialize, Serialize};

/// Lifecycle of the single worker process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// No process has been launched yet
    #[default]
    NotStarted,
    /// Process is being launched
    Starting,
    /// Waiting for the initialize reply
    Initializing,
    /// Idle and accepting exchanges
    Ready,
    /// An exchange is in flight
    Busy,
    /// Process was stopped on request
    Terminated,
    /// Process is gone or unusable; `last_error` says why
    Failed,
}

impl SessionState {
    /// Ready or serving an exchange.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Busy)
    }

    pub fn is_stopped(self) -> bool {
        matches!(self, SessionState::Terminated | SessionState::Failed)
    }
}

/// Point-in-time view of the worker session, published on every state change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// When the current process was launched (RFC 3339).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// Completed exchanges with the current process.
    pub exchanges: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
