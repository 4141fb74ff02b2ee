//! synthbridge: serve a framed-stdio speech synthesis worker over HTTP and WebSocket.
//!
//! One worker process, one request in flight. Network requests from any transport
//! are queued through the [`RequestSerializer`] and answered in FIFO order.

pub mod bootstrap;
pub mod bridge;
pub mod error;
pub mod health;
pub mod serializer;
pub mod service;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use bootstrap::{Bootstrap, BootstrapMode};
pub use bridge::protocol::Message;
pub use error::BridgeError;
pub use health::{SessionSnapshot, SessionState};
pub use serializer::{Bridge, BridgeConfig, RequestSerializer, RestartPolicy};
pub use service::BridgeService;
pub use session::{ProcessSpawner, SessionConfig, StartError, WorkerSession, WorkerSpawner};
pub use transport::{ServerConfig, serve, serve_listener};
