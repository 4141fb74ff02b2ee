//! Transport adapters.
//!
//! HTTP request/response and WebSocket persistent connections. Both hand every
//! request to the same [`BridgeService`](crate::service::BridgeService).

pub mod http;
pub mod ws;

pub use http::{ServerConfig, serve, serve_listener};
