//! HTTP transport via axum.

mod routes;
mod server;

pub use routes::{error_status, routes};
pub use server::{ServerConfig, serve, serve_listener};
