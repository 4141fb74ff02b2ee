//! BridgeService: the transport-facing view of the bridge.
//!
//! Both HTTP and WebSocket handlers hold an `Arc<BridgeService>`. The service
//! owns shutdown coordination: once shutdown is triggered new submissions are
//! refused and the server stops accepting connections.

use std::sync::Arc;

use tokio::sync::watch;

use crate::bridge::protocol::Message;
use crate::error::BridgeError;
use crate::health::SessionSnapshot;
use crate::serializer::Bridge;

pub struct BridgeService {
    bridge: Arc<dyn Bridge>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl BridgeService {
    pub fn new(bridge: Arc<dyn Bridge>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            bridge,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub async fn submit(&self, request: Message) -> Result<Message, BridgeError> {
        if *self.shutdown_rx.borrow() {
            return Err(BridgeError::ShuttingDown);
        }
        self.bridge.submit(request).await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.bridge.snapshot()
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Refuse new work, then let the bridge drain its queue and stop the worker.
    pub async fn shutdown(&self) {
        self.trigger_shutdown();
        self.bridge.shutdown().await;
    }
}
