//! Graceful shutdown coordinator.
//!
//! Every long-running task of the node (gc loop, cleaner, broadcaster,
//! membership loops, peer connections) subscribes to the coordinator and
//! exits when a signal is broadcast.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Shutdown signal.
#[derive(Debug, Clone, Copy)]
pub enum ShutdownSignal {
    Graceful,
    Immediate,
}

/// Broadcast-based shutdown coordinator.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    tx: Arc<broadcast::Sender<ShutdownSignal>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx: Arc::new(tx) }
    }

    /// Subscribe to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.tx.subscribe()
    }

    /// Broadcast a graceful shutdown to every subscriber.
    pub fn shutdown(&self) {
        info!("initiating graceful shutdown");
        // Send fails only when nobody is listening, which is fine.
        let _ = self.tx.send(ShutdownSignal::Graceful);
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
