//! Broadcast shutdown signal.
//!
//! Every long running task holds a [`ShutdownRx`] and selects on [`ShutdownRx::changed`].
//! A task that subscribes after shutdown was requested sees the flag through
//! [`is_shutdown_requested`].

use std::sync::Arc;

use tokio::sync::watch;

/// Receiver side of the shutdown signal. The value flips to `true` once shutdown is requested.
pub type ShutdownRx = watch::Receiver<bool>;

/// Sender side of the shutdown signal, cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownTx(Arc<watch::Sender<bool>>);

impl ShutdownTx {
    /// Requests shutdown of every subscribed task. Idempotent.
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.0.borrow()
    }
}

pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(Arc::new(tx)), rx)
}

pub fn is_shutdown_requested(shutdown_rx: &ShutdownRx) -> bool {
    *shutdown_rx.borrow()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_late_subscriber_sees_shutdown() {
        let (tx, mut rx) = create_shutdown_channel();
        assert!(!is_shutdown_requested(&rx));

        tx.shutdown();
        rx.changed().await.unwrap();
        assert!(is_shutdown_requested(&rx));

        let late = tx.subscribe();
        assert!(is_shutdown_requested(&late));
        assert!(tx.is_shutdown_requested());
    }
}
