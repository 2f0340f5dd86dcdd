//! Build-wide cancellation token
//!
//! One token per execution; checked between tasks and between actions,
//! and raced against child-process waits. Cancellation is one-way.

use std::sync::Arc;

use tokio::sync::watch;

/// Cloneable cancellation token backed by a watch channel
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Signal cancellation to every holder of a clone
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the token is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // wait_for only fails when every sender is gone; we hold one
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}
