use std::future::Future;

use tokio::sync::watch;

/**
 * CancelToken
 * ===========
 * A clonable cancellation signal. Long-running operations hold a clone
 *  and either poll `is_cancelled` between units of work or select on
 *  `cancelled` inside their event loops. Cancellation is one-way and
 *  sticky.
 */
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self { sender, receiver }
    }

    /// Flip the token; every clone observes it.
    pub fn cancel(&self) {
        // send only fails with no receivers, and we always hold one
        let _ = self.sender.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once the token is cancelled. Resolves immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Run a future to completion unless the token is cancelled first,
    /// in which case the future is dropped and `None` is returned.
    pub async fn run_until_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancelled() => None,
            value = fut => Some(value),
        }
    }
}
