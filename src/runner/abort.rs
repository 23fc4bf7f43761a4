//! Cooperative cancellation for in-flight runs.

use std::sync::Arc;
use tokio::sync::watch;

/// Owner side: requests cancellation.
///
/// Clones share the same flag. The flag stays set until [`reset`](Self::reset)
/// so a request that arrives between two runs cancels the next one.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Cancels the run in progress.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    /// Re-arms the handle for the next run.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    /// Receiver side handed to an executing experiment.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiver side: observed by an executing experiment.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// Signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once cancellation is requested. Pends forever if the handle
    /// has been dropped without aborting.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_abort_wakes_waiter() {
        let handle = AbortHandle::new();
        let mut signal = handle.signal();
        let waiter = tokio::spawn(async move {
            signal.cancelled().await;
            signal.is_aborted()
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.abort();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_never_does_not_fire() {
        let mut signal = AbortSignal::never();
        let fired = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(fired.is_err());
        assert!(!signal.is_aborted());
    }

    #[test]
    fn test_reset_clears_flag() {
        let handle = AbortHandle::new();
        handle.abort();
        assert!(handle.signal().is_aborted());
        handle.reset();
        assert!(!handle.is_aborted());
    }
}
