//! Cooperative cancellation shared by the synchronizers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct CancellationState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cloneable cancellation flag. Checked between records and pages, never
/// used to interrupt an in-flight call.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<CancellationState>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Sleeps for `duration` unless cancelled first. Returns `false` when the
    /// sleep was cut short by cancellation.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancelled() => false,
            _ = tokio::time::sleep(duration) => !self.is_cancelled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_is_visible_to_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_for_waiters() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        waiter.await.expect("waiter finished");
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_is_cut_short_by_cancel() {
        let token = CancellationToken::new();
        let sleeper = {
            let token = token.clone();
            tokio::spawn(async move { token.sleep(Duration::from_secs(3600)).await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        assert!(!sleeper.await.expect("sleeper finished"));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_cancel() {
        let token = CancellationToken::new();
        assert!(token.sleep(Duration::from_millis(10)).await);
    }
}
