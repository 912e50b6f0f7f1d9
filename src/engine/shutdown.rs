//! Shutdown signaling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Requests the engine to drain and stop.
///
/// Cheap to clone and callable from any thread, including an OS signal
/// handler thread. Only the first call has an effect.
#[derive(Debug, Clone, Default)]
pub struct ShutdownTrigger {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    fired: AtomicBool,
    notify: Notify,
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Returns `false` if it was already requested.
    pub fn fire(&self) -> bool {
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.notify.notify_waiters();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has been requested. Any number of tasks may
    /// wait on clones of the same trigger.
    pub async fn wait(&self) {
        // registered before the flag check so a concurrent fire is not missed
        let notified = self.inner.notify.notified();
        if self.is_fired() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fire_is_idempotent() {
        let trigger = ShutdownTrigger::new();
        assert!(!trigger.is_fired());
        assert!(trigger.fire());
        assert!(!trigger.clone().fire());
        assert!(trigger.is_fired());
    }

    #[tokio::test]
    async fn test_fire_before_wait_is_not_lost() {
        let trigger = ShutdownTrigger::new();
        trigger.fire();
        tokio::time::timeout(Duration::from_secs(1), trigger.wait())
            .await
            .expect("fired flag should be observed");
    }

    #[tokio::test]
    async fn test_wakes_every_waiter() {
        let trigger = ShutdownTrigger::new();
        let first = tokio::spawn({
            let trigger = trigger.clone();
            async move { trigger.wait().await }
        });
        let second = tokio::spawn({
            let trigger = trigger.clone();
            async move { trigger.wait().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.fire();

        let both = async {
            first.await.unwrap();
            second.await.unwrap();
        };
        tokio::time::timeout(Duration::from_secs(1), both)
            .await
            .expect("both waiters should wake");
    }

    #[tokio::test]
    async fn test_fire_from_other_thread() {
        let trigger = ShutdownTrigger::new();
        let remote = trigger.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            remote.fire();
        });
        tokio::time::timeout(Duration::from_secs(2), trigger.wait())
            .await
            .expect("shutdown should arrive");
    }
}
