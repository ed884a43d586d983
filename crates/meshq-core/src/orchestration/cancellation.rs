use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// One-shot abort signal for a single task execution.
///
/// Aborting is two-phase: [`AbortGate::request`] marks the execution as aborted while
/// the worker is still winding down, [`AbortGate::fire`] then wakes everything waiting
/// in [`AbortGate::cancelled`]. Clones share the same gate.
#[derive(Clone, Debug, Default)]
pub struct AbortGate {
    requested: Arc<AtomicBool>,
    fired: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl AbortGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn fire(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.fired.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// True once an abort was requested, fired or not.
    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Resolves once the gate fired.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking so a concurrent fire cannot slip between
            notified.as_mut().enable();

            if self.is_fired() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn waiter_resolves_after_fire() {
        let gate = AbortGate::new();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.fire();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .expect("waiter should not panic");
        assert!(gate.is_cancelled());
    }

    #[tokio::test]
    async fn request_marks_without_waking() {
        let gate = AbortGate::new();
        gate.request();

        assert!(gate.is_cancelled());
        assert!(!gate.is_fired());
        assert!(
            tokio::time::timeout(Duration::from_millis(30), gate.cancelled())
                .await
                .is_err()
        );

        gate.fire();
        tokio::time::timeout(Duration::from_millis(50), gate.cancelled())
            .await
            .expect("fired gate should not block");
    }
}
