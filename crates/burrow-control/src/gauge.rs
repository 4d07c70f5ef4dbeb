//! Counts in-flight external connection handlers for the shutdown drain

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Broker-wide gauge of live external connection handlers.
///
/// Every handler holds a [`ConnGuard`] for its lifetime; shutdown waits on
/// [`ConnGauge::drained`] up to the drain deadline.
#[derive(Default)]
pub struct ConnGauge {
    active: AtomicUsize,
    notify: Notify,
}

impl ConnGauge {
    pub fn enter(self: &Arc<Self>) -> ConnGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnGuard {
            gauge: Arc::clone(self),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Resolve once no handlers remain. May be woken spuriously; re-checks
    /// the count each time.
    pub async fn drained(&self) {
        loop {
            if self.active() == 0 {
                return;
            }
            let notified = self.notify.notified();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// RAII token for one in-flight external connection
pub struct ConnGuard {
    gauge: Arc<ConnGauge>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        if self.gauge.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.gauge.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_drained_waits_for_guards() {
        let gauge = Arc::new(ConnGauge::default());
        let guard = gauge.enter();
        assert_eq!(gauge.active(), 1);

        let waiter = {
            let gauge = gauge.clone();
            tokio::spawn(async move { gauge.drained().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(gauge.active(), 0);
    }

    #[tokio::test]
    async fn test_drained_immediate_when_idle() {
        let gauge = Arc::new(ConnGauge::default());
        tokio::time::timeout(Duration::from_millis(100), gauge.drained())
            .await
            .unwrap();
    }
}
