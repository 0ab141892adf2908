//! Counting of in-flight work so callers can wait for quiescence.
//!
//! The event bus increments the counter when it enqueues a delivery and the
//! worker decrements it after the handler returned; scheduled retries hold a
//! guard until their delay elapsed and the retry was committed. `settle()`
//! therefore returns once every consequence of the events published so far
//! has played out.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// Shared in-flight counter with change notification.
#[derive(Clone, Debug)]
pub struct InFlight {
    counter: Arc<AtomicUsize>,
    notifier: Arc<watch::Sender<()>>,
}

impl InFlight {
    /// Create an idle tracker.
    #[must_use]
    pub fn new() -> Self {
        let (notifier, _) = watch::channel(());
        Self {
            counter: Arc::new(AtomicUsize::new(0)),
            notifier: Arc::new(notifier),
        }
    }

    /// Register one unit of work; it ends when the guard is dropped.
    #[must_use]
    pub fn track(&self) -> InFlightGuard {
        self.counter.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            counter: Arc::clone(&self.counter),
            notifier: Arc::clone(&self.notifier),
        }
    }

    /// Number of units currently in flight.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    /// Wait until nothing is in flight.
    pub async fn settle(&self) {
        let mut completion = self.notifier.subscribe();
        while self.counter.load(Ordering::SeqCst) > 0 {
            if completion.changed().await.is_err() {
                break;
            }
        }
    }

    /// Wait until nothing is in flight, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `Err(())` if the timeout expires first.
    pub async fn settle_with_timeout(&self, timeout: Duration) -> Result<(), ()> {
        tokio::time::timeout(timeout, self.settle())
            .await
            .map_err(|_| ())
    }
}

impl Default for InFlight {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    counter: Arc<AtomicUsize>,
    notifier: Arc<watch::Sender<()>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.counter.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notifier.send_replace(());
        }
    }
}
