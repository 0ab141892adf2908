//! In-process event bus with per-permission ordering.
//!
//! Every subscription owns a fixed number of worker tasks ("shards"). An event
//! goes to the shard chosen by hashing its permission id, so one handler sees
//! the events of one request strictly in publish order, while different
//! requests and different handlers proceed concurrently.
//!
//! A handler error or panic is caught at the worker, logged with the
//! permission id, event type and handler name, and counted; the worker keeps
//! serving the next event.

use crate::metrics::EventBusMetrics;
use crate::tracking::{InFlight, InFlightGuard};
use consent_core::event::{Event, PermissionEvent};
use consent_core::event_bus::{EventBus, EventBusError, EventFilter, EventHandler, HandlerError, SubscriptionId};
use futures::FutureExt;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;

struct Delivery {
    event: Arc<PermissionEvent>,
    _guard: InFlightGuard,
}

struct Subscription {
    id: SubscriptionId,
    filter: EventFilter,
    handler_name: &'static str,
    shards: Vec<mpsc::UnboundedSender<Delivery>>,
}

/// Type-filtered, sharded publish/subscribe inside one process.
///
/// # Panics
///
/// [`EventBus::subscribe`] spawns worker tasks and must be called from within
/// a Tokio runtime.
pub struct InProcessEventBus {
    shard_count: usize,
    subscriptions: RwLock<Vec<Subscription>>,
    in_flight: InFlight,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl InProcessEventBus {
    /// Create a bus whose subscriptions use `shard_count` workers each (at least one).
    #[must_use]
    pub fn new(shard_count: usize) -> Self {
        Self::with_tracker(shard_count, InFlight::new())
    }

    /// Create a bus that reports deliveries to an existing tracker.
    #[must_use]
    pub fn with_tracker(shard_count: usize, in_flight: InFlight) -> Self {
        Self {
            shard_count: shard_count.max(1),
            subscriptions: RwLock::new(Vec::new()),
            in_flight,
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Tracker of undelivered and running deliveries.
    #[must_use]
    pub const fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Wait until every published event has been handled.
    pub async fn settle(&self) {
        self.in_flight.settle().await;
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Remove one subscription; its workers finish their queue and stop.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(PoisonError::into_inner);
        let before = subscriptions.len();
        subscriptions.retain(|subscription| subscription.id != id);
        subscriptions.len() != before
    }

    /// Stop accepting events and let the workers drain.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::info!("Event bus shut down");
    }

    fn shard_for(&self, event: &PermissionEvent) -> usize {
        let mut hasher = DefaultHasher::new();
        event.permission_id().hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let shard = (hasher.finish() % self.shard_count as u64) as usize;
        shard
    }
}

async fn run_worker(handler: Arc<dyn EventHandler>, mut receiver: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(delivery) = receiver.recv().await {
        let event = delivery.event.as_ref();
        let outcome = AssertUnwindSafe(handler.handle(event)).catch_unwind().await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(error),
            Err(panic) => Some(HandlerError::Panicked(panic_message(panic.as_ref()))),
        };
        EventBusMetrics::record_delivery();
        if let Some(error) = failure {
            EventBusMetrics::record_handler_failure(handler.name());
            tracing::error!(
                permission_id = %event.permission_id(),
                event_type = event.event_type(),
                handler = handler.name(),
                error = %error,
                "Event handler failed"
            );
        }
    }
    tracing::debug!(handler = handler.name(), "Event bus worker stopped");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

impl EventBus for InProcessEventBus {
    fn subscribe(&self, filter: EventFilter, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let shards = (0..self.shard_count)
            .map(|_| {
                let (sender, receiver) = mpsc::unbounded_channel();
                tokio::spawn(run_worker(Arc::clone(&handler), receiver));
                sender
            })
            .collect();

        tracing::debug!(handler = handler.name(), ?filter, "Handler subscribed");
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                id,
                filter,
                handler_name: handler.name(),
                shards,
            });
        id
    }

    fn publish(&self, event: &PermissionEvent) -> Result<(), EventBusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventBusError::Closed);
        }

        let shard = self.shard_for(event);
        let event = Arc::new(event.clone());
        let subscriptions = self.subscriptions.read().unwrap_or_else(PoisonError::into_inner);
        for subscription in subscriptions.iter().filter(|s| s.filter.matches(&event)) {
            let delivery = Delivery {
                event: Arc::clone(&event),
                _guard: self.in_flight.track(),
            };
            if subscription.shards[shard].send(delivery).is_err() {
                tracing::error!(
                    permission_id = %event.permission_id(),
                    event_type = event.event_type(),
                    handler = subscription.handler_name,
                    "Event bus worker is gone, delivery dropped"
                );
            }
        }
        EventBusMetrics::record_publish();
        Ok(())
    }
}

impl std::fmt::Debug for InProcessEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessEventBus")
            .field("shard_count", &self.shard_count)
            .field("subscriptions", &self.subscription_count())
            .field("in_flight", &self.in_flight.pending())
            .finish_non_exhaustive()
    }
}
