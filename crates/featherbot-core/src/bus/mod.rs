//! Typed pub/sub message bus.
//!
//! Subscribers register per [`EventType`] and are invoked in subscription
//! order, one at a time, for each `publish` call — concurrent `publish`
//! calls may still interleave handlers from different events, but a
//! single `publish` never races its own handler sequence. A handler that
//! fails while processing a `message:*` event causes the bus to
//! synthesize and publish a `bus:error` event exactly once; a `bus:error`
//! handler that itself fails is logged and swallowed rather than
//! recursing again.

pub mod events;

use events::{BusErrorEvent, BusEvent, EventType};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;
use tracing::{debug, error};

/// A subscribed handler. Returning `Err` signals a handler failure; the
/// bus turns that into a `bus:error` event rather than propagating it.
pub type Handler =
    Arc<dyn Fn(BusEvent) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

/// Opaque subscription identity returned by [`MessageBus::subscribe`] and
/// required by [`MessageBus::unsubscribe`].
///
/// The source spec models subscriber identity by handler reference
/// equality; Rust closures aren't comparable that way, so subscription
/// returns a monotonic id instead. Functionally equivalent: `unsubscribe`
/// still removes at most the one registration the id names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    handler: Handler,
}

type SubscriberTable = HashMap<EventType, Vec<Subscriber>>;

/// Async message bus decoupling channel adapters from the agent core.
pub struct MessageBus {
    subscribers: Arc<RwLock<SubscriberTable>>,
    next_id: AtomicU64,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `handler` to run whenever an event of `event_type` is
    /// published. Handlers for one type run in subscription order.
    pub async fn subscribe<F, Fut>(&self, event_type: EventType, handler: F) -> SubscriptionId
    where
        F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let boxed: Handler = Arc::new(move |event| Box::pin(handler(event)));

        let mut subs = self.subscribers.write().await;
        subs.entry(event_type).or_default().push(Subscriber { id, handler: boxed });
        id
    }

    /// Remove the subscription identified by `id` from `event_type`.
    /// Removes at most one registration. Returns whether one was found.
    pub async fn unsubscribe(&self, event_type: EventType, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write().await;
        if let Some(list) = subs.get_mut(&event_type) {
            if let Some(pos) = list.iter().position(|s| s.id == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Number of handlers currently registered for `event_type`. Used by
    /// diagnostics (`/status`) and tests.
    pub async fn subscriber_count(&self, event_type: EventType) -> usize {
        self.subscribers
            .read()
            .await
            .get(&event_type)
            .map_or(0, Vec::len)
    }

    /// Publish `event` to every handler subscribed to its type, in
    /// subscription order, awaiting each before invoking the next.
    ///
    /// A handler failure on a non-error event synthesizes and publishes
    /// a `bus:error` event (recursively, through this same method) once.
    /// A failure while handling a `bus:error` event is logged and
    /// swallowed — there is no second-level recursion.
    pub fn publish(&self, event: BusEvent) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let event_type = event.event_type();
            let handlers: Vec<Handler> = {
                let subs = self.subscribers.read().await;
                subs.get(&event_type)
                    .map(|list| list.iter().map(|s| Arc::clone(&s.handler)).collect())
                    .unwrap_or_default()
            };

            if handlers.is_empty() {
                debug!(%event_type, "publish: no subscribers");
                return;
            }

            for handler in handlers {
                let outcome = handler(event.clone()).await;
                if let Err(err) = outcome {
                    if matches!(event_type, EventType::Error) {
                        error!(error = %err, "bus:error handler itself failed; swallowing");
                        continue;
                    }

                    error!(error = %err, %event_type, "bus handler failed; synthesizing bus:error");
                    let error_event = BusEvent::Error(BusErrorEvent {
                        message: err.to_string(),
                        source_event: Box::new(event.clone()),
                        timestamp: SystemTime::now(),
                    });
                    self.publish(error_event).await;
                }
            }
        })
    }

    /// Remove every subscriber. Subsequent `publish` calls become no-ops
    /// because there is nothing left to invoke.
    pub async fn close(&self) {
        self.subscribers.write().await.clear();
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
