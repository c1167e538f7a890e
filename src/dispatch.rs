//! Push fan-out
//!
//! Routes envelopes that are not replies to any pending request to the
//! registered listeners, keyed by event category. Handlers for the same
//! category all receive each push, in subscription order; the wildcard
//! category `"all"` receives every push.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tracing::{debug, warn};

/// Category that receives every push regardless of its own category.
pub const WILDCARD_CATEGORY: &str = "all";

/// A push handler. Invoked on the session's receive task; must not block.
pub type PushHandler = Arc<dyn Fn(&Value) + Send + Sync>;

struct SubscriptionEntry {
    id: u64,
    category: String,
    handler: PushHandler,
}

/// Subscription registry and dispatcher.
///
/// Guarded with a std mutex: registration happens from caller threads while
/// dispatch runs on the receive task, and the lock is never held across an
/// await point. Handlers are cloned out of the lock before invocation so a
/// slow handler cannot block subscribe/unsubscribe.
pub struct PushDispatcher {
    subscriptions: Mutex<Vec<SubscriptionEntry>>,
    next_id: AtomicU64,
}

impl PushDispatcher {
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for a category and get back an unsubscribe handle.
    ///
    /// Registration is idempotent per (category, handler identity): passing
    /// the same `Arc` handler for the same category again returns a handle to
    /// the existing subscription instead of adding a duplicate.
    pub fn subscribe(self: &Arc<Self>, category: &str, handler: PushHandler) -> Subscription {
        let mut subscriptions = self.subscriptions.lock().expect("subscription registry poisoned");

        if let Some(existing) = subscriptions
            .iter()
            .find(|entry| entry.category == category && Arc::ptr_eq(&entry.handler, &handler))
        {
            return Subscription {
                id: existing.id,
                dispatcher: Arc::downgrade(self),
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        subscriptions.push(SubscriptionEntry {
            id,
            category: category.to_string(),
            handler,
        });
        debug!(id = id, category = %category, "Push subscription registered");

        Subscription {
            id,
            dispatcher: Arc::downgrade(self),
        }
    }

    /// Invoke every handler whose category matches, in subscription order.
    ///
    /// A panicking handler is logged and must not prevent the remaining
    /// handlers from running.
    pub fn dispatch(&self, category: &str, payload: &Value) {
        let matching: Vec<(u64, PushHandler)> = {
            let subscriptions = self.subscriptions.lock().expect("subscription registry poisoned");
            subscriptions
                .iter()
                .filter(|entry| entry.category == category || entry.category == WILDCARD_CATEGORY)
                .map(|entry| (entry.id, Arc::clone(&entry.handler)))
                .collect()
        };

        for (id, handler) in matching {
            if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                warn!(id = id, category = %category, "Push handler panicked");
            }
        }
    }

    /// Remove a subscription by id. Returns false if it was already gone.
    fn unsubscribe(&self, id: u64) -> bool {
        let mut subscriptions = self.subscriptions.lock().expect("subscription registry poisoned");
        let before = subscriptions.len();
        subscriptions.retain(|entry| entry.id != id);
        subscriptions.len() != before
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().expect("subscription registry poisoned").len()
    }
}

impl Default for PushDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by `subscribe()`.
///
/// `unsubscribe()` is safe to call any number of times; after the first call
/// it is a no-op. Dropping the handle does NOT unsubscribe - a listener stays
/// registered for the life of the client unless explicitly removed.
pub struct Subscription {
    id: u64,
    dispatcher: Weak<PushDispatcher>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            if dispatcher.unsubscribe(self.id) {
                debug!(id = self.id, "Push subscription removed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn counting_handler(counter: Arc<AtomicU32>) -> PushHandler {
        Arc::new(move |_payload| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_fan_out_matches_category_only() {
        let dispatcher = Arc::new(PushDispatcher::new());
        let channel_hits = Arc::new(AtomicU32::new(0));
        let balance_hits = Arc::new(AtomicU32::new(0));

        let _a = dispatcher.subscribe("channel_update", counting_handler(channel_hits.clone()));
        let _b = dispatcher.subscribe("channel_update", counting_handler(channel_hits.clone()));
        let _c = dispatcher.subscribe("balance_update", counting_handler(balance_hits.clone()));

        dispatcher.dispatch("channel_update", &json!({}));

        assert_eq!(channel_hits.load(Ordering::SeqCst), 2);
        assert_eq!(balance_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wildcard_receives_everything() {
        let dispatcher = Arc::new(PushDispatcher::new());
        let hits = Arc::new(AtomicU32::new(0));
        let _sub = dispatcher.subscribe(WILDCARD_CATEGORY, counting_handler(hits.clone()));

        dispatcher.dispatch("channel_update", &json!({}));
        dispatcher.dispatch("balance_update", &json!({}));

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_the_rest() {
        let dispatcher = Arc::new(PushDispatcher::new());
        let hits = Arc::new(AtomicU32::new(0));

        let _first = dispatcher.subscribe(
            "channel_update",
            Arc::new(|_payload: &Value| panic!("handler bug")),
        );
        let _second = dispatcher.subscribe("channel_update", counting_handler(hits.clone()));

        dispatcher.dispatch("channel_update", &json!({}));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registration_is_idempotent_per_handler_identity() {
        let dispatcher = Arc::new(PushDispatcher::new());
        let hits = Arc::new(AtomicU32::new(0));
        let handler = counting_handler(hits.clone());

        let _a = dispatcher.subscribe("channel_update", Arc::clone(&handler));
        let _b = dispatcher.subscribe("channel_update", Arc::clone(&handler));
        assert_eq!(dispatcher.subscription_count(), 1);

        // Same handler under a different category is a distinct subscription
        let _c = dispatcher.subscribe("balance_update", handler);
        assert_eq!(dispatcher.subscription_count(), 2);

        dispatcher.dispatch("channel_update", &json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let dispatcher = Arc::new(PushDispatcher::new());
        let hits = Arc::new(AtomicU32::new(0));
        let subscription = dispatcher.subscribe("channel_update", counting_handler(hits.clone()));

        subscription.unsubscribe();
        subscription.unsubscribe();

        dispatcher.dispatch("channel_update", &json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.subscription_count(), 0);
    }
}
