//! Request correlation
//!
//! Assigns a unique identifier to each outbound call and routes the matching
//! reply back to the caller, regardless of arrival order. Identifiers are
//! monotonically increasing and never reused while pending; each pending
//! request is settled at most once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use crate::error::ClientError;

type ResultSlot = oneshot::Sender<Result<serde_json::Value, ClientError>>;

struct PendingRequest {
    method: String,
    slot: ResultSlot,
}

/// Pending-request table for one session.
///
/// Owned exclusively by the session; callers interact through the narrow
/// register/resolve surface. The table is guarded because replies arrive on
/// the receive task while registrations come from caller tasks.
pub struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next request identifier.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a pending request and return the receiver its reply will be
    /// delivered on.
    pub async fn register(
        &self,
        id: u64,
        method: &str,
    ) -> oneshot::Receiver<Result<serde_json::Value, ClientError>> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().await;
        pending.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                slot: tx,
            },
        );
        rx
    }

    /// Deliver a reply to the matching pending request.
    ///
    /// Returns false if no request with this id is pending - duplicate and
    /// late replies are a no-op, not an error.
    pub async fn resolve(&self, id: u64, result: Result<serde_json::Value, ClientError>) -> bool {
        let entry = self.pending.lock().await.remove(&id);
        match entry {
            Some(request) => {
                // The caller may have given up (timeout, cancellation);
                // a dead receiver is fine.
                let _ = request.slot.send(result);
                true
            }
            None => {
                debug!(id = id, "Reply for unknown or already-settled request");
                false
            }
        }
    }

    /// Drop a pending request without settling it, e.g. after a local
    /// timeout. Late replies for the id are ignored from then on.
    pub async fn remove(&self, id: u64) {
        self.pending.lock().await.remove(&id);
    }

    /// Reject every pending request with an error produced per entry.
    /// Used when the session closes: ConnectionClosed on unexpected closure,
    /// Cancelled on manual disconnect.
    pub async fn reject_all(&self, make_error: impl Fn(&str) -> ClientError) {
        let mut pending = self.pending.lock().await;
        for (id, request) in pending.drain() {
            debug!(id = id, method = %request.method, "Rejecting pending request");
            let _ = request.slot.send(Err(make_error(&request.method)));
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let correlator = Correlator::new();
        let a = correlator.next_id();
        let b = correlator.next_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_out_of_order_replies_reach_the_right_caller() {
        let correlator = Correlator::new();
        let rx1 = correlator.register(1, "get_config").await;
        let rx2 = correlator.register(2, "get_channels").await;

        // Replies arrive in reverse order
        assert!(correlator.resolve(2, Ok(json!("second"))).await);
        assert!(correlator.resolve(1, Ok(json!("first"))).await);

        assert_eq!(rx1.await.unwrap().unwrap(), json!("first"));
        assert_eq!(rx2.await.unwrap().unwrap(), json!("second"));
    }

    #[tokio::test]
    async fn test_duplicate_reply_is_a_noop() {
        let correlator = Correlator::new();
        let rx = correlator.register(1, "get_config").await;

        assert!(correlator.resolve(1, Ok(json!(1))).await);
        assert!(!correlator.resolve(1, Ok(json!(2))).await);

        assert_eq!(rx.await.unwrap().unwrap(), json!(1));
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_remove_makes_late_reply_a_noop() {
        let correlator = Correlator::new();
        let _rx = correlator.register(1, "get_config").await;
        correlator.remove(1).await;

        assert!(!correlator.resolve(1, Ok(json!(null))).await);
    }

    // Paused clock: the 30s deadline elapses without wall-clock waiting
    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_reply_is_ignored() {
        let correlator = Correlator::new();
        let rx = correlator.register(1, "get_config").await;

        let result = tokio::time::timeout(std::time::Duration::from_secs(30), rx).await;
        assert!(result.is_err());

        correlator.remove(1).await;
        assert!(!correlator.resolve(1, Ok(json!(null))).await);
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_reject_all_settles_everything() {
        let correlator = Correlator::new();
        let rx1 = correlator.register(1, "a").await;
        let rx2 = correlator.register(2, "b").await;

        correlator.reject_all(|_| ClientError::Cancelled).await;

        assert!(matches!(rx1.await.unwrap(), Err(ClientError::Cancelled)));
        assert!(matches!(rx2.await.unwrap(), Err(ClientError::Cancelled)));
        assert_eq!(correlator.pending_count().await, 0);
    }
}
