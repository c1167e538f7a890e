//! Coordinator client with automatic reconnection
//!
//! The only surface the rest of the application uses.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                  CoordinatorClient                      │
//! │  - connect / call / subscribe / disconnect              │
//! │  - owns the connection state machine                    │
//! │  - reconnects with bounded exponential backoff          │
//! └────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌────────────────────────────────────────────────────────┐
//! │                      Session                            │
//! │  - an authenticated, ready-to-use connection            │
//! │  - created via Session::establish()                     │
//! │  - dies on disconnect (no auto-reconnect)               │
//! └────────────────────────────────────────────────────────┘
//!                            │
//!               ┌────────────┼────────────┐
//!               ▼            ▼            ▼
//!          Transport     Correlator    Dispatcher
//! ```
//!
//! # Reconnection Policy
//!
//! When the session dies unexpectedly, a supervisor task re-establishes it
//! after `base_delay * 2^attempt`; each failed attempt doubles the next
//! delay. The counter resets on a successful handshake. Exceeding the
//! configured attempt cap emits a terminal error event exactly once and
//! halts. An explicit rejection from the coordinator (bad credentials, not a
//! network blip) is never retried. Manual `disconnect()` cancels any
//! scheduled reconnection timer.
//!
//! Clients are explicit instances - construct one at startup and pass it by
//! reference; multiple isolated clients per process are fine.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::dispatch::{PushDispatcher, PushHandler, Subscription};
use crate::error::ClientError;
use crate::session::{CloseReason, ConnState, Session, StateHandle};
use crate::signer::Signer;

/// Exponential backoff schedule for reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            base_delay: config.reconnect_base_delay(),
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Delay before the attempt with this number: `base_delay * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Connection lifecycle events on the side channel.
///
/// Correlated failures go to the caller whose request failed; these cover
/// the truly unsolicited ones.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Session established and authenticated
    Connected,
    /// Unexpected closure; a reconnect attempt is scheduled after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// Terminal failure: reconnect attempts exhausted or the coordinator
    /// rejected the handshake. Fired exactly once, then the client is Closed.
    Error { message: String },
    /// Manual disconnect completed
    Closed,
}

struct ClientInner {
    config: ClientConfig,
    state: StateHandle,
    session: RwLock<Option<Arc<Session>>>,
    dispatcher: Arc<PushDispatcher>,
    events: broadcast::Sender<ClientEvent>,
    /// Consecutive failed reconnect attempts; reset on auth success
    attempts: AtomicU32,
    /// Holder address, known once a signer has been built
    address: StdMutex<Option<String>>,
    shutdown: StdMutex<Option<watch::Sender<bool>>>,
    supervisor: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

/// The coordinator client facade.
///
/// Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct CoordinatorClient {
    inner: Arc<ClientInner>,
}

impl CoordinatorClient {
    pub fn new(config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ClientInner {
                config,
                state: StateHandle::new(),
                session: RwLock::new(None),
                dispatcher: Arc::new(PushDispatcher::new()),
                events,
                attempts: AtomicU32::new(0),
                address: StdMutex::new(None),
                shutdown: StdMutex::new(None),
                supervisor: StdMutex::new(None),
            }),
        }
    }

    /// Connect and authenticate. Resolves once the session is open; rejects
    /// on handshake failure. Valid only from Idle or Closed.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let state = self.inner.state.get();
        if !matches!(state, ConnState::Idle | ConnState::Closed) {
            return Err(ClientError::Config(format!(
                "connect() is not valid from {:?}",
                state
            )));
        }

        // A missing key is fatal before anything touches the network
        let identity = Signer::from_config(self.inner.config.private_key.as_deref())?;
        *self.inner.address.lock().expect("address poisoned") = Some(identity.address());

        match Session::establish(
            &self.inner.config,
            &identity,
            &self.inner.state,
            Arc::clone(&self.inner.dispatcher),
        )
        .await
        {
            Ok(session) => {
                *self.inner.session.write().await = Some(Arc::new(session));
                self.inner.state.set(ConnState::Open);
                self.inner.attempts.store(0, Ordering::SeqCst);
                let _ = self.inner.events.send(ClientEvent::Connected);

                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                *self.inner.shutdown.lock().expect("shutdown poisoned") = Some(shutdown_tx);
                let handle = tokio::spawn(supervise(
                    Arc::clone(&self.inner),
                    identity,
                    shutdown_rx,
                ));
                *self.inner.supervisor.lock().expect("supervisor poisoned") = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.inner.state.set(ConnState::Closed);
                Err(e)
            }
        }
    }

    /// Make a call with the configured default timeout.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        self.call_with_timeout(method, params, None).await
    }

    /// Make a call with an explicit timeout.
    ///
    /// Fails with NotAuthenticated - without transmitting anything - unless
    /// the session is open.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        if self.inner.state.get() != ConnState::Open {
            return Err(ClientError::NotAuthenticated);
        }
        let session = self
            .inner
            .session
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotAuthenticated)?;
        session.call(method, params, timeout).await
    }

    /// Register a push listener. See `PushDispatcher` for the matching and
    /// idempotency rules; `Subscription::unsubscribe()` removes it.
    pub fn subscribe<F>(&self, category: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.dispatcher.subscribe(category, Arc::new(handler))
    }

    /// Register a pre-wrapped handler, preserving its identity so repeated
    /// registration of the same `Arc` stays idempotent.
    pub fn subscribe_handler(&self, category: &str, handler: PushHandler) -> Subscription {
        self.inner.dispatcher.subscribe(category, handler)
    }

    /// Close cleanly from any state: pending calls are rejected with
    /// Cancelled and no reconnection is scheduled afterwards.
    pub async fn disconnect(&self) {
        if self.inner.state.get() == ConnState::Closed {
            return;
        }
        self.inner.state.set(ConnState::Closing);

        // Stop the supervisor first so no reconnect timer survives
        if let Some(tx) = self.inner.shutdown.lock().expect("shutdown poisoned").take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.inner.supervisor.lock().expect("supervisor poisoned").take() {
            handle.abort();
        }

        let session = self.inner.session.write().await.take();
        if let Some(session) = session {
            session.close().await;
        }

        self.inner.attempts.store(0, Ordering::SeqCst);
        self.inner.state.set(ConnState::Closed);
        let _ = self.inner.events.send(ClientEvent::Closed);
        info!("Coordinator client disconnected");
    }

    /// Whether a live socket is currently held.
    pub async fn is_connected(&self) -> bool {
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.is_open())
            .unwrap_or(false)
    }

    /// Whether the session is open and authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.inner.state.get() == ConnState::Open
    }

    pub fn state(&self) -> ConnState {
        self.inner.state.get()
    }

    /// Holder address derived from the configured signing key, once known.
    pub fn address(&self) -> Option<String> {
        self.inner.address.lock().expect("address poisoned").clone()
    }

    /// Opaque session token from the last successful handshake.
    pub async fn session_token(&self) -> Option<String> {
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .and_then(|s| s.token().map(str::to_string))
    }

    /// Subscribe to connection lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    // Convenience calls - fixed method names and shaped params, no protocol
    // logic beyond call().

    pub async fn get_config(&self) -> Result<Value, ClientError> {
        self.call("get_config", json!({})).await
    }

    pub async fn get_channels(&self) -> Result<Value, ClientError> {
        self.call("get_channels", json!({})).await
    }

    pub async fn get_balances(&self, account: Option<&str>) -> Result<Value, ClientError> {
        self.call("get_balances", json!({ "account": account })).await
    }

    pub async fn create_channel(&self, params: Value) -> Result<Value, ClientError> {
        self.call("create_channel", params).await
    }

    pub async fn close_channel(&self, channel_id: &str) -> Result<Value, ClientError> {
        self.call("close_channel", json!({ "channel_id": channel_id })).await
    }

    pub async fn create_app_session(&self, params: Value) -> Result<Value, ClientError> {
        self.call("create_app_session", params).await
    }

    pub async fn close_app_session(&self, app_session_id: &str) -> Result<Value, ClientError> {
        self.call("close_app_session", json!({ "app_session_id": app_session_id }))
            .await
    }

    pub async fn get_app_sessions(&self, participant: Option<&str>) -> Result<Value, ClientError> {
        self.call("get_app_sessions", json!({ "participant": participant }))
            .await
    }
}

/// Supervisor task: watches the live session and drives the reconnection
/// state machine on unexpected closure. Owned timer; cancelled via the
/// shutdown channel on manual disconnect.
async fn supervise(
    inner: Arc<ClientInner>,
    identity: Signer,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let policy = ReconnectPolicy::from_config(&inner.config);

    loop {
        let mut closed_rx = match inner.session.read().await.as_ref() {
            Some(session) => session.closed(),
            None => return,
        };

        let reason = tokio::select! {
            _ = shutdown_rx.changed() => return,
            changed = closed_rx.wait_for(|r| r.is_some()) => match changed {
                Ok(reason) => reason.unwrap_or(CloseReason::Unexpected),
                Err(_) => CloseReason::Unexpected,
            }
        };

        if reason == CloseReason::Clean {
            // disconnect() owns the state transition
            return;
        }

        warn!("Session closed unexpectedly");
        inner.session.write().await.take();
        inner.state.set(ConnState::Reconnecting);

        loop {
            let attempt = inner.attempts.load(Ordering::SeqCst);
            if policy.exhausted(attempt) {
                let message = format!("Giving up after {} reconnect attempts", attempt);
                warn!(attempts = attempt, "{}", message);
                inner.state.set(ConnState::Closed);
                let _ = inner.events.send(ClientEvent::Error { message });
                return;
            }

            let delay = policy.delay_for(attempt);
            debug!(attempt = attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
            let _ = inner.events.send(ClientEvent::Reconnecting { attempt, delay });

            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let established = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => return,
                result = Session::establish(
                    &inner.config,
                    &identity,
                    &inner.state,
                    Arc::clone(&inner.dispatcher),
                ) => result,
            };

            match established {
                Ok(session) => {
                    *inner.session.write().await = Some(Arc::new(session));
                    inner.state.set(ConnState::Open);
                    inner.attempts.store(0, Ordering::SeqCst);
                    let _ = inner.events.send(ClientEvent::Connected);
                    info!("Reconnected to coordinator");
                    break;
                }
                Err(e) if e.is_retryable() => {
                    inner.attempts.fetch_add(1, Ordering::SeqCst);
                    inner.state.set(ConnState::Reconnecting);
                    warn!(error = %e, attempt = attempt, "Reconnect attempt failed");
                }
                Err(e) => {
                    // Handshake rejection: bad credentials, not a network
                    // blip. Terminal, no silent retry.
                    warn!(error = %e, "Reconnect handshake rejected");
                    inner.state.set(ConnState::Closed);
                    let _ = inner.events.send(ClientEvent::Error {
                        message: e.to_string(),
                    });
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_attempts,
        }
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = policy(500, 5);
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(8000));
    }

    #[test]
    fn test_backoff_exhaustion() {
        let policy = policy(500, 5);
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
        assert!(policy.exhausted(6));
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let policy = policy(u64::MAX / 2, 5);
        // Saturates instead of panicking
        let _ = policy.delay_for(u32::MAX);
    }

    #[tokio::test]
    async fn test_call_before_connect_is_not_authenticated() {
        let client = CoordinatorClient::new(ClientConfig::default());
        let err = client.call("get_channels", json!([])).await.unwrap_err();
        assert!(matches!(err, ClientError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_connect_without_key_is_a_signing_error() {
        let client = CoordinatorClient::new(ClientConfig::default());
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Signing(_)));
        assert_eq!(client.state(), ConnState::Idle);
    }
}
