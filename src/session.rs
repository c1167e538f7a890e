//! Coordinator session
//!
//! Single responsibility: an authenticated, ready-to-use connection to the
//! coordinator.
//!
//! A `Session` can ONLY be created via `Session::establish()`, which:
//! 1. Opens the socket
//! 2. Sends the auth request (holder address + fresh session key)
//! 3. Signs the server's challenge and sends the verification
//! 4. Only returns once the coordinator confirms authentication
//!
//! This makes it impossible to hold a Session that isn't ready: if you have
//! one, you can make signed calls. Sessions do NOT reconnect themselves - if
//! the socket dies, the session is gone. `CoordinatorClient` owns the
//! reconnection policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::correlator::Correlator;
use crate::dispatch::PushDispatcher;
use crate::envelope::{unix_ts_ms, Envelope};
use crate::error::ClientError;
use crate::signer::Signer;
use crate::transport::{Transport, WsSink, WsStream};

/// Push category the coordinator uses to deliver the auth challenge.
pub const AUTH_CHALLENGE_CATEGORY: &str = "auth_challenge";

/// Connection state machine.
///
/// `Reconnecting` is reachable from `Open` or any handshake state on
/// unexpected closure, looping back to `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    AwaitingChallenge,
    Authenticating,
    Open,
    Closing,
    Closed,
    Reconnecting,
}

/// Shared, observable connection state.
#[derive(Clone)]
pub struct StateHandle(Arc<StdMutex<ConnState>>);

impl StateHandle {
    pub fn new() -> Self {
        Self(Arc::new(StdMutex::new(ConnState::Idle)))
    }

    pub fn get(&self) -> ConnState {
        *self.0.lock().expect("state poisoned")
    }

    pub fn set(&self, state: ConnState) {
        *self.0.lock().expect("state poisoned") = state;
    }
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the session's receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client-initiated close; pending requests were cancelled.
    Clean,
    /// Server closed or the socket failed; pending requests were rejected
    /// with ConnectionClosed and the reconnection policy takes over.
    Unexpected,
}

/// An authenticated session with the coordinator.
///
/// Holding one guarantees the handshake succeeded. Valid until the
/// coordinator closes the connection, a network error occurs, or the session
/// is explicitly closed.
pub struct Session {
    /// Send half, shared between concurrent callers
    sink: Mutex<WsSink>,
    correlator: Arc<Correlator>,
    /// Fresh per-session key; signs every call after the handshake
    session_signer: Signer,
    /// Opaque token from auth-success; advisory, revalidated on reconnect
    token: Option<String>,
    default_timeout: Duration,
    /// Set by close() so the receive loop can tell a clean close apart
    closing: Arc<AtomicBool>,
    closed_rx: watch::Receiver<Option<CloseReason>>,
    recv_task: tokio::task::JoinHandle<()>,
}

impl Session {
    /// Establish a new authenticated session.
    ///
    /// Blocks until the full challenge-response handshake has completed; if
    /// any step fails, an error is returned and no session exists. Transport
    /// and protocol errors during the handshake are retryable; an explicit
    /// rejection from the coordinator is not.
    pub async fn establish(
        config: &ClientConfig,
        identity: &Signer,
        state: &StateHandle,
        dispatcher: Arc<PushDispatcher>,
    ) -> Result<Self, ClientError> {
        let hs_timeout = config.handshake_timeout();

        state.set(ConnState::Connecting);
        let mut transport = Transport::connect(&config.url).await?;

        let correlator = Arc::new(Correlator::new());
        let session_signer = Signer::generate();
        let address = identity.address();

        info!(
            url = %config.url,
            address = %address,
            app_name = %config.app_name,
            "Establishing coordinator session"
        );

        // Step 1: auth request with holder address and fresh session key
        let auth_params = json!({
            "address": address,
            "session_key": session_signer.public_key_hex(),
            "app_name": config.app_name,
            "expire": config.expire_secs,
            "scope": config.scope,
            "application": config.application,
            "allowances": config.allowances,
        });
        let auth_id = correlator.next_id();
        send_signed(&mut transport, identity, auth_id, "auth_request", auth_params).await?;
        state.set(ConnState::AwaitingChallenge);

        // Step 2: the challenge arrives as a push
        let challenge = await_challenge(&mut transport, &dispatcher, auth_id, hs_timeout).await?;
        debug!("Auth challenge received");

        // Step 3: prove we hold the claimed key
        let challenge_signature = identity.sign(&json!({ "challenge": challenge }))?;
        let verify_params = json!({
            "challenge": challenge,
            "signature": challenge_signature,
        });
        let verify_id = correlator.next_id();
        send_signed(&mut transport, identity, verify_id, "auth_verify", verify_params).await?;
        state.set(ConnState::Authenticating);

        // Step 4: auth result correlated to the verify request
        let token = await_auth_result(&mut transport, &dispatcher, verify_id, hs_timeout).await?;
        info!(address = %address, "Coordinator session authenticated");

        // Only now split for concurrent send/receive and start routing
        let (sink, stream) = transport.split();
        let closing = Arc::new(AtomicBool::new(false));
        let (closed_tx, closed_rx) = watch::channel(None);

        let recv_task = tokio::spawn(receive_loop(
            stream,
            Arc::clone(&correlator),
            dispatcher,
            Arc::clone(&closing),
            closed_tx,
        ));

        Ok(Self {
            sink: Mutex::new(sink),
            correlator,
            session_signer,
            token,
            default_timeout: config.request_timeout(),
            closing,
            closed_rx,
            recv_task,
        })
    }

    /// Make a signed call on this session and wait for the correlated reply.
    ///
    /// The request is signed with the session key. `timeout_override`
    /// replaces the configured default deadline; no call waits indefinitely.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout_override: Option<Duration>,
    ) -> Result<Value, ClientError> {
        let id = self.correlator.next_id();
        let ts = unix_ts_ms();
        let sig = self.session_signer.sign_request(id, method, &params, ts)?;

        let envelope = Envelope::Request {
            id,
            method: method.to_string(),
            params,
            ts,
            sig,
        };
        let frame = envelope.encode()?;

        debug!(id = id, method = %method, "Sending call");
        let reply_rx = self.correlator.register(id, method).await;

        {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.send(Message::Text(frame)).await {
                self.correlator.remove(id).await;
                return Err(ClientError::Transport(format!("Failed to send: {}", e)));
            }
        }

        let deadline = timeout_override.unwrap_or(self.default_timeout);
        match timeout(deadline, reply_rx).await {
            Ok(Ok(result)) => result,
            // Slot dropped without settling: receive task died mid-flight
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.correlator.remove(id).await;
                Err(ClientError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    /// Close the session cleanly: pending requests are rejected with
    /// Cancelled (not ConnectionClosed) and a close frame is sent.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.correlator.reject_all(|_| ClientError::Cancelled).await;

        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Close(None)).await {
            debug!(error = %e, "Close frame not delivered");
        }
    }

    /// Whether the receive loop is still routing envelopes.
    pub fn is_open(&self) -> bool {
        self.closed_rx.borrow().is_none() && !self.recv_task.is_finished()
    }

    /// Watch that resolves with the close reason when the session dies.
    pub fn closed(&self) -> watch::Receiver<Option<CloseReason>> {
        self.closed_rx.clone()
    }

    /// Opaque session token from auth-success, if the coordinator issued one.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.recv_task.abort();
        debug!("Session dropped, receive task aborted");
    }
}

/// Sign and send one request envelope on an unsplit transport (handshake).
async fn send_signed(
    transport: &mut Transport,
    signer: &Signer,
    id: u64,
    method: &str,
    params: Value,
) -> Result<(), ClientError> {
    let ts = unix_ts_ms();
    let sig = signer.sign_request(id, method, &params, ts)?;
    let envelope = Envelope::Request {
        id,
        method: method.to_string(),
        params,
        ts,
        sig,
    };
    transport.send(envelope.encode()?).await
}

/// Wait for the auth challenge push, delivering unrelated pushes on the way.
async fn await_challenge(
    transport: &mut Transport,
    dispatcher: &PushDispatcher,
    auth_id: u64,
    hs_timeout: Duration,
) -> Result<String, ClientError> {
    loop {
        let envelope = next_handshake_envelope(transport, hs_timeout, "challenge").await?;
        match envelope {
            Envelope::Push { category, payload } if category == AUTH_CHALLENGE_CATEGORY => {
                let challenge = payload
                    .get("challenge")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ClientError::Protocol("Challenge push missing 'challenge'".into())
                    })?;
                return Ok(challenge.to_string());
            }
            Envelope::Push { category, payload } => dispatcher.dispatch(&category, &payload),
            Envelope::Response {
                id,
                error: Some(e), ..
            } if id == auth_id => {
                return Err(ClientError::Auth(e.message));
            }
            other => {
                return Err(ClientError::Protocol(format!(
                    "Unexpected envelope while awaiting challenge: {:?}",
                    other
                )))
            }
        }
    }
}

/// Wait for the auth result reply. Returns the session token, if any.
async fn await_auth_result(
    transport: &mut Transport,
    dispatcher: &PushDispatcher,
    verify_id: u64,
    hs_timeout: Duration,
) -> Result<Option<String>, ClientError> {
    loop {
        let envelope = next_handshake_envelope(transport, hs_timeout, "auth result").await?;
        match envelope {
            Envelope::Response { id, result, error } if id == verify_id => {
                if let Some(e) = error {
                    return Err(ClientError::Auth(e.message));
                }
                let success = result
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if !success {
                    return Err(ClientError::Auth("Challenge verification rejected".into()));
                }
                let token = result
                    .get("token")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                return Ok(token);
            }
            Envelope::Push { category, payload } => dispatcher.dispatch(&category, &payload),
            other => {
                return Err(ClientError::Protocol(format!(
                    "Unexpected envelope while awaiting auth result: {:?}",
                    other
                )))
            }
        }
    }
}

/// One decoded frame during the handshake, with a per-step deadline.
/// Handshake failures reject the in-flight connect instead of being dropped.
async fn next_handshake_envelope(
    transport: &mut Transport,
    hs_timeout: Duration,
    step: &str,
) -> Result<Envelope, ClientError> {
    let frame = timeout(hs_timeout, transport.recv())
        .await
        .map_err(|_| ClientError::Transport(format!("Handshake timed out awaiting {}", step)))??
        .ok_or_else(|| {
            ClientError::Transport(format!("Connection closed while awaiting {}", step))
        })?;
    Envelope::decode(&frame)
}

/// Receive loop - the only place envelopes are processed after the
/// handshake, serially in arrival order. Replies carrying a pending id go to
/// the correlator; everything else goes to the push dispatcher. One bad
/// envelope never terminates the loop.
async fn receive_loop(
    mut stream: WsStream,
    correlator: Arc<Correlator>,
    dispatcher: Arc<PushDispatcher>,
    closing: Arc<AtomicBool>,
    closed_tx: watch::Sender<Option<CloseReason>>,
) {
    debug!("Receive loop started");

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match Envelope::decode(&text) {
                Ok(Envelope::Response { id, result, error }) => {
                    let outcome = match error {
                        Some(e) => Err(ClientError::Remote {
                            code: e.code,
                            message: e.message,
                        }),
                        None => Ok(result),
                    };
                    correlator.resolve(id, outcome).await;
                }
                Ok(Envelope::Push { category, payload }) => {
                    dispatcher.dispatch(&category, &payload);
                }
                Ok(Envelope::Request { id, method, .. }) => {
                    warn!(id = id, method = %method, "Dropping request envelope from coordinator");
                }
                Err(e) => {
                    warn!(error = %e, "Dropping malformed envelope");
                }
            },
            Ok(Message::Ping(_)) => {
                // Pong is handled automatically by tungstenite
            }
            Ok(Message::Close(frame)) => {
                info!(frame = ?frame, "Coordinator closed connection");
                break;
            }
            Err(e) => {
                error!(error = %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    let reason = if closing.load(Ordering::SeqCst) {
        CloseReason::Clean
    } else {
        CloseReason::Unexpected
    };
    debug!(reason = ?reason, "Receive loop ended");

    let make_error: fn(&str) -> ClientError = match reason {
        CloseReason::Clean => |_| ClientError::Cancelled,
        CloseReason::Unexpected => |_| ClientError::ConnectionClosed,
    };
    correlator.reject_all(make_error).await;

    let _ = closed_tx.send(Some(reason));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_handle_transitions() {
        let state = StateHandle::new();
        assert_eq!(state.get(), ConnState::Idle);
        state.set(ConnState::Connecting);
        state.set(ConnState::Open);
        assert_eq!(state.get(), ConnState::Open);
    }
}
