//! Error types for coordinator-client

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    /// Socket-level failure (connect refused, DNS, TLS, send/receive).
    /// Subject to the reconnection policy.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The coordinator rejected the challenge-response handshake.
    /// Terminal for the current connect - never silently retried.
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// A call did not receive a reply within its deadline.
    #[error("Request timeout: {method}")]
    Timeout { method: String },

    /// The socket closed unexpectedly while the request was in flight.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The wait was ended by the caller or a manual disconnect.
    #[error("Request cancelled")]
    Cancelled,

    /// Malformed envelope on the wire. Logged and dropped by the receive
    /// loop; surfaced directly only during the handshake.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A call was issued while the session is not open.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// No signing key configured, or the payload could not be canonicalized.
    /// Fatal for the handshake, never retried.
    #[error("Signing error: {0}")]
    Signing(String),

    /// The coordinator answered this call with an error reply.
    #[error("Coordinator error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Whether the reconnection policy may retry after this error.
    /// Auth and signing failures are terminal; everything else that can
    /// occur while establishing a session is treated as a network blip.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ClientError::Auth(_) | ClientError::Signing(_) | ClientError::Config(_)
        )
    }
}
