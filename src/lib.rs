//! Coordinator session client
//!
//! An authenticated session client for the settlement/ledger coordinator:
//! a long-lived, bidirectional WebSocket carrying signed RPC calls and
//! unsolicited push notifications, presented to the application as a simple
//! call/response API.
//!
//! ## Architecture
//!
//! The crate is organized by concern, with each module having a single
//! responsibility:
//!
//! | Module       | Responsibility                                      |
//! |--------------|-----------------------------------------------------|
//! | `transport`  | WebSocket connect/send/receive                      |
//! | `envelope`   | Wire format - one validating parser at the boundary |
//! | `signer`     | Ed25519 signing over canonical payload bytes        |
//! | `correlator` | Pending-request table, id allocation, settlement    |
//! | `dispatch`   | Push fan-out to category listeners                  |
//! | `session`    | An authenticated, ready-to-use connection           |
//! | `client`     | Facade with the reconnection state machine          |
//!
//! ## Key Design Principles
//!
//! ### 1. Make Invalid States Unrepresentable
//!
//! - `Session` can only be created via `Session::establish()`
//! - `establish()` blocks until the challenge-response handshake completed
//! - If you have a `Session`, you can make signed calls
//!
//! ### 2. One Receive Path
//!
//! The socket's receive task is the only place envelopes are processed,
//! serially in arrival order. Replies route to the caller by correlation id;
//! everything else fans out to push subscribers. A malformed envelope is
//! logged and dropped, never rethrown into the loop.
//!
//! ### 3. Errors Always Surface
//!
//! The client never substitutes fallback data. Correlated failures reach
//! the caller whose request failed; unsolicited ones arrive on the event
//! channel. Callers can branch on the error kind (`Transport`, `Auth`,
//! `Timeout`, `ConnectionClosed`, `Cancelled`, ...).
//!
//! ## Usage
//!
//! ```ignore
//! use coordinator_client::{ClientConfig, CoordinatorClient};
//!
//! let client = CoordinatorClient::new(ClientConfig {
//!     url: "wss://clearing.example.com/ws".to_string(),
//!     private_key: Some(std::env::var("COORDINATOR_KEY")?),
//!     ..Default::default()
//! });
//!
//! // Blocks until the handshake completed
//! client.connect().await?;
//!
//! let subscription = client.subscribe("channel_update", |payload| {
//!     println!("channel update: {payload}");
//! });
//!
//! let channels = client.get_channels().await?;
//!
//! subscription.unsubscribe();
//! client.disconnect().await;
//! ```

pub mod client;
pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod session;
pub mod signer;
pub mod transport;

// Re-export the public API
pub use client::{ClientEvent, CoordinatorClient, ReconnectPolicy};
pub use config::{Allowance, ClientConfig};
pub use dispatch::{PushDispatcher, PushHandler, Subscription, WILDCARD_CATEGORY};
pub use envelope::{Envelope, WireError};
pub use error::ClientError;
pub use session::{ConnState, Session};
pub use signer::Signer;
