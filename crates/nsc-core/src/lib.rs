//! NSC Core - Session and protocol logic for Nostr Signer Connect.
//!
//! This crate implements:
//! - Pairing invitation URIs (encode/decode)
//! - Session state machines (client and signer)
//! - RPC framing, correlation, and sealed transport
//! - Relay channel abstraction with an in-memory implementation
//! - Delegation grants
//! - Persistent storage abstraction

#![forbid(unsafe_code)]

// Core state machines
pub mod session;

// Services
pub mod rpc;
pub mod relay;
pub mod delegation;

// Infrastructure
pub mod store;

// Supporting modules
pub mod errors;
pub mod event;
pub mod uri;
pub mod harness;

pub use delegation::{Conditions, DelegationGrant};
pub use errors::ConnectError;
pub use event::{Event, UnsignedEvent, CONNECT_KIND};
pub use relay::{MemoryRelay, RelayChannel, RelayError};
pub use session::{
    AcceptAll, ApprovalHandler, InvitePolicy, Session, SessionConfig, SessionNotification,
    SessionState, SignerSession,
};
pub use store::{KeyStore, MemoryStore, StoreError};
pub use uri::{ConnectUri, Metadata, UriError};
