//! Error types for NSC Core.
//!
//! This module defines the error taxonomy surfaced to applications. The
//! guiding policy: cryptographic and transport anomalies on the inbound path
//! (corrupt or foreign relay traffic, bad signatures, undecryptable
//! payloads) are absorbed at the lowest layer that can safely ignore them;
//! only caller-initiated operations surface typed failures.

use std::time::Duration;

use thiserror::Error;

use crate::relay::RelayError;
use crate::uri::UriError;

/// Errors surfaced by sessions and RPC calls.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Pairing invitation could not be parsed. Fatal to that pairing
    /// attempt; the user must obtain a new invitation.
    #[error("malformed pairing URI: {0}")]
    MalformedUri(#[from] UriError),

    /// Relay connect or publish failure. Retryable by the caller; never
    /// auto-retried internally.
    #[error("relay unavailable: {0}")]
    TransportUnavailable(String),

    /// No response arrived within the call's deadline. Recoverable; the
    /// caller may retry with a fresh correlation id. Undecryptable or
    /// malformed responses also end up here, since the relay is lossy.
    #[error("rpc call timed out after {0:?}")]
    RpcTimeout(Duration),

    /// Signature verification failed on material the caller asked for
    /// (a returned event or grant). Incoming relay traffic with bad
    /// signatures is dropped silently instead.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// Operation attempted after the session reached `Disconnected`.
    /// Fails immediately; no network activity is performed.
    #[error("session is closed")]
    SessionClosed,

    /// Invalid state transition.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The peer answered with a protocol-level error.
    #[error("peer error: {0}")]
    Peer(String),

    /// Local serialization failure.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Key store operation failed.
    #[error("store error: {0}")]
    Store(String),
}

impl From<RelayError> for ConnectError {
    fn from(e: RelayError) -> Self {
        ConnectError::TransportUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for ConnectError {
    fn from(e: serde_json::Error) -> Self {
        ConnectError::Serialization(e.to_string())
    }
}

impl From<crate::store::StoreError> for ConnectError {
    fn from(e: crate::store::StoreError) -> Self {
        ConnectError::Store(e.to_string())
    }
}
