//! Relay event model.
//!
//! Protocol messages travel as identity-addressed events: signed by the
//! sender key, addressed to the recipient via a `p` tag, with the sealed
//! RPC payload in `content`. The event identifier is the SHA-256 of the
//! canonical serialization, and the signature is BIP340 Schnorr over that
//! identifier.

use serde::{Deserialize, Serialize};

use nsc_crypto::{sha256, KeyError, Keypair, PublicKey};

use crate::errors::ConnectError;

/// Event kind carrying sealed RPC traffic between a client and a signer.
pub const CONNECT_KIND: u32 = 24133;

/// A signed relay event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 over the canonical form).
    pub id: String,
    /// Author public key (x-only hex).
    pub pubkey: String,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Kind number.
    pub kind: u32,
    /// Free-form tags; `["p", <hex>]` addresses a recipient.
    pub tags: Vec<Vec<String>>,
    /// Content body (sealed payload for protocol events).
    pub content: String,
    /// Schnorr signature over the event identifier.
    pub sig: String,
}

/// An event under construction, before hashing and signing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Current wall-clock time as unix seconds.
pub fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

impl UnsignedEvent {
    /// Build an event authored by `author`, addressed to `recipient`.
    pub fn addressed(
        author: &PublicKey,
        recipient: &PublicKey,
        kind: u32,
        content: String,
    ) -> Self {
        Self {
            pubkey: author.to_hex(),
            created_at: now_unix(),
            kind,
            tags: vec![vec!["p".into(), recipient.to_hex()]],
            content,
        }
    }

    /// Compute the canonical event identifier.
    ///
    /// id = hex(sha256(json([0, pubkey, created_at, kind, tags, content])))
    pub fn id(&self) -> Result<String, ConnectError> {
        let canonical = serde_json::to_string(&serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content,
        ]))?;
        Ok(hex::encode(sha256(canonical.as_bytes())))
    }

    /// Hash and sign, producing a complete event.
    ///
    /// The keypair must match `pubkey`; the resulting event carries the
    /// content-derived identifier and a signature over it.
    pub fn sign(self, keypair: &Keypair) -> Result<Event, ConnectError> {
        let id = self.id()?;
        let mut digest = [0u8; 32];
        hex::decode_to_slice(&id, &mut digest)
            .map_err(|e| ConnectError::Serialization(e.to_string()))?;
        let sig = keypair
            .sign_digest(&digest)
            .map_err(|_| ConnectError::SignatureInvalid)?;

        Ok(Event {
            id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(sig),
        })
    }
}

impl Event {
    /// Verify the content-hash invariant and the signature.
    ///
    /// Returns `false` on any failure; an event that does not verify is
    /// ignored by the protocol, never treated as a valid message.
    pub fn verify(&self) -> bool {
        let unsigned = UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        };
        let expected_id = match unsigned.id() {
            Ok(id) => id,
            Err(_) => return false,
        };
        if expected_id != self.id {
            return false;
        }

        let author = match self.author() {
            Ok(pk) => pk,
            Err(_) => return false,
        };
        let mut digest = [0u8; 32];
        if hex::decode_to_slice(&self.id, &mut digest).is_err() {
            return false;
        }
        let sig = match hex::decode(&self.sig) {
            Ok(s) => s,
            Err(_) => return false,
        };
        author.verify_digest(&digest, &sig)
    }

    /// The author's public key, parsed.
    pub fn author(&self) -> Result<PublicKey, KeyError> {
        PublicKey::from_hex(&self.pubkey)
    }

    /// The recipient named by the first `p` tag, if any.
    pub fn recipient(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.len() >= 2 && t[0] == "p")
            .map(|t| t[1].as_str())
    }
}
