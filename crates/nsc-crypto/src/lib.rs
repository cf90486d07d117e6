//! NSC Crypto - Cryptographic primitives for Nostr Signer Connect.
//!
//! This crate implements:
//! - secp256k1 Schnorr (BIP340) identity keypairs with x-only public keys
//! - SHA-256 hashing helpers
//! - Conversation key derivation (ECDH + HKDF) between two identities
//! - Authenticated payload sealing for relay-carried message contents

#![forbid(unsafe_code)]

pub mod conversation;
pub mod hash;
pub mod keys;
pub mod payload;

#[cfg(test)]
mod proptests;

pub use conversation::conversation_key;
pub use hash::sha256;
pub use keys::{KeyError, Keypair, PublicKey};
pub use payload::{open, seal, PayloadError};
