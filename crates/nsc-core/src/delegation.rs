//! Delegation grants.
//!
//! A grant lets a delegatee sign events on the delegator's behalf, bounded
//! by a kind filter and a validity window. The delegator signs the
//! canonical token `nostr:delegation:<delegatee>:<conditions>`; signing
//! happens only inside the key-holding session, which never exposes the
//! secret. Verifiers recompute the token and check the signature, and must
//! reject a grant outside its validity window.

use serde::{Deserialize, Serialize};

use nsc_crypto::{sha256, KeyError, Keypair, PublicKey};

use crate::event::now_unix;

/// Conditions scoping a delegation grant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditions {
    /// Permitted event kind, if restricted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<u32>,
    /// Window start (unix seconds), exclusive of earlier times.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    /// Window end (unix seconds); the grant is meaningless at or after it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
}

impl Conditions {
    /// Canonical query-string encoding of the conditions.
    ///
    /// Field order is fixed (`kind`, `created_at>`, `created_at<`) so the
    /// signed token is deterministic.
    pub fn canonical(&self) -> String {
        let mut parts = Vec::new();
        if let Some(kind) = self.kind {
            parts.push(format!("kind={kind}"));
        }
        if let Some(since) = self.since {
            parts.push(format!("created_at>{since}"));
        }
        if let Some(until) = self.until {
            parts.push(format!("created_at<{until}"));
        }
        parts.join("&")
    }

    /// Whether `now` falls inside the validity window.
    pub fn in_window(&self, now: u64) -> bool {
        if let Some(since) = self.since {
            if now <= since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if now >= until {
                return false;
            }
        }
        true
    }
}

/// The canonical token a delegator signs.
pub fn delegation_token(delegatee_hex: &str, conditions: &Conditions) -> String {
    format!(
        "nostr:delegation:{}:{}",
        delegatee_hex,
        conditions.canonical()
    )
}

/// Sign a delegation token. Only the key-holding side calls this.
///
/// Returns the hex signature that, combined with the conditions, forms a
/// [`DelegationGrant`].
pub fn sign_delegation(
    delegator: &Keypair,
    delegatee_hex: &str,
    conditions: &Conditions,
) -> Result<String, KeyError> {
    let token = delegation_token(delegatee_hex, conditions);
    let digest = sha256(token.as_bytes());
    let sig = delegator.sign_digest(&digest)?;
    Ok(hex::encode(sig))
}

/// A complete delegation grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationGrant {
    /// Identity that granted the authority (x-only hex).
    pub delegator: String,
    /// Identity allowed to sign on the delegator's behalf (x-only hex).
    pub delegatee: String,
    /// Scope and validity window.
    pub conditions: Conditions,
    /// Delegator's signature over the canonical token (hex).
    pub sig: String,
}

impl DelegationGrant {
    /// Verify the grant at wall-clock `now`.
    ///
    /// Recomputes the canonical token, checks the signature against the
    /// delegator identity, and checks the validity window. Expired,
    /// altered, or malformed grants verify as `false`, never error.
    pub fn verify_at(&self, now: u64) -> bool {
        if !self.conditions.in_window(now) {
            return false;
        }
        let delegator = match PublicKey::from_hex(&self.delegator) {
            Ok(pk) => pk,
            Err(_) => return false,
        };
        let sig = match hex::decode(&self.sig) {
            Ok(s) => s,
            Err(_) => return false,
        };
        let token = delegation_token(&self.delegatee, &self.conditions);
        delegator.verify_digest(&sha256(token.as_bytes()), &sig)
    }

    /// Verify the grant against the current wall clock.
    pub fn verify(&self) -> bool {
        self.verify_at(now_unix())
    }
}
