//! Pairing URI encoding and decoding.
//!
//! A pairing invitation is a single shareable string: the target identity,
//! the relay endpoint to meet on, and optional presentation metadata.
//! Encoding is deterministic so identical invitations always produce
//! byte-identical URIs (display-compare tests and deep links depend on it).
//! The URI carries no expiry or single-use enforcement; that is session
//! policy (see [`crate::session::InvitePolicy`]).

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use nsc_crypto::PublicKey;

/// Fixed URI scheme for pairing invitations.
pub const URI_SCHEME: &str = "nostrconnect";

/// Errors from pairing URI parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UriError {
    #[error("not a valid URI: {0}")]
    Unparseable(String),
    #[error("unexpected scheme: {0}")]
    WrongScheme(String),
    #[error("missing or invalid target identity")]
    InvalidTarget,
    #[error("missing or invalid relay endpoint")]
    InvalidRelay,
}

/// Application metadata carried in an invitation.
///
/// All fields are optional; absent fields decode to empty defaults, never
/// to errors. Unknown fields in the encoded form are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub icons: Vec<String>,
}

/// A decoded pairing invitation.
///
/// Immutable once constructed; `target` and `relay` are mandatory,
/// `metadata` round-trips exactly through encode/decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectUri {
    /// Target identity (x-only public key, lowercase hex).
    pub target: String,
    /// Relay endpoint URL (`ws://` or `wss://`).
    pub relay: String,
    /// Application metadata.
    pub metadata: Metadata,
}

impl ConnectUri {
    /// Build an invitation, validating the mandatory fields.
    pub fn new(target: &PublicKey, relay: &str, metadata: Metadata) -> Result<Self, UriError> {
        validate_relay(relay)?;
        Ok(Self {
            target: target.to_hex(),
            relay: relay.to_string(),
            metadata,
        })
    }

    /// Encode to the shareable URI string.
    ///
    /// Deterministic: query parameters always appear in the order
    /// `relay`, `metadata`.
    pub fn encode(&self) -> String {
        let metadata_json =
            serde_json::to_string(&self.metadata).unwrap_or_else(|_| "{}".to_string());
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair("relay", &self.relay);
        query.append_pair("metadata", &metadata_json);
        format!("{}://{}?{}", URI_SCHEME, self.target, query.finish())
    }

    /// Decode a URI string back into an invitation.
    ///
    /// Fails with [`UriError`] when the scheme, target identity, or relay
    /// endpoint is missing or unparseable.
    pub fn decode(input: &str) -> Result<Self, UriError> {
        let parsed = Url::parse(input).map_err(|e| UriError::Unparseable(e.to_string()))?;
        if parsed.scheme() != URI_SCHEME {
            return Err(UriError::WrongScheme(parsed.scheme().to_string()));
        }

        let target = parsed
            .host_str()
            .ok_or(UriError::InvalidTarget)?
            .to_ascii_lowercase();
        PublicKey::from_hex(&target).map_err(|_| UriError::InvalidTarget)?;

        let mut relay = None;
        let mut metadata = Metadata::default();
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "relay" => relay = Some(value.into_owned()),
                "metadata" => {
                    // Lenient: a malformed metadata blob degrades to defaults
                    if let Ok(m) = serde_json::from_str(&value) {
                        metadata = m;
                    }
                }
                _ => {}
            }
        }

        let relay = relay.ok_or(UriError::InvalidRelay)?;
        validate_relay(&relay)?;

        Ok(Self {
            target,
            relay,
            metadata,
        })
    }
}

impl std::fmt::Display for ConnectUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

fn validate_relay(relay: &str) -> Result<(), UriError> {
    let parsed = Url::parse(relay).map_err(|_| UriError::InvalidRelay)?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        _ => Err(UriError::InvalidRelay),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nsc_crypto::Keypair;

    fn sample_metadata() -> Metadata {
        Metadata {
            name: "Playground".into(),
            description: "a signer playground".into(),
            url: "https://example.com".into(),
            icons: vec!["https://example.com/icon.png".into()],
        }
    }

    #[test]
    fn test_round_trip_full_metadata() {
        let target = Keypair::generate().public_key();
        let uri = ConnectUri::new(&target, "wss://relay.damus.io", sample_metadata()).unwrap();
        let decoded = ConnectUri::decode(&uri.encode()).unwrap();
        assert_eq!(uri, decoded);
    }

    #[test]
    fn test_round_trip_empty_metadata() {
        let target = Keypair::generate().public_key();
        let uri = ConnectUri::new(&target, "wss://relay.damus.io", Metadata::default()).unwrap();
        let decoded = ConnectUri::decode(&uri.encode()).unwrap();
        assert_eq!(uri, decoded);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let target = Keypair::generate().public_key();
        let a = ConnectUri::new(&target, "wss://relay.damus.io", sample_metadata()).unwrap();
        let b = ConnectUri::new(&target, "wss://relay.damus.io", sample_metadata()).unwrap();
        assert_eq!(a.encode(), b.encode());
    }

    #[test]
    fn test_decode_recovers_target_and_relay() {
        let target = Keypair::generate().public_key();
        let uri = ConnectUri::new(&target, "wss://relay.damus.io", Metadata::default()).unwrap();
        let decoded = ConnectUri::decode(&uri.encode()).unwrap();
        assert_eq!(decoded.target, target.to_hex());
        assert_eq!(decoded.relay, "wss://relay.damus.io");
    }

    #[test]
    fn test_rejects_wrong_scheme() {
        let err = ConnectUri::decode("https://example.com?relay=wss%3A%2F%2Fr").unwrap_err();
        assert!(matches!(err, UriError::WrongScheme(_)));
    }

    #[test]
    fn test_rejects_missing_relay() {
        let target = Keypair::generate().public_key().to_hex();
        let err = ConnectUri::decode(&format!("nostrconnect://{target}")).unwrap_err();
        assert_eq!(err, UriError::InvalidRelay);
    }

    #[test]
    fn test_rejects_bad_target() {
        let err =
            ConnectUri::decode("nostrconnect://nothex?relay=wss%3A%2F%2Frelay.damus.io").unwrap_err();
        assert_eq!(err, UriError::InvalidTarget);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(ConnectUri::decode("not a uri at all").is_err());
    }

    #[test]
    fn test_malformed_metadata_degrades_to_default() {
        let target = Keypair::generate().public_key().to_hex();
        let uri = format!(
            "nostrconnect://{target}?relay=wss%3A%2F%2Frelay.damus.io&metadata=%7Bbroken"
        );
        let decoded = ConnectUri::decode(&uri).unwrap();
        assert_eq!(decoded.metadata, Metadata::default());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Any printable metadata round-trips exactly
            #[test]
            fn test_metadata_round_trip(
                name in "[ -~]{0,40}",
                description in "[ -~]{0,40}",
                site in "[ -~]{0,40}",
            ) {
                let target = Keypair::generate().public_key();
                let metadata = Metadata {
                    name,
                    description,
                    url: site,
                    icons: vec![],
                };
                let uri = ConnectUri::new(&target, "wss://relay.damus.io", metadata).unwrap();
                let decoded = ConnectUri::decode(&uri.encode()).unwrap();
                prop_assert_eq!(uri, decoded);
            }
        }
    }
}
