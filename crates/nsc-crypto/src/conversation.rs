//! Conversation key derivation between two identities.
//!
//! Both parties derive the same symmetric key from their own secret key and
//! the peer's x-only public key: secp256k1 ECDH followed by HKDF-SHA256.
//! The relay between them only ever observes ciphertext sealed under this
//! key (see [`crate::payload`]).

use hkdf::Hkdf;
use sha2::Sha256;

use crate::keys::{KeyError, Keypair, PublicKey};

/// Derive the shared conversation key for `local` and `peer`.
///
/// Only the x coordinate of the ECDH point feeds the KDF, so the result is
/// identical regardless of which side computes it from x-only key material.
pub fn conversation_key(local: &Keypair, peer: &PublicKey) -> Result<[u8; 32], KeyError> {
    // Lift the x-only peer key to a full point (even-y per BIP340)
    let mut sec1 = [0u8; 33];
    sec1[0] = 0x02;
    sec1[1..].copy_from_slice(&peer.to_bytes());
    let peer_point =
        k256::PublicKey::from_sec1_bytes(&sec1).map_err(|_| KeyError::InvalidPublicKey)?;

    let shared = k256::ecdh::diffie_hellman(
        local.signing_key().as_nonzero_scalar(),
        peer_point.as_affine(),
    );

    let hk = Hkdf::<Sha256>::new(None, shared.raw_secret_bytes().as_slice());
    let mut key = [0u8; 32];
    hk.expand(b"nsc_conversation_v1", &mut key)
        .unwrap(); // Output size matches digest size, infallible

    Ok(key)
}
