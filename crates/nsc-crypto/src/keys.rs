//! Identity module for signer and client keypair management.
//!
//! Provides secp256k1 Schnorr (BIP340) signing with x-only public keys and
//! secure memory handling via zeroization.

use k256::schnorr::{Signature, SigningKey, VerifyingKey};
use rand_core::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Error type for key operations.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid hex encoding")]
    InvalidHex,
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("signing failed")]
    SigningFailed,
}

/// An x-only secp256k1 public key, as carried on the wire in hex form.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Parse a public key from 32 raw x-only bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidKeyLength {
            expected: 32,
            got: bytes.len(),
        })?;
        // Reject points not on the curve up front
        VerifyingKey::from_bytes(&arr).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self(arr))
    }

    /// Parse a public key from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidHex)?;
        Self::from_bytes(&bytes)
    }

    /// Raw x-only bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Lowercase hex form, as used in events and pairing URIs.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify a BIP340 Schnorr signature over a 32-byte digest.
    ///
    /// Returns `false` for malformed signatures rather than erroring; callers
    /// treat any failure as an invalid message.
    pub fn verify_digest(&self, digest: &[u8; 32], signature: &[u8]) -> bool {
        let vk = match VerifyingKey::from_bytes(&self.0) {
            Ok(vk) => vk,
            Err(_) => return false,
        };
        let sig = match Signature::try_from(signature) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        vk.verify_raw(digest, &sig).is_ok()
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A secp256k1 Schnorr keypair.
///
/// This struct holds the private key material and provides methods for
/// signing and key derivation. Key material is securely zeroized when the
/// Keypair is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    /// BIP340 signing key
    #[zeroize(skip)] // SigningKey zeroizes internally on drop
    signing: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair using a secure random source.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::random(&mut OsRng),
        }
    }

    /// Create a keypair from a 32-byte secret key.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != 32 {
            return Err(KeyError::InvalidKeyLength {
                expected: 32,
                got: bytes.len(),
            });
        }
        let signing = SigningKey::from_bytes(bytes).map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self { signing })
    }

    /// Create a keypair from a 64-character hex secret key.
    pub fn from_secret_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidHex)?;
        Self::from_secret_bytes(&bytes)
    }

    /// Secret key in hex form, for handing to a key store.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    /// The x-only public key for this keypair.
    pub fn public_key(&self) -> PublicKey {
        let mut arr = [0u8; 32];
        arr.copy_from_slice(self.signing.verifying_key().to_bytes().as_slice());
        PublicKey(arr)
    }

    /// Sign a 32-byte digest with BIP340 Schnorr.
    ///
    /// Returns a 64-byte signature. Fresh auxiliary randomness is drawn per
    /// signature.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<[u8; 64], KeyError> {
        let mut aux = [0u8; 32];
        getrandom::getrandom(&mut aux).map_err(|_| KeyError::SigningFailed)?;
        let sig = self
            .signing
            .sign_raw(digest, &aux)
            .map_err(|_| KeyError::SigningFailed)?;
        let mut out = [0u8; 64];
        out.copy_from_slice(&sig.to_bytes());
        Ok(out)
    }

    /// Access to the inner signing key for ECDH.
    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print secret material
        write!(f, "Keypair({})", self.public_key().to_hex())
    }
}
