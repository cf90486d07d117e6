//! Payload module for sealed message contents.
//! Implements AEAD sealing under a conversation key using ChaCha20Poly1305.
//!
//! The sealed form travels as the `content` field of a relay event:
//! `base64(nonce || ciphertext)`. The relay is untrusted routing, so
//! confidentiality and integrity come entirely from this layer plus the
//! event signature.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};

/// AEAD nonce length in bytes.
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("malformed payload")]
    Malformed,
}

/// Seal `plaintext` under `conversation_key`, producing the transport string.
///
/// A fresh random nonce is drawn per payload and prepended to the ciphertext
/// before base64 encoding.
pub fn seal(conversation_key: &[u8; 32], plaintext: &[u8]) -> Result<String, PayloadError> {
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce).map_err(|_| PayloadError::EncryptFailed)?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(conversation_key));
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| PayloadError::EncryptFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(BASE64.encode(out))
}

/// Open a transport string sealed with [`seal`].
///
/// Fails with a typed error on malformed or undecryptable input; callers at
/// the protocol layer drop such payloads silently since the relay stream
/// carries traffic for other pairings too.
pub fn open(conversation_key: &[u8; 32], transport: &str) -> Result<Vec<u8>, PayloadError> {
    let raw = BASE64.decode(transport).map_err(|_| PayloadError::Malformed)?;
    if raw.len() <= NONCE_LEN {
        return Err(PayloadError::Malformed);
    }
    let (nonce, ct) = raw.split_at(NONCE_LEN);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(conversation_key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ct)
        .map_err(|_| PayloadError::DecryptFailed)
}
