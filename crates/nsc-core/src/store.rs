//! Storage abstraction for session key material.
//!
//! This module defines the `KeyStore` trait and provides an in-memory
//! implementation for testing. The protocol only ever touches persistent
//! state through these narrow accessors: the local secret key is read on
//! session construction, and the last-known peer is written on pairing
//! success.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("storage operation failed: {0}")]
    OperationFailed(String),
}

/// Opaque key/value persistence consumed by sessions.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Load the local identity's secret key (hex), if one was persisted.
    async fn load_secret(&self) -> Result<Option<String>, StoreError>;

    /// Persist the local identity's secret key (hex). Called on generation
    /// and on key rotation.
    async fn save_secret(&self, secret_hex: &str) -> Result<(), StoreError>;

    /// Load the last-known peer identity (x-only hex), if any.
    async fn load_peer(&self) -> Result<Option<String>, StoreError>;

    /// Record or clear the last-known peer identity. Written on pairing
    /// success and cleared on disconnect.
    async fn save_peer(&self, pubkey_hex: Option<&str>) -> Result<(), StoreError>;
}

// ============================================================================
// In-Memory Store
// ============================================================================

#[derive(Default)]
struct MemoryStoreInner {
    secret: Option<String>,
    peer: Option<String>,
}

/// In-memory store for testing and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn load_secret(&self) -> Result<Option<String>, StoreError> {
        Ok(self.inner.read().await.secret.clone())
    }

    async fn save_secret(&self, secret_hex: &str) -> Result<(), StoreError> {
        self.inner.write().await.secret = Some(secret_hex.to_string());
        Ok(())
    }

    async fn load_peer(&self) -> Result<Option<String>, StoreError> {
        Ok(self.inner.read().await.peer.clone())
    }

    async fn save_peer(&self, pubkey_hex: Option<&str>) -> Result<(), StoreError> {
        self.inner.write().await.peer = pubkey_hex.map(str::to_string);
        Ok(())
    }
}
