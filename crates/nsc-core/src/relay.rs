//! Relay channel abstraction.
//!
//! The relay itself is an external collaborator: an untrusted, shared
//! publish/subscribe bus with no delivery guarantees. This module defines
//! the seam the protocol consumes and provides an in-process implementation
//! used by the harness and tests.
//!
//! The layers above treat a channel as unordered and unreliable: messages
//! may be duplicated, reordered, lost, or belong to other pairings
//! entirely, and the RPC correlation table tolerates all of it.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::event::Event;

/// Errors from relay operations.
#[derive(Debug, Error, Clone)]
pub enum RelayError {
    /// Connection or publish failure. Retryable by the caller.
    #[error("relay unavailable: {0}")]
    Unavailable(String),
}

/// Capacity of a per-subscriber delivery queue.
const SUBSCRIPTION_BUFFER: usize = 64;

/// Duplex access to one relay endpoint.
///
/// `publish` is fire-and-forget; no delivery acknowledgement is assumed.
/// `subscribe` yields a stream of events addressed to `recipient` that
/// never terminates on its own; cancellation is caller-driven (drop the
/// receiver).
#[async_trait]
pub trait RelayChannel: Send + Sync {
    /// Publish an event to the relay.
    async fn publish(&self, event: Event) -> Result<(), RelayError>;

    /// Subscribe to events addressed (via `p` tag) to `recipient`.
    async fn subscribe(&self, recipient: &str) -> Result<mpsc::Receiver<Event>, RelayError>;
}

// ============================================================================
// In-Memory Relay
// ============================================================================

struct Subscriber {
    recipient: String,
    tx: mpsc::Sender<Event>,
}

/// In-process relay for tests and local wiring.
///
/// One shared instance fans events out to every matching subscriber.
/// Publishes from concurrent sessions are serialized by the subscriber
/// lock, so sessions sharing a relay never corrupt each other's traffic.
/// Delivery is best-effort: a slow subscriber's overflow is dropped, which
/// mirrors real relay lossiness.
#[derive(Default)]
pub struct MemoryRelay {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl RelayChannel for MemoryRelay {
    async fn publish(&self, event: Event) -> Result<(), RelayError> {
        let recipient = match event.recipient() {
            Some(r) => r.to_string(),
            None => {
                debug!("dropping unaddressed event {}", event.id);
                return Ok(());
            }
        };

        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|s| !s.tx.is_closed());
        for sub in subscribers.iter() {
            if sub.recipient == recipient {
                // try_send: a full queue means a lossy drop, not an error
                let _ = sub.tx.try_send(event.clone());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, recipient: &str) -> Result<mpsc::Receiver<Event>, RelayError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscribers.write().await.push(Subscriber {
            recipient: recipient.to_string(),
            tx,
        });
        Ok(rx)
    }
}
