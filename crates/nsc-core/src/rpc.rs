//! RPC layer: request framing, correlation, and sealed transport.
//!
//! Each call allocates a fresh correlation identifier (monotone per
//! session), seals its frame end-to-end for the target identity, publishes
//! it as an addressed relay event, and suspends until the matching
//! response arrives or the deadline elapses.
//!
//! Inbound traffic is hostile by default: events that fail signature
//! verification, payloads that fail decryption, malformed frames, and
//! responses with unknown correlation identifiers are all dropped silently.
//! The relay stream carries traffic for other pairings too, so none of
//! these are protocol errors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use nsc_crypto::{conversation_key, payload, Keypair, PublicKey};

use crate::errors::ConnectError;
use crate::event::{Event, UnsignedEvent, CONNECT_KIND};
use crate::relay::RelayChannel;

// ============================================================================
// Frames
// ============================================================================

/// An RPC request frame, carried sealed inside a relay event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    /// Correlation identifier, unique per outstanding call within a session.
    pub id: String,
    /// Method name.
    pub method: String,
    /// Ordered parameter list.
    #[serde(default)]
    pub params: Vec<Value>,
}

/// An RPC response frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    /// Correlation identifier of the request being answered.
    pub id: String,
    /// Result value; `null` when the call failed.
    #[serde(default)]
    pub result: Value,
    /// Error message, if the peer rejected or failed the call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of feeding one inbound relay event through the RPC layer.
#[derive(Debug)]
pub enum Inbound {
    /// A decrypted request from `sender`, for the session layer to route.
    Request { request: Request, sender: PublicKey },
    /// A response that completed a pending call.
    Handled,
    /// Foreign, malformed, duplicated, or unverifiable traffic. Ignored.
    Dropped,
}

// ============================================================================
// Key Cell
// ============================================================================

/// Shared handle to a session's local key material.
///
/// The RPC layer and the session both hold the cell; disconnect clears it,
/// after which sealing and opening fail closed.
#[derive(Clone, Default)]
pub struct KeyCell {
    inner: Arc<RwLock<Option<Keypair>>>,
}

impl KeyCell {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(keypair))),
        }
    }

    /// Clone out the keypair, if not yet cleared.
    pub fn get(&self) -> Option<Keypair> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The local public key, if key material is still held.
    pub fn public_key(&self) -> Option<PublicKey> {
        self.get().map(|k| k.public_key())
    }

    /// Drop the key material. Zeroized on drop by the keypair itself.
    pub fn clear(&self) {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).take();
    }
}

// ============================================================================
// RPC Client
// ============================================================================

/// A registered call awaiting its response. Correlation ids are predictable,
/// so the response must also come from the identity the call was sent to.
struct PendingCall {
    target: PublicKey,
    tx: oneshot::Sender<Response>,
}

/// Correlates outstanding calls with inbound responses for one session.
pub struct RpcClient {
    keys: KeyCell,
    relay: Arc<dyn RelayChannel>,
    /// Pending calls by correlation identifier. Guarded by a plain mutex so
    /// cancellation (future drop) can release an identifier synchronously.
    pending: Mutex<HashMap<String, PendingCall>>,
    /// Monotone correlation id source; never reused within a session.
    next_id: AtomicU64,
}

/// Releases a correlation identifier when a call resolves or is abandoned.
struct PendingGuard<'a> {
    rpc: &'a RpcClient,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.rpc.lock_pending().remove(self.id);
    }
}

impl RpcClient {
    pub fn new(keys: KeyCell, relay: Arc<dyn RelayChannel>) -> Self {
        Self {
            keys,
            relay,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, PendingCall>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.lock_pending().len()
    }

    fn next_correlation_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Seal `frame` for `target` and publish it as an addressed event.
    async fn publish_frame(&self, target: &PublicKey, frame: &[u8]) -> Result<(), ConnectError> {
        let keypair = self.keys.get().ok_or(ConnectError::SessionClosed)?;
        let key = conversation_key(&keypair, target)
            .map_err(|e| ConnectError::Serialization(e.to_string()))?;
        let sealed = payload::seal(&key, frame)
            .map_err(|e| ConnectError::Serialization(e.to_string()))?;
        let event =
            UnsignedEvent::addressed(&keypair.public_key(), target, CONNECT_KIND, sealed)
                .sign(&keypair)?;
        self.relay.publish(event).await?;
        Ok(())
    }

    /// Issue a call and suspend until the response arrives or `timeout`
    /// elapses.
    ///
    /// The correlation identifier is retired when the call resolves —
    /// success, peer error, timeout, or caller abandonment — and any late
    /// response for it is then suppressed.
    pub async fn call(
        &self,
        target: &PublicKey,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, ConnectError> {
        let id = self.next_correlation_id();
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(
            id.clone(),
            PendingCall {
                target: *target,
                tx,
            },
        );
        let _guard = PendingGuard { rpc: self, id: &id };

        let request = Request {
            id: id.clone(),
            method: method.to_string(),
            params,
        };
        let frame = serde_json::to_vec(&request)?;
        self.publish_frame(target, &frame).await?;
        debug!(method, correlation = %id, "rpc request published");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => match response.error {
                Some(message) => Err(ConnectError::Peer(message)),
                None => Ok(response.result),
            },
            // Sender dropped without a response: the session was torn down
            Ok(Err(_)) => Err(ConnectError::SessionClosed),
            Err(_) => {
                warn!(method, correlation = %id, "rpc call timed out");
                Err(ConnectError::RpcTimeout(timeout))
            }
        }
    }

    /// Publish a request without awaiting any response (e.g. a disconnect
    /// notice).
    pub async fn notify(
        &self,
        target: &PublicKey,
        method: &str,
        params: Vec<Value>,
    ) -> Result<(), ConnectError> {
        let request = Request {
            id: self.next_correlation_id(),
            method: method.to_string(),
            params,
        };
        let frame = serde_json::to_vec(&request)?;
        self.publish_frame(target, &frame).await
    }

    /// Answer a peer request.
    pub async fn respond(
        &self,
        target: &PublicKey,
        id: &str,
        result: Value,
    ) -> Result<(), ConnectError> {
        let response = Response {
            id: id.to_string(),
            result,
            error: None,
        };
        let frame = serde_json::to_vec(&response)?;
        self.publish_frame(target, &frame).await
    }

    /// Answer a peer request with an error.
    pub async fn respond_error(
        &self,
        target: &PublicKey,
        id: &str,
        message: &str,
    ) -> Result<(), ConnectError> {
        let response = Response {
            id: id.to_string(),
            result: Value::Null,
            error: Some(message.to_string()),
        };
        let frame = serde_json::to_vec(&response)?;
        self.publish_frame(target, &frame).await
    }

    /// Feed one inbound relay event through verification, decryption, and
    /// correlation.
    ///
    /// A response completes its pending call only when authored by the
    /// identity the call targeted, and at most once; a duplicated response
    /// finds no pending entry on its second delivery and is dropped.
    /// Requests are returned to the caller for routing.
    pub async fn handle_event(&self, event: &Event) -> Inbound {
        if !event.verify() {
            warn!(id = %event.id, "dropping event with invalid signature");
            return Inbound::Dropped;
        }
        let keypair = match self.keys.get() {
            Some(k) => k,
            None => return Inbound::Dropped,
        };
        let sender = match event.author() {
            Ok(pk) => pk,
            Err(_) => return Inbound::Dropped,
        };
        let key = match conversation_key(&keypair, &sender) {
            Ok(k) => k,
            Err(_) => return Inbound::Dropped,
        };
        let plaintext = match payload::open(&key, &event.content) {
            Ok(p) => p,
            Err(_) => {
                debug!(id = %event.id, "dropping undecryptable payload");
                return Inbound::Dropped;
            }
        };
        let value: Value = match serde_json::from_slice(&plaintext) {
            Ok(v) => v,
            Err(_) => {
                debug!(id = %event.id, "dropping malformed frame");
                return Inbound::Dropped;
            }
        };

        if value.get("method").is_some() {
            match serde_json::from_value::<Request>(value) {
                Ok(request) => Inbound::Request { request, sender },
                Err(_) => Inbound::Dropped,
            }
        } else {
            let response = match serde_json::from_value::<Response>(value) {
                Ok(r) => r,
                Err(_) => return Inbound::Dropped,
            };
            let call = {
                let mut pending = self.lock_pending();
                match pending.get(&response.id) {
                    // Only the identity the call was sent to may answer it;
                    // the entry stays registered for the genuine response
                    Some(call) if call.target != sender => {
                        warn!(
                            correlation = %response.id,
                            sender = %sender,
                            "dropping response from unexpected sender"
                        );
                        return Inbound::Dropped;
                    }
                    Some(_) => pending.remove(&response.id),
                    None => None,
                }
            };
            match call {
                Some(call) => {
                    // Receiver may have timed out concurrently; ignore
                    let _ = call.tx.send(response);
                    Inbound::Handled
                }
                None => {
                    debug!(correlation = %response.id, "dropping unmatched response");
                    Inbound::Dropped
                }
            }
        }
    }

    /// Fail every pending call. Used on disconnect so callers never hang.
    pub fn fail_all(&self) {
        let drained: Vec<_> = self.lock_pending().drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing pending calls");
        }
        // Dropping the senders resolves each receiver with SessionClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MemoryRelay;

    fn client(keypair: &Keypair, relay: &Arc<MemoryRelay>) -> RpcClient {
        RpcClient::new(
            KeyCell::new(keypair.clone()),
            relay.clone() as Arc<dyn RelayChannel>,
        )
    }

    /// Answer every request to `responder` by echoing its params back.
    async fn spawn_echo_responder(relay: Arc<MemoryRelay>, responder: Keypair) {
        let rpc = client(&responder, &relay);
        let mut rx = relay
            .subscribe(&responder.public_key().to_hex())
            .await
            .unwrap();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Inbound::Request { request, sender } = rpc.handle_event(&event).await {
                    rpc.respond(&sender, &request.id, Value::Array(request.params))
                        .await
                        .unwrap();
                }
            }
        });
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let relay = MemoryRelay::new();
        let caller = Keypair::generate();
        let responder = Keypair::generate();
        spawn_echo_responder(relay.clone(), responder.clone()).await;

        let rpc = client(&caller, &relay);
        let mut rx = relay.subscribe(&caller.public_key().to_hex()).await.unwrap();
        let rpc = Arc::new(rpc);

        let driver = {
            let rpc = rpc.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    rpc.handle_event(&event).await;
                }
            })
        };

        let result = rpc
            .call(
                &responder.public_key(),
                "echo",
                vec![Value::String("hi".into())],
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(result, Value::Array(vec![Value::String("hi".into())]));
        assert_eq!(rpc.pending_calls(), 0);
        driver.abort();
    }

    #[tokio::test]
    async fn test_call_times_out_without_responder() {
        let relay = MemoryRelay::new();
        let caller = Keypair::generate();
        let silent = Keypair::generate();

        let rpc = client(&caller, &relay);
        let err = rpc
            .call(
                &silent.public_key(),
                "get_public_key",
                vec![],
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::RpcTimeout(_)));
        assert_eq!(rpc.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_correlation_ids_are_unique() {
        let relay = MemoryRelay::new();
        let caller = Keypair::generate();
        let rpc = client(&caller, &relay);

        let a = rpc.next_correlation_id();
        let b = rpc.next_correlation_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_duplicate_response_applied_once() {
        let relay = MemoryRelay::new();
        let caller = Keypair::generate();
        let responder = Keypair::generate();

        let caller_rpc = Arc::new(client(&caller, &relay));
        let responder_rpc = client(&responder, &relay);

        let mut caller_rx = relay.subscribe(&caller.public_key().to_hex()).await.unwrap();
        let mut responder_rx = relay
            .subscribe(&responder.public_key().to_hex())
            .await
            .unwrap();

        let call = {
            let rpc = caller_rpc.clone();
            let target = responder.public_key();
            tokio::spawn(async move {
                rpc.call(&target, "ping", vec![], Duration::from_secs(5)).await
            })
        };

        // Respond to the request once, but deliver the response event twice
        let request_event = responder_rx.recv().await.unwrap();
        let request = match responder_rpc.handle_event(&request_event).await {
            Inbound::Request { request, .. } => request,
            other => panic!("expected request, got {other:?}"),
        };
        responder_rpc
            .respond(&caller.public_key(), &request.id, Value::String("pong".into()))
            .await
            .unwrap();

        let response_event = caller_rx.recv().await.unwrap();
        assert!(matches!(
            caller_rpc.handle_event(&response_event).await,
            Inbound::Handled
        ));
        // Second copy finds no pending entry
        assert!(matches!(
            caller_rpc.handle_event(&response_event).await,
            Inbound::Dropped
        ));

        assert_eq!(call.await.unwrap().unwrap(), Value::String("pong".into()));
    }

    #[tokio::test]
    async fn test_response_from_wrong_sender_dropped() {
        let relay = MemoryRelay::new();
        let caller = Keypair::generate();
        let target = Keypair::generate();
        let stranger = Keypair::generate();

        let caller_rpc = Arc::new(client(&caller, &relay));
        let stranger_rpc = client(&stranger, &relay);
        let mut caller_rx = relay.subscribe(&caller.public_key().to_hex()).await.unwrap();

        let call = {
            let rpc = caller_rpc.clone();
            let target = target.public_key();
            tokio::spawn(async move {
                rpc.call(&target, "connect", vec![], Duration::from_secs(60)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(caller_rpc.pending_calls(), 1);

        // A forged answer to the predictable first correlation id
        stranger_rpc
            .respond(&caller.public_key(), "1", Value::String("ack".into()))
            .await
            .unwrap();
        let forged = caller_rx.recv().await.unwrap();
        assert!(matches!(
            caller_rpc.handle_event(&forged).await,
            Inbound::Dropped
        ));
        // The call is still waiting for its real target
        assert_eq!(caller_rpc.pending_calls(), 1);

        call.abort();
        let _ = call.await;
    }

    #[tokio::test]
    async fn test_abandoned_call_releases_identifier() {
        let relay = MemoryRelay::new();
        let caller = Keypair::generate();
        let silent = Keypair::generate();
        let rpc = Arc::new(client(&caller, &relay));

        let call = {
            let rpc = rpc.clone();
            let target = silent.public_key();
            tokio::spawn(async move {
                rpc.call(&target, "ping", vec![], Duration::from_secs(60)).await
            })
        };
        // Let the call register and publish, then abandon it
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rpc.pending_calls(), 1);
        call.abort();
        let _ = call.await;
        assert_eq!(rpc.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_unblocks_callers() {
        let relay = MemoryRelay::new();
        let caller = Keypair::generate();
        let silent = Keypair::generate();
        let rpc = Arc::new(client(&caller, &relay));

        let call = {
            let rpc = rpc.clone();
            let target = silent.public_key();
            tokio::spawn(async move {
                rpc.call(&target, "ping", vec![], Duration::from_secs(60)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        rpc.fail_all();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectError::SessionClosed));
    }

    #[tokio::test]
    async fn test_foreign_event_dropped() {
        let relay = MemoryRelay::new();
        let caller = Keypair::generate();
        let rpc = client(&caller, &relay);

        // An event sealed for someone else entirely
        let stranger_a = Keypair::generate();
        let stranger_b = Keypair::generate();
        let key = conversation_key(&stranger_a, &stranger_b.public_key()).unwrap();
        let sealed = payload::seal(&key, b"{\"id\":\"1\",\"result\":\"x\"}").unwrap();
        let event = UnsignedEvent::addressed(
            &stranger_a.public_key(),
            &caller.public_key(),
            CONNECT_KIND,
            sealed,
        )
        .sign(&stranger_a)
        .unwrap();

        assert!(matches!(rpc.handle_event(&event).await, Inbound::Dropped));
    }

    #[tokio::test]
    async fn test_cleared_keys_fail_closed() {
        let relay = MemoryRelay::new();
        let caller = Keypair::generate();
        let target = Keypair::generate().public_key();
        let cell = KeyCell::new(caller.clone());
        let rpc = RpcClient::new(cell.clone(), relay as Arc<dyn RelayChannel>);

        cell.clear();
        let err = rpc
            .call(&target, "ping", vec![], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::SessionClosed));
    }
}
