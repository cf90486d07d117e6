//! Session state machines for NSC.
//!
//! This module implements the pairing session workflow for both sides of a
//! pairing: the client (holds no signing authority, issues RPC calls) and
//! the signer (exclusively holds the key, answers them).
//!
//! Lifecycle is an explicit finite-state machine with one authoritative
//! state field: `Idle -> AwaitingPeer -> Connected -> Disconnected`, with
//! `Disconnected` terminal. Transitions fire notifications over a message
//! channel handed out at construction. Each session owns its relay
//! subscription and its own pending-call table, so multiple sessions run
//! independently over one shared relay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

use nsc_crypto::{sha256, Keypair, PublicKey};

use crate::delegation::{sign_delegation, Conditions, DelegationGrant};
use crate::errors::ConnectError;
use crate::event::{now_unix, Event, UnsignedEvent};
use crate::relay::RelayChannel;
use crate::rpc::{Inbound, KeyCell, Request, RpcClient};
use crate::store::KeyStore;
use crate::uri::{ConnectUri, Metadata};

// ============================================================================
// Shared Types
// ============================================================================

/// State of a session's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, not yet started.
    Idle,
    /// Subscribed to the relay, handshake in flight or awaited.
    AwaitingPeer,
    /// Handshake acknowledged; application RPC calls accepted.
    Connected,
    /// Terminal. Re-pairing requires a new invitation and a new session.
    Disconnected,
}

/// Lifecycle notifications emitted by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotification {
    /// The handshake completed; carries the now-known peer identity.
    Connected { peer: String },
    /// The session ended, by either side.
    Disconnected,
}

/// Tunables for session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Per-call deadline for application RPC calls.
    pub call_timeout: Duration,
    /// Deadline for the initial connect handshake.
    pub handshake_timeout: Duration,
    /// Buffer size of the notification channel.
    pub notification_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(120),
            notification_buffer: 16,
        }
    }
}

/// Invitation acceptance policy for the inviting side.
///
/// The pairing URI itself carries no expiry; whether an invitation is
/// still honored is decided here when a pairing claim arrives.
#[derive(Debug, Clone, Default)]
pub struct InvitePolicy {
    /// Window during which the invitation is honored, measured from
    /// session construction. `None` means no expiry.
    pub valid_for: Option<Duration>,
    /// Whether the invitation is consumed by the first successful pairing.
    pub single_use: bool,
}

/// Trait for gating signer-side operations on user approval.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    /// Decide whether to serve `method` for `peer`.
    async fn approve(&self, peer: &PublicKey, method: &str, params: &[Value]) -> bool;
}

/// Approves everything. Useful for tests and unattended signers.
pub struct AcceptAll;

#[async_trait]
impl ApprovalHandler for AcceptAll {
    async fn approve(&self, _peer: &PublicKey, _method: &str, _params: &[Value]) -> bool {
        true
    }
}

// ============================================================================
// Client Session
// ============================================================================

struct SessionInner {
    keys: KeyCell,
    local_pub: PublicKey,
    rpc: RpcClient,
    relay: Arc<dyn RelayChannel>,
    store: Option<Arc<dyn KeyStore>>,
    config: SessionConfig,
    state: RwLock<SessionState>,
    peer: RwLock<Option<PublicKey>>,
    notify_tx: mpsc::Sender<SessionNotification>,
    closed: watch::Sender<bool>,
}

/// Client-side session: issues signing operations to a remote signer.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session from a local keypair and an optional known target.
    ///
    /// Returns the session and the receiver for lifecycle notifications.
    pub fn new(
        keypair: Keypair,
        target: Option<PublicKey>,
        relay: Arc<dyn RelayChannel>,
        config: SessionConfig,
    ) -> (Self, mpsc::Receiver<SessionNotification>) {
        Self::with_store(keypair, target, relay, None, config)
    }

    /// Create a session backed by a key store for peer persistence.
    pub fn with_store(
        keypair: Keypair,
        target: Option<PublicKey>,
        relay: Arc<dyn RelayChannel>,
        store: Option<Arc<dyn KeyStore>>,
        config: SessionConfig,
    ) -> (Self, mpsc::Receiver<SessionNotification>) {
        let (notify_tx, notify_rx) = mpsc::channel(config.notification_buffer);
        let (closed, _) = watch::channel(false);
        let keys = KeyCell::new(keypair.clone());
        let local_pub = keypair.public_key();
        let rpc = RpcClient::new(keys.clone(), relay.clone());
        let inner = Arc::new(SessionInner {
            keys,
            local_pub,
            rpc,
            relay,
            store,
            config,
            state: RwLock::new(SessionState::Idle),
            peer: RwLock::new(target),
            notify_tx,
            closed,
        });
        (Self { inner }, notify_rx)
    }

    /// Restore a session from a key store: reuses the persisted secret and
    /// last-known peer, generating and saving a fresh key when absent.
    pub async fn restore(
        store: Arc<dyn KeyStore>,
        relay: Arc<dyn RelayChannel>,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<SessionNotification>), ConnectError> {
        let keypair = match store.load_secret().await? {
            Some(hex) => Keypair::from_secret_hex(&hex)
                .map_err(|e| ConnectError::Store(e.to_string()))?,
            None => {
                let fresh = Keypair::generate();
                store.save_secret(&fresh.secret_hex()).await?;
                fresh
            }
        };
        let target = match store.load_peer().await? {
            Some(hex) => Some(
                PublicKey::from_hex(&hex).map_err(|e| ConnectError::Store(e.to_string()))?,
            ),
            None => None,
        };
        Ok(Self::with_store(keypair, target, relay, Some(store), config))
    }

    /// The local identity's public key.
    pub fn public_key(&self) -> PublicKey {
        self.inner.local_pub
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> SessionState {
        *self.inner.state.read().await
    }

    /// The peer identity, once known.
    pub async fn peer(&self) -> Option<PublicKey> {
        *self.inner.peer.read().await
    }

    /// Start the session: subscribe to the relay and begin the handshake.
    ///
    /// Idempotent: calling `init` on an already started session is a no-op
    /// returning the current state. Fails with `TransportUnavailable` when
    /// the relay subscription cannot be opened (the session stays `Idle`
    /// and `init` may be retried).
    pub async fn init(&self) -> Result<SessionState, ConnectError> {
        let mut state = self.inner.state.write().await;
        match *state {
            SessionState::Disconnected => return Err(ConnectError::SessionClosed),
            SessionState::AwaitingPeer | SessionState::Connected => return Ok(*state),
            SessionState::Idle => {}
        }

        let rx = self
            .inner
            .relay
            .subscribe(&self.inner.local_pub.to_hex())
            .await?;
        *state = SessionState::AwaitingPeer;
        drop(state);

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.drive(rx).await });

        // When the target is already known, claim the pairing; otherwise
        // wait for the peer's inbound claim.
        if let Some(target) = *self.inner.peer.read().await {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                let params = vec![Value::String(inner.local_pub.to_hex())];
                match inner
                    .rpc
                    .call(&target, "connect", params, inner.config.handshake_timeout)
                    .await
                {
                    Ok(_) => inner.mark_connected(target).await,
                    Err(e) => debug!(error = %e, "connect handshake did not complete"),
                }
            });
        }

        Ok(SessionState::AwaitingPeer)
    }

    async fn require_peer(&self) -> Result<PublicKey, ConnectError> {
        match *self.inner.state.read().await {
            SessionState::Connected => {}
            SessionState::Disconnected => return Err(ConnectError::SessionClosed),
            other => {
                return Err(ConnectError::InvalidState(format!(
                    "not connected (state: {other:?})"
                )))
            }
        }
        self.inner
            .peer
            .read()
            .await
            .ok_or(ConnectError::SessionClosed)
    }

    /// Ask the signer for its public key.
    pub async fn get_public_key(&self) -> Result<String, ConnectError> {
        let peer = self.require_peer().await?;
        let result = self
            .inner
            .rpc
            .call(&peer, "get_public_key", vec![], self.inner.config.call_timeout)
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ConnectError::Serialization("expected string result".into()))
    }

    /// Ask the signer to sign an event.
    ///
    /// The returned event carries the signer-computed identifier and
    /// signature; both are verified locally before being handed back.
    pub async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event, ConnectError> {
        let peer = self.require_peer().await?;
        let params = vec![serde_json::to_value(&unsigned)?];
        let result = self
            .inner
            .rpc
            .call(&peer, "sign_event", params, self.inner.config.call_timeout)
            .await?;
        let event: Event = serde_json::from_value(result)?;
        if !event.verify() {
            return Err(ConnectError::SignatureInvalid);
        }
        Ok(event)
    }

    /// Ask the signer for a raw Schnorr signature over `message`'s hash.
    pub async fn sign_schnorr(&self, message: &str) -> Result<String, ConnectError> {
        let peer = self.require_peer().await?;
        let params = vec![Value::String(message.to_string())];
        let result = self
            .inner
            .rpc
            .call(&peer, "sign_schnorr", params, self.inner.config.call_timeout)
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ConnectError::Serialization("expected string result".into()))
    }

    /// Ask the signer for a delegation grant for `delegatee` under
    /// `conditions`. The grant is verified before being returned.
    pub async fn delegate(
        &self,
        delegatee: &PublicKey,
        conditions: Conditions,
    ) -> Result<DelegationGrant, ConnectError> {
        let peer = self.require_peer().await?;
        let params = vec![
            Value::String(delegatee.to_hex()),
            serde_json::to_value(&conditions)?,
        ];
        let result = self
            .inner
            .rpc
            .call(&peer, "delegate", params, self.inner.config.call_timeout)
            .await?;
        let sig = result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ConnectError::Serialization("expected string result".into()))?;
        let grant = DelegationGrant {
            delegator: peer.to_hex(),
            delegatee: delegatee.to_hex(),
            conditions,
            sig,
        };
        if !grant.verify() {
            return Err(ConnectError::SignatureInvalid);
        }
        Ok(grant)
    }

    /// End the session: notify the peer, fail all pending calls, clear
    /// local key material, and move to `Disconnected`.
    pub async fn disconnect(&self) -> Result<(), ConnectError> {
        {
            let mut state = self.inner.state.write().await;
            if *state == SessionState::Disconnected {
                return Ok(());
            }
            *state = SessionState::Disconnected;
        }
        if let Some(peer) = *self.inner.peer.read().await {
            // Best effort; the peer may already be gone
            let _ = self.inner.rpc.notify(&peer, "disconnect", vec![]).await;
        }
        self.inner.teardown().await;
        Ok(())
    }
}

impl SessionInner {
    async fn drive(self: Arc<Self>, mut rx: mpsc::Receiver<Event>) {
        let mut closed = self.closed.subscribe();
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(event) => {
                        if let Inbound::Request { request, sender } =
                            self.rpc.handle_event(&event).await
                        {
                            self.handle_request(request, sender).await;
                        }
                    }
                    None => break,
                },
                _ = closed.changed() => break,
            }
        }
    }

    async fn handle_request(&self, request: Request, sender: PublicKey) {
        match request.method.as_str() {
            "connect" => self.handle_connect(request, sender).await,
            "disconnect" => {
                let peer = *self.peer.read().await;
                if peer == Some(sender) {
                    info!(peer = %sender, "peer disconnected");
                    self.peer_disconnect().await;
                }
            }
            other => {
                // The client holds no key; nothing else is served here
                debug!(method = other, peer = %sender, "ignoring unsupported request");
            }
        }
    }

    async fn handle_connect(&self, request: Request, sender: PublicKey) {
        match *self.state.read().await {
            SessionState::AwaitingPeer => {}
            SessionState::Connected => {
                // Duplicate claim from the connected peer: re-acknowledge
                if *self.peer.read().await == Some(sender) {
                    let _ = self.rpc.respond(&sender, &request.id, ack()).await;
                }
                return;
            }
            _ => return, // late or foreign claim, ignored
        }
        // A session pointed at a known target only pairs with that target
        if let Some(expected) = *self.peer.read().await {
            if expected != sender {
                debug!(peer = %sender, "ignoring pairing claim from unexpected sender");
                return;
            }
        }
        if let Err(e) = self.rpc.respond(&sender, &request.id, ack()).await {
            warn!(error = %e, "failed to acknowledge pairing claim");
            return;
        }
        self.mark_connected(sender).await;
    }

    /// Transition `AwaitingPeer -> Connected`, exactly once.
    async fn mark_connected(&self, peer: PublicKey) {
        {
            let mut state = self.state.write().await;
            if *state != SessionState::AwaitingPeer {
                return;
            }
            *state = SessionState::Connected;
        }
        *self.peer.write().await = Some(peer);
        if let Some(store) = &self.store {
            let _ = store.save_peer(Some(&peer.to_hex())).await;
        }
        info!(peer = %peer, "session connected");
        let _ = self
            .notify_tx
            .try_send(SessionNotification::Connected { peer: peer.to_hex() });
    }

    async fn peer_disconnect(&self) {
        {
            let mut state = self.state.write().await;
            if *state == SessionState::Disconnected {
                return;
            }
            *state = SessionState::Disconnected;
        }
        self.teardown().await;
    }

    /// Common teardown: fail pending calls, clear peer and key material,
    /// notify, stop the reader.
    async fn teardown(&self) {
        self.rpc.fail_all();
        *self.peer.write().await = None;
        if let Some(store) = &self.store {
            let _ = store.save_peer(None).await;
        }
        self.keys.clear();
        let _ = self.notify_tx.try_send(SessionNotification::Disconnected);
        let _ = self.closed.send(true);
    }
}

fn ack() -> Value {
    Value::String("ack".to_string())
}

// ============================================================================
// Signer Session
// ============================================================================

struct SignerInner {
    keys: KeyCell,
    local_pub: PublicKey,
    rpc: RpcClient,
    relay: Arc<dyn RelayChannel>,
    approval: Arc<dyn ApprovalHandler>,
    policy: InvitePolicy,
    issued_at: u64,
    paired_once: AtomicBool,
    config: SessionConfig,
    state: RwLock<SessionState>,
    peer: RwLock<Option<PublicKey>>,
    notify_tx: mpsc::Sender<SessionNotification>,
    closed: watch::Sender<bool>,
}

/// Signer-side session: exclusively holds the key and answers signing
/// operations from its paired client.
pub struct SignerSession {
    inner: Arc<SignerInner>,
}

impl SignerSession {
    /// Create a signer session. `target` is the counterpart identity when
    /// already known (e.g. decoded from a scanned invitation).
    pub fn new(
        keypair: Keypair,
        target: Option<PublicKey>,
        relay: Arc<dyn RelayChannel>,
        approval: Arc<dyn ApprovalHandler>,
        policy: InvitePolicy,
        config: SessionConfig,
    ) -> (Self, mpsc::Receiver<SessionNotification>) {
        let (notify_tx, notify_rx) = mpsc::channel(config.notification_buffer);
        let (closed, _) = watch::channel(false);
        let keys = KeyCell::new(keypair.clone());
        let local_pub = keypair.public_key();
        let rpc = RpcClient::new(keys.clone(), relay.clone());
        let inner = Arc::new(SignerInner {
            keys,
            local_pub,
            rpc,
            relay,
            approval,
            policy,
            issued_at: now_unix(),
            paired_once: AtomicBool::new(false),
            config,
            state: RwLock::new(SessionState::Idle),
            peer: RwLock::new(target),
            notify_tx,
            closed,
        });
        (Self { inner }, notify_rx)
    }

    /// Create a signer session pointed at a decoded pairing invitation.
    pub fn from_uri(
        keypair: Keypair,
        uri: &ConnectUri,
        relay: Arc<dyn RelayChannel>,
        approval: Arc<dyn ApprovalHandler>,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<SessionNotification>), ConnectError> {
        let target = PublicKey::from_hex(&uri.target)
            .map_err(|_| ConnectError::MalformedUri(crate::uri::UriError::InvalidTarget))?;
        Ok(Self::new(
            keypair,
            Some(target),
            relay,
            approval,
            InvitePolicy::default(),
            config,
        ))
    }

    /// Build a pairing invitation targeting this signer.
    pub fn invitation(&self, relay_url: &str, metadata: Metadata) -> Result<ConnectUri, ConnectError> {
        Ok(ConnectUri::new(&self.inner.local_pub, relay_url, metadata)?)
    }

    /// The signer identity's public key.
    pub fn public_key(&self) -> PublicKey {
        self.inner.local_pub
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> SessionState {
        *self.inner.state.read().await
    }

    /// The paired peer identity, once known.
    pub async fn peer(&self) -> Option<PublicKey> {
        *self.inner.peer.read().await
    }

    /// Start the session. Idempotent, like [`Session::init`].
    pub async fn init(&self) -> Result<SessionState, ConnectError> {
        let mut state = self.inner.state.write().await;
        match *state {
            SessionState::Disconnected => return Err(ConnectError::SessionClosed),
            SessionState::AwaitingPeer | SessionState::Connected => return Ok(*state),
            SessionState::Idle => {}
        }

        let rx = self
            .inner
            .relay
            .subscribe(&self.inner.local_pub.to_hex())
            .await?;
        *state = SessionState::AwaitingPeer;
        drop(state);

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.drive(rx).await });

        if let Some(target) = *self.inner.peer.read().await {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                let params = vec![Value::String(inner.local_pub.to_hex())];
                match inner
                    .rpc
                    .call(&target, "connect", params, inner.config.handshake_timeout)
                    .await
                {
                    Ok(_) => inner.mark_connected(target).await,
                    Err(e) => debug!(error = %e, "connect handshake did not complete"),
                }
            });
        }

        Ok(SessionState::AwaitingPeer)
    }

    /// End the session from the signer side.
    pub async fn disconnect(&self) -> Result<(), ConnectError> {
        {
            let mut state = self.inner.state.write().await;
            if *state == SessionState::Disconnected {
                return Ok(());
            }
            *state = SessionState::Disconnected;
        }
        if let Some(peer) = *self.inner.peer.read().await {
            let _ = self.inner.rpc.notify(&peer, "disconnect", vec![]).await;
        }
        self.inner.teardown().await;
        Ok(())
    }
}

impl SignerInner {
    async fn drive(self: Arc<Self>, mut rx: mpsc::Receiver<Event>) {
        let mut closed = self.closed.subscribe();
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(event) => {
                        if let Inbound::Request { request, sender } =
                            self.rpc.handle_event(&event).await
                        {
                            self.handle_request(request, sender).await;
                        }
                    }
                    None => break,
                },
                _ = closed.changed() => break,
            }
        }
    }

    async fn handle_request(&self, request: Request, sender: PublicKey) {
        match request.method.as_str() {
            "connect" => self.handle_connect(request, sender).await,
            "disconnect" => {
                let peer = *self.peer.read().await;
                if peer == Some(sender) {
                    info!(peer = %sender, "peer disconnected");
                    self.peer_disconnect().await;
                }
            }
            _ => self.handle_operation(request, sender).await,
        }
    }

    async fn handle_connect(&self, request: Request, sender: PublicKey) {
        match *self.state.read().await {
            SessionState::AwaitingPeer => {}
            SessionState::Connected => {
                if *self.peer.read().await == Some(sender) {
                    let _ = self.rpc.respond(&sender, &request.id, ack()).await;
                }
                return;
            }
            _ => return,
        }
        // A signer pointed at a known target only pairs with that target
        if let Some(expected) = *self.peer.read().await {
            if expected != sender {
                debug!(peer = %sender, "ignoring pairing claim from unexpected sender");
                return;
            }
        }

        // Invitation policy: the URI itself never expires, acceptance does
        if let Some(valid_for) = self.policy.valid_for {
            if now_unix() >= self.issued_at.saturating_add(valid_for.as_secs()) {
                debug!(peer = %sender, "rejecting pairing claim: invitation expired");
                let _ = self
                    .rpc
                    .respond_error(&sender, &request.id, "invitation expired")
                    .await;
                return;
            }
        }
        if self.policy.single_use && self.paired_once.load(Ordering::Relaxed) {
            debug!(peer = %sender, "rejecting pairing claim: invitation already used");
            let _ = self
                .rpc
                .respond_error(&sender, &request.id, "invitation already used")
                .await;
            return;
        }
        if !self.approval.approve(&sender, "connect", &request.params).await {
            let _ = self
                .rpc
                .respond_error(&sender, &request.id, "pairing rejected")
                .await;
            return;
        }

        if let Err(e) = self.rpc.respond(&sender, &request.id, ack()).await {
            warn!(error = %e, "failed to acknowledge pairing claim");
            return;
        }
        self.paired_once.store(true, Ordering::Relaxed);
        self.mark_connected(sender).await;
    }

    /// Serve an application-level operation against the held key.
    async fn handle_operation(&self, request: Request, sender: PublicKey) {
        let connected =
            *self.state.read().await == SessionState::Connected
                && *self.peer.read().await == Some(sender);
        if !connected {
            let _ = self
                .rpc
                .respond_error(&sender, &request.id, "not connected")
                .await;
            return;
        }
        if !self
            .approval
            .approve(&sender, &request.method, &request.params)
            .await
        {
            let _ = self
                .rpc
                .respond_error(&sender, &request.id, "rejected")
                .await;
            return;
        }
        let keypair = match self.keys.get() {
            Some(k) => k,
            None => return,
        };

        let outcome = self.execute(&keypair, &request);
        match outcome {
            Ok(result) => {
                let _ = self.rpc.respond(&sender, &request.id, result).await;
            }
            Err(message) => {
                debug!(method = %request.method, error = %message, "operation failed");
                let _ = self.rpc.respond_error(&sender, &request.id, &message).await;
            }
        }
    }

    fn execute(&self, keypair: &Keypair, request: &Request) -> Result<Value, String> {
        match request.method.as_str() {
            "get_public_key" => Ok(Value::String(self.local_pub.to_hex())),
            "sign_event" => {
                let param = request.params.first().ok_or("missing event parameter")?;
                let unsigned: UnsignedEvent = serde_json::from_value(param.clone())
                    .map_err(|_| "malformed event parameter".to_string())?;
                // Recompute the identifier; the claimed one is untrusted
                let signed = unsigned.sign(keypair).map_err(|e| e.to_string())?;
                serde_json::to_value(&signed).map_err(|e| e.to_string())
            }
            "sign_schnorr" => {
                let message = request
                    .params
                    .first()
                    .and_then(Value::as_str)
                    .ok_or("missing message parameter")?;
                let digest = sha256(message.as_bytes());
                let sig = keypair
                    .sign_digest(&digest)
                    .map_err(|e| e.to_string())?;
                Ok(Value::String(hex::encode(sig)))
            }
            "delegate" => {
                let delegatee = request
                    .params
                    .first()
                    .and_then(Value::as_str)
                    .ok_or("missing delegatee parameter")?;
                PublicKey::from_hex(delegatee).map_err(|_| "invalid delegatee".to_string())?;
                let conditions: Conditions = request
                    .params
                    .get(1)
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|_| "malformed conditions".to_string())?
                    .unwrap_or_default();
                let sig = sign_delegation(keypair, delegatee, &conditions)
                    .map_err(|e| e.to_string())?;
                Ok(Value::String(sig))
            }
            other => Err(format!("unsupported method: {other}")),
        }
    }

    async fn mark_connected(&self, peer: PublicKey) {
        {
            let mut state = self.state.write().await;
            if *state != SessionState::AwaitingPeer {
                return;
            }
            *state = SessionState::Connected;
        }
        *self.peer.write().await = Some(peer);
        info!(peer = %peer, "signer session connected");
        let _ = self
            .notify_tx
            .try_send(SessionNotification::Connected { peer: peer.to_hex() });
    }

    async fn peer_disconnect(&self) {
        {
            let mut state = self.state.write().await;
            if *state == SessionState::Disconnected {
                return;
            }
            *state = SessionState::Disconnected;
        }
        self.teardown().await;
    }

    async fn teardown(&self) {
        self.rpc.fail_all();
        *self.peer.write().await = None;
        self.keys.clear();
        let _ = self.notify_tx.try_send(SessionNotification::Disconnected);
        let _ = self.closed.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MemoryRelay;

    fn client_session(relay: &Arc<MemoryRelay>) -> (Session, mpsc::Receiver<SessionNotification>) {
        Session::new(
            Keypair::generate(),
            None,
            relay.clone() as Arc<dyn RelayChannel>,
            SessionConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let relay = MemoryRelay::new();
        let (session, _rx) = client_session(&relay);

        assert_eq!(session.state().await, SessionState::Idle);
        assert_eq!(session.init().await.unwrap(), SessionState::AwaitingPeer);
        // Second call is a no-op returning the current state
        assert_eq!(session.init().await.unwrap(), SessionState::AwaitingPeer);
        assert_eq!(session.state().await, SessionState::AwaitingPeer);
    }

    #[tokio::test]
    async fn test_operations_fail_before_connect() {
        let relay = MemoryRelay::new();
        let (session, _rx) = client_session(&relay);

        let err = session.get_public_key().await.unwrap_err();
        assert!(matches!(err, ConnectError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_operations_fail_after_disconnect() {
        let relay = MemoryRelay::new();
        let (session, mut rx) = client_session(&relay);
        session.init().await.unwrap();
        session.disconnect().await.unwrap();

        assert_eq!(session.state().await, SessionState::Disconnected);
        assert_eq!(rx.recv().await, Some(SessionNotification::Disconnected));

        let err = session.sign_schnorr("hello").await.unwrap_err();
        assert!(matches!(err, ConnectError::SessionClosed));
        // init after disconnect also fails: sessions are single-shot
        assert!(matches!(
            session.init().await.unwrap_err(),
            ConnectError::SessionClosed
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let relay = MemoryRelay::new();
        let (session, _rx) = client_session(&relay);
        session.init().await.unwrap();
        session.disconnect().await.unwrap();
        session.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_claim_ignored_when_target_known() {
        let relay = MemoryRelay::new();
        let target = Keypair::generate();
        let (session, mut rx) = Session::new(
            Keypair::generate(),
            Some(target.public_key()),
            relay.clone() as Arc<dyn RelayChannel>,
            SessionConfig::default(),
        );
        session.init().await.unwrap();

        // A bystander claims the pairing; the session must not adopt it
        let hijacker = Keypair::generate();
        let hijacker_rpc = RpcClient::new(
            KeyCell::new(hijacker.clone()),
            relay as Arc<dyn RelayChannel>,
        );
        hijacker_rpc
            .notify(&session.public_key(), "connect", vec![])
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.state().await, SessionState::AwaitingPeer);
        assert_eq!(session.peer().await, Some(target.public_key()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forged_ack_does_not_connect() {
        let relay = MemoryRelay::new();
        let target = Keypair::generate(); // never comes online
        let (session, mut rx) = Session::new(
            Keypair::generate(),
            Some(target.public_key()),
            relay.clone() as Arc<dyn RelayChannel>,
            SessionConfig::default(),
        );
        session.init().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The handshake's first correlation id is predictable; a stranger
        // answers it with an ack of its own making
        let stranger = Keypair::generate();
        let stranger_rpc = RpcClient::new(
            KeyCell::new(stranger.clone()),
            relay as Arc<dyn RelayChannel>,
        );
        stranger_rpc
            .respond(&session.public_key(), "1", Value::String("ack".into()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.state().await, SessionState::AwaitingPeer);
        assert_eq!(session.peer().await, Some(target.public_key()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_signer_ignores_claim_from_unexpected_sender() {
        let relay = MemoryRelay::new();
        let target = Keypair::generate();
        let (signer, mut rx) = SignerSession::new(
            Keypair::generate(),
            Some(target.public_key()),
            relay.clone() as Arc<dyn RelayChannel>,
            Arc::new(AcceptAll),
            InvitePolicy::default(),
            SessionConfig::default(),
        );
        signer.init().await.unwrap();

        let hijacker = Keypair::generate();
        let hijacker_rpc = RpcClient::new(
            KeyCell::new(hijacker.clone()),
            relay as Arc<dyn RelayChannel>,
        );
        hijacker_rpc
            .notify(&signer.public_key(), "connect", vec![])
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(signer.state().await, SessionState::AwaitingPeer);
        assert_eq!(signer.peer().await, Some(target.public_key()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_restore_generates_and_persists_key() {
        use crate::store::{KeyStore, MemoryStore};

        let relay = MemoryRelay::new();
        let store = Arc::new(MemoryStore::new());
        let (session, _rx) = Session::restore(
            store.clone(),
            relay.clone() as Arc<dyn RelayChannel>,
            SessionConfig::default(),
        )
        .await
        .unwrap();

        let persisted = store.load_secret().await.unwrap().unwrap();
        let restored = Keypair::from_secret_hex(&persisted).unwrap();
        assert_eq!(restored.public_key(), session.public_key());
    }
}
