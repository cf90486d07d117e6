//! Test harness for NSC core functionality.
//!
//! This module provides test utilities and integration test helpers for
//! the pairing and session workflows: a shared in-memory relay, paired
//! client and signer sessions, and a driver for the connect handshake.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use nsc_crypto::Keypair;

use crate::errors::ConnectError;
use crate::relay::{MemoryRelay, RelayChannel};
use crate::session::{
    AcceptAll, ApprovalHandler, InvitePolicy, Session, SessionConfig, SessionNotification,
    SessionState, SignerSession,
};
use crate::uri::{ConnectUri, Metadata};

/// A fast config for tests: short deadlines so failures surface quickly.
pub fn test_config() -> SessionConfig {
    SessionConfig {
        call_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        notification_buffer: 16,
    }
}

/// A client/signer pair wired over one in-memory relay, not yet started.
pub struct Pairing {
    pub relay: Arc<MemoryRelay>,
    pub client: Session,
    pub client_events: mpsc::Receiver<SessionNotification>,
    pub signer: SignerSession,
    pub signer_events: mpsc::Receiver<SessionNotification>,
    pub uri: ConnectUri,
}

/// Build a pairing the way a real deployment starts: the client publishes
/// an invitation URI, the signer decodes it and claims the pairing.
pub fn make_pairing() -> Result<Pairing, ConnectError> {
    make_pairing_with(Arc::new(AcceptAll), InvitePolicy::default())
}

/// [`make_pairing`] with a custom approval handler and invite policy on
/// the signer side.
pub fn make_pairing_with(
    approval: Arc<dyn ApprovalHandler>,
    policy: InvitePolicy,
) -> Result<Pairing, ConnectError> {
    let relay = MemoryRelay::new();

    let client_keys = Keypair::generate();
    let uri = ConnectUri::new(
        &client_keys.public_key(),
        "wss://relay.example.com",
        Metadata {
            name: "harness".into(),
            ..Metadata::default()
        },
    )?;
    let (client, client_events) = Session::new(
        client_keys,
        None,
        relay.clone() as Arc<dyn RelayChannel>,
        test_config(),
    );

    // The signer decodes the invitation it was handed
    let decoded = ConnectUri::decode(&uri.encode())?;
    let target = nsc_crypto::PublicKey::from_hex(&decoded.target)
        .map_err(|_| ConnectError::MalformedUri(crate::uri::UriError::InvalidTarget))?;
    let (signer, signer_events) = SignerSession::new(
        Keypair::generate(),
        Some(target),
        relay.clone() as Arc<dyn RelayChannel>,
        approval,
        policy,
        test_config(),
    );

    Ok(Pairing {
        relay,
        client,
        client_events,
        signer,
        signer_events,
        uri,
    })
}

/// Run the connect handshake to completion on both sides.
///
/// Starts the client first (it must be listening before the signer's
/// claim arrives), then the signer, then waits for both `Connected`
/// notifications.
pub async fn run_connect_flow(pairing: &mut Pairing) -> Result<(), ConnectError> {
    pairing.client.init().await?;
    pairing.signer.init().await?;

    await_connected(&mut pairing.client_events).await?;
    await_connected(&mut pairing.signer_events).await?;

    assert_eq!(pairing.client.state().await, SessionState::Connected);
    assert_eq!(pairing.signer.state().await, SessionState::Connected);
    Ok(())
}

/// Wait for the next `Connected` notification on a channel.
pub async fn await_connected(
    events: &mut mpsc::Receiver<SessionNotification>,
) -> Result<String, ConnectError> {
    let deadline = Duration::from_secs(2);
    match tokio::time::timeout(deadline, events.recv()).await {
        Ok(Some(SessionNotification::Connected { peer })) => Ok(peer),
        Ok(other) => Err(ConnectError::InvalidState(format!(
            "expected Connected notification, got {other:?}"
        ))),
        Err(_) => Err(ConnectError::RpcTimeout(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_flow() {
        let mut pairing = make_pairing().expect("harness setup");
        run_connect_flow(&mut pairing)
            .await
            .expect("connect flow should succeed");

        // Both sides agree on who they are talking to
        assert_eq!(
            pairing.client.peer().await,
            Some(pairing.signer.public_key())
        );
        assert_eq!(
            pairing.signer.peer().await,
            Some(pairing.client.public_key())
        );
    }
}
