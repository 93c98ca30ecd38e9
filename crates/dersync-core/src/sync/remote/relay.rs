//! Relay remote store over iroh
//!
//! A relay is a peer that holds the authoritative store and answers
//! requests on its own ALPN. Devices that cannot (or prefer not to) reach
//! an HTTPS service talk to the relay over QUIC instead:
//!
//! ```text
//! Device                                Relay peer
//!   |                                       |
//!   |--- RelayFrame{proof, Fetch} --------->|  verify proof
//!   |                                       |  backend.store_for(did).fetch(..)
//!   |<-- RelayResponse::Envelopes ----------|
//!   |                                       |
//!   |--- RelayFrame{proof, Push} ---------->|
//!   |<-- RelayResponse::Pushed -------------|
//! ```
//!
//! One QUIC connection is kept per client and every request gets its own
//! bi-directional stream. Bodies are the same JSON the HTTPS store uses.
//! Each frame carries a [`RequestProof`] bound to the relay's endpoint id,
//! so the relay acts for the signing identity only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use iroh::discovery::static_provider::StaticProvider;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::protocol::{ProtocolHandler, Router};
use iroh::{Endpoint, EndpointAddr, EndpointId, SecretKey};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    Delegation, DelegationScope, MemoryRemoteServer, PushOutcome, RemoteStore, RequestProof,
};
use crate::error::{SyncError, SyncResult};
use crate::identity::{Did, IdentityProvider};
use crate::sync::envelope::{RawEnvelope, SealedEnvelope};
use crate::types::{now_millis, Collection, Permission};

/// ALPN protocol identifier for relay requests
pub const RELAY_ALPN: &[u8] = b"/dersync/relay/1";

/// Proof method tag; relay frames have no HTTP verb
const PROOF_METHOD: &str = "RELAY";

/// Largest frame either side reads
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Proofs older or newer than this are refused
const MAX_CLOCK_SKEW_MS: i64 = 5 * 60 * 1000;

/// Operations a relay serves, one per [`RemoteStore`] method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RelayRequest {
    Fetch {
        owner: Did,
        collection: Collection,
        since: Option<u64>,
    },
    Push {
        envelopes: Vec<SealedEnvelope>,
    },
    Grant {
        scope: DelegationScope,
        delegate: Did,
        permission: Permission,
    },
    Revoke {
        scope: DelegationScope,
        delegate: Did,
    },
    ListDelegations {
        owner: Did,
    },
}

/// Error classes carried back to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCode {
    PermissionDenied,
    NotFound,
    Unavailable,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum RelayResponse {
    Envelopes(Vec<RawEnvelope>),
    Pushed(PushOutcome),
    Delegations(Vec<Delegation>),
    Done,
    Fault { code: FaultCode, message: String },
}

impl RelayResponse {
    fn fault(err: SyncError) -> Self {
        let code = match &err {
            SyncError::PermissionDenied(_) => FaultCode::PermissionDenied,
            SyncError::RecordNotFound(_) => FaultCode::NotFound,
            e if e.is_transient() => FaultCode::Unavailable,
            _ => FaultCode::Invalid,
        };
        RelayResponse::Fault {
            code,
            message: err.to_string(),
        }
    }

    fn into_error(code: FaultCode, message: String) -> SyncError {
        match code {
            FaultCode::PermissionDenied => SyncError::PermissionDenied(message),
            FaultCode::NotFound => SyncError::RecordNotFound(message),
            FaultCode::Unavailable => SyncError::RemoteUnavailable(message),
            FaultCode::Invalid => SyncError::RemoteProtocol(message),
        }
    }
}

/// One signed request on the wire.
///
/// `body` is the JSON of a [`RelayRequest`], kept as text so the signature
/// covers the exact bytes that were sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RelayFrame {
    did: Did,
    timestamp: i64,
    signature: String,
    body: String,
}

impl RelayFrame {
    fn sign(identity: &dyn IdentityProvider, relay_id: &str, body: String) -> Self {
        let proof = RequestProof::sign(identity, PROOF_METHOD, relay_id, body.as_bytes(), now_millis());
        Self {
            did: proof.did,
            timestamp: proof.timestamp,
            signature: base64::engine::general_purpose::STANDARD.encode(&proof.signature),
            body,
        }
    }

    /// The caller, if the proof holds for this relay and is fresh.
    fn verify(&self, relay_id: &str, now: i64) -> SyncResult<Did> {
        if (now - self.timestamp).abs() > MAX_CLOCK_SKEW_MS {
            return Err(SyncError::PermissionDenied("request proof expired".into()));
        }
        let signature = base64::engine::general_purpose::STANDARD
            .decode(&self.signature)
            .map_err(|e| SyncError::PermissionDenied(format!("malformed signature: {}", e)))?;
        let proof = RequestProof {
            did: self.did.clone(),
            timestamp: self.timestamp,
            signature,
        };
        if !proof.verify(PROOF_METHOD, relay_id, self.body.as_bytes()) {
            return Err(SyncError::PermissionDenied("bad request proof".into()));
        }
        Ok(self.did.clone())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Relay side
// ═══════════════════════════════════════════════════════════════════════════

/// The store behind a relay, opened for one verified caller at a time.
pub trait RelayBackend: Send + Sync + 'static {
    fn store_for(&self, caller: &Did) -> Arc<dyn RemoteStore>;
}

impl RelayBackend for MemoryRemoteServer {
    fn store_for(&self, caller: &Did) -> Arc<dyn RemoteStore> {
        Arc::new(self.client(caller.clone()))
    }
}

/// Router handler for [`RELAY_ALPN`] connections.
#[derive(Clone)]
pub struct RelayProtocolHandler {
    backend: Arc<dyn RelayBackend>,
    relay_id: String,
}

impl std::fmt::Debug for RelayProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayProtocolHandler")
            .field("relay_id", &self.relay_id)
            .finish()
    }
}

impl RelayProtocolHandler {
    pub fn new(backend: Arc<dyn RelayBackend>, relay_id: EndpointId) -> Self {
        Self {
            backend,
            relay_id: relay_id.to_string(),
        }
    }

    pub const fn alpn() -> &'static [u8] {
        RELAY_ALPN
    }

    /// Serve streams until the client closes the connection.
    async fn handle_connection(self, connection: Connection) -> SyncResult<()> {
        let remote_id = connection.remote_id();
        debug!(?remote_id, "Handling relay connection");

        loop {
            let (send, recv) = match connection.accept_bi().await {
                Ok(streams) => streams,
                Err(e) => {
                    debug!(?remote_id, reason = %e, "Relay connection closed");
                    return Ok(());
                }
            };
            let handler = self.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.handle_stream(send, recv).await {
                    warn!(?remote_id, error = %e, "Relay stream failed");
                }
            });
        }
    }

    async fn handle_stream(&self, mut send: SendStream, mut recv: RecvStream) -> SyncResult<()> {
        let frame = recv
            .read_to_end(MAX_FRAME_SIZE)
            .await
            .map_err(|e| SyncError::Network(format!("Failed to read request: {}", e)))?;

        let response = self.respond(&frame, now_millis()).await;
        let bytes =
            serde_json::to_vec(&response).map_err(|e| SyncError::Serialization(e.to_string()))?;

        send.write_all(&bytes)
            .await
            .map_err(|e| SyncError::Network(format!("Failed to write response: {}", e)))?;
        send.finish()
            .map_err(|e| SyncError::Network(format!("Failed to finish stream: {}", e)))?;
        Ok(())
    }

    /// Verify a frame and run it against the caller's view of the backend.
    pub(crate) async fn respond(&self, frame: &[u8], now: i64) -> RelayResponse {
        let frame: RelayFrame = match serde_json::from_slice(frame) {
            Ok(frame) => frame,
            Err(e) => return RelayResponse::fault(SyncError::RemoteProtocol(e.to_string())),
        };
        let caller = match frame.verify(&self.relay_id, now) {
            Ok(caller) => caller,
            Err(e) => {
                warn!(did = %frame.did.short(), error = %e, "Refusing relay request");
                return RelayResponse::fault(e);
            }
        };
        let request: RelayRequest = match serde_json::from_str(&frame.body) {
            Ok(request) => request,
            Err(e) => return RelayResponse::fault(SyncError::RemoteProtocol(e.to_string())),
        };

        let store = self.backend.store_for(&caller);
        let result = match request {
            RelayRequest::Fetch {
                owner,
                collection,
                since,
            } => store
                .fetch(&owner, &collection, since)
                .await
                .map(RelayResponse::Envelopes),
            RelayRequest::Push { envelopes } => {
                store.push(envelopes).await.map(RelayResponse::Pushed)
            }
            RelayRequest::Grant {
                scope,
                delegate,
                permission,
            } => store
                .grant_delegate(&scope, &delegate, permission)
                .await
                .map(|_| RelayResponse::Done),
            RelayRequest::Revoke { scope, delegate } => store
                .revoke_delegate(&scope, &delegate)
                .await
                .map(|_| RelayResponse::Done),
            RelayRequest::ListDelegations { owner } => store
                .list_delegations(&owner)
                .await
                .map(RelayResponse::Delegations),
        };
        result.unwrap_or_else(RelayResponse::fault)
    }
}

impl ProtocolHandler for RelayProtocolHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), iroh::protocol::AcceptError>> + Send {
        let handler = self.clone();

        async move {
            debug!(peer = %conn.remote_id(), "Router accepting relay connection");
            if let Err(e) = handler.handle_connection(conn).await {
                error!(error = ?e, "Failed to handle relay connection");
                return Err(iroh::protocol::AcceptError::from_err(e));
            }
            Ok(())
        }
    }
}

/// A peer serving a [`RelayBackend`] on [`RELAY_ALPN`].
pub struct RelayNode {
    endpoint: Endpoint,
    router: Router,
}

impl RelayNode {
    /// Bind an endpoint and start answering relay requests.
    pub async fn bind(
        secret_key: Option<SecretKey>,
        backend: Arc<dyn RelayBackend>,
    ) -> SyncResult<Self> {
        let secret_key = secret_key.unwrap_or_else(|| SecretKey::generate(&mut rand::rng()));

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![RELAY_ALPN.to_vec()])
            .bind()
            .await
            .map_err(|e| SyncError::Network(format!("Failed to bind endpoint: {}", e)))?;
        info!(endpoint_id = %endpoint.id(), "Relay endpoint bound");

        let handler = RelayProtocolHandler::new(backend, endpoint.id());
        let router = Router::builder(endpoint.clone())
            .accept(RELAY_ALPN, handler)
            .spawn();

        Ok(Self { endpoint, router })
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    /// Address to configure on clients
    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    pub async fn shutdown(self) -> SyncResult<()> {
        info!("Shutting down relay");
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }
        self.endpoint.close().await;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Client side
// ═══════════════════════════════════════════════════════════════════════════

/// Remote store reached through a relay peer.
pub struct RelayRemoteStore {
    endpoint: Endpoint,
    relay: EndpointAddr,
    identity: Arc<dyn IdentityProvider>,
    timeout: Duration,
    connection: Mutex<Option<Connection>>,
}

impl RelayRemoteStore {
    /// Bind a client endpoint that knows how to reach `relay`.
    ///
    /// No connection is made until the first request.
    pub async fn bind(
        relay: EndpointAddr,
        identity: Arc<dyn IdentityProvider>,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let static_provider = StaticProvider::new();
        static_provider.add_endpoint_info(relay.clone());

        let endpoint = Endpoint::builder()
            .discovery(static_provider)
            .bind()
            .await
            .map_err(|e| SyncError::Network(format!("Failed to bind endpoint: {}", e)))?;
        info!(relay = %relay.id, endpoint_id = %endpoint.id(), "Relay client bound");

        Ok(Self {
            endpoint,
            relay,
            identity,
            timeout,
            connection: Mutex::new(None),
        })
    }

    pub fn relay_id(&self) -> EndpointId {
        self.relay.id
    }

    /// Cached connection, reopened after the relay dropped it.
    async fn connection(&self) -> SyncResult<Connection> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
            debug!(relay = %self.relay.id, "Relay connection closed, reconnecting");
        }
        let conn = self
            .endpoint
            .connect(self.relay.clone(), RELAY_ALPN)
            .await
            .map_err(|e| SyncError::RemoteUnavailable(format!("Failed to connect to relay: {}", e)))?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn forget_connection(&self) {
        self.connection.lock().await.take();
    }

    async fn call(&self, request: &RelayRequest) -> SyncResult<RelayResponse> {
        match tokio::time::timeout(self.timeout, self.exchange(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                if e.is_transient() {
                    self.forget_connection().await;
                }
                Err(e)
            }
            Err(_) => {
                warn!(relay = %self.relay.id, "Relay request timed out");
                self.forget_connection().await;
                Err(SyncError::RemoteUnavailable("relay request timed out".into()))
            }
        }
    }

    async fn exchange(&self, request: &RelayRequest) -> SyncResult<RelayResponse> {
        let body =
            serde_json::to_string(request).map_err(|e| SyncError::Serialization(e.to_string()))?;
        let frame = RelayFrame::sign(self.identity.as_ref(), &self.relay.id.to_string(), body);
        let bytes =
            serde_json::to_vec(&frame).map_err(|e| SyncError::Serialization(e.to_string()))?;

        let conn = self.connection().await?;
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| SyncError::RemoteUnavailable(format!("Failed to open stream: {}", e)))?;
        send.write_all(&bytes)
            .await
            .map_err(|e| SyncError::RemoteUnavailable(format!("Failed to send request: {}", e)))?;
        send.finish()
            .map_err(|e| SyncError::RemoteUnavailable(format!("Failed to finish stream: {}", e)))?;

        let reply = recv
            .read_to_end(MAX_FRAME_SIZE)
            .await
            .map_err(|e| SyncError::RemoteUnavailable(format!("Failed to read response: {}", e)))?;
        let response: RelayResponse = serde_json::from_slice(&reply)
            .map_err(|e| SyncError::RemoteProtocol(format!("Undecodable relay response: {}", e)))?;
        debug!(relay = %self.relay.id, len = reply.len(), "Relay response");

        match response {
            RelayResponse::Fault { code, message } => Err(RelayResponse::into_error(code, message)),
            other => Ok(other),
        }
    }

    pub async fn close(&self) {
        if let Some(conn) = self.connection.lock().await.take() {
            conn.close(0u32.into(), b"done");
        }
        self.endpoint.close().await;
    }
}

fn unexpected(response: RelayResponse) -> SyncError {
    SyncError::RemoteProtocol(format!("unexpected relay response: {:?}", response))
}

#[async_trait]
impl RemoteStore for RelayRemoteStore {
    async fn fetch(
        &self,
        owner: &Did,
        collection: &Collection,
        since: Option<u64>,
    ) -> SyncResult<Vec<RawEnvelope>> {
        let request = RelayRequest::Fetch {
            owner: owner.clone(),
            collection: collection.clone(),
            since,
        };
        match self.call(&request).await? {
            RelayResponse::Envelopes(envelopes) => Ok(envelopes),
            other => Err(unexpected(other)),
        }
    }

    async fn push(&self, envelopes: Vec<SealedEnvelope>) -> SyncResult<PushOutcome> {
        match self.call(&RelayRequest::Push { envelopes }).await? {
            RelayResponse::Pushed(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    async fn grant_delegate(
        &self,
        scope: &DelegationScope,
        delegate: &Did,
        permission: Permission,
    ) -> SyncResult<()> {
        let request = RelayRequest::Grant {
            scope: scope.clone(),
            delegate: delegate.clone(),
            permission,
        };
        match self.call(&request).await? {
            RelayResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn revoke_delegate(&self, scope: &DelegationScope, delegate: &Did) -> SyncResult<()> {
        let request = RelayRequest::Revoke {
            scope: scope.clone(),
            delegate: delegate.clone(),
        };
        match self.call(&request).await? {
            RelayResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn list_delegations(&self, owner: &Did) -> SyncResult<Vec<Delegation>> {
        let request = RelayRequest::ListDelegations {
            owner: owner.clone(),
        };
        match self.call(&request).await? {
            RelayResponse::Delegations(delegations) => Ok(delegations),
            other => Err(unexpected(other)),
        }
    }
}
