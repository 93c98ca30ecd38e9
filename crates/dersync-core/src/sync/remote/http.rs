//! HTTPS remote store
//!
//! ## Routes
//!
//! ```text
//! GET    {base}/v1/records/{owner}/{collection}[?since=N]  -> [RawEnvelope]
//! POST   {base}/v1/records                                 [SealedEnvelope] -> PushOutcome
//! POST   {base}/v1/delegations                             {scope, delegate, permission}
//! DELETE {base}/v1/delegations                             {scope, delegate}
//! GET    {base}/v1/delegations/{owner}                     -> [Delegation]
//! ```
//!
//! ## Authentication
//!
//! No bearer tokens. Every request carries a proof signed by the caller's
//! identity over `METHOD \n URL \n sha256(body) \n timestamp`:
//!
//! ```text
//! X-Dersync-Did:       did:der:z...
//! X-Dersync-Timestamp: unix millis
//! X-Dersync-Signature: base64(ed25519 signature)
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{Delegation, DelegationScope, PushOutcome, RemoteStore};
use crate::error::{SyncError, SyncResult};
use crate::identity::{Did, IdentityProvider};
use crate::sync::envelope::{RawEnvelope, SealedEnvelope};
use crate::types::{now_millis, Collection, Permission};

pub const HEADER_DID: &str = "X-Dersync-Did";
pub const HEADER_TIMESTAMP: &str = "X-Dersync-Timestamp";
pub const HEADER_SIGNATURE: &str = "X-Dersync-Signature";

/// Signed binding of one request to the caller's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestProof {
    pub did: Did,
    pub timestamp: i64,
    pub signature: Vec<u8>,
}

impl RequestProof {
    /// Bytes covered by the signature
    pub fn message(method: &str, url: &str, body: &[u8], timestamp: i64) -> Vec<u8> {
        let body_hash = hex::encode(Sha256::digest(body));
        format!("{}\n{}\n{}\n{}", method, url, body_hash, timestamp).into_bytes()
    }

    pub fn sign(
        identity: &dyn IdentityProvider,
        method: &str,
        url: &str,
        body: &[u8],
        timestamp: i64,
    ) -> Self {
        let message = Self::message(method, url, body, timestamp);
        Self {
            did: identity.did(),
            timestamp,
            signature: identity.sign(&message),
        }
    }

    /// Server-side check of a proof
    pub fn verify(&self, method: &str, url: &str, body: &[u8]) -> bool {
        let message = Self::message(method, url, body, self.timestamp);
        self.did.verify(&message, &self.signature)
    }

    fn signature_b64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.signature)
    }
}

#[derive(Serialize)]
struct GrantBody<'a> {
    scope: &'a DelegationScope,
    delegate: &'a Did,
    #[serde(skip_serializing_if = "Option::is_none")]
    permission: Option<Permission>,
}

/// Remote store reached over HTTPS.
#[derive(Clone)]
pub struct HttpRemoteStore {
    base_url: String,
    client: reqwest::Client,
    identity: Arc<dyn IdentityProvider>,
}

impl HttpRemoteStore {
    /// Client with a bounded per-request timeout.
    pub fn new(
        base_url: impl Into<String>,
        identity: Arc<dyn IdentityProvider>,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            identity,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, method: Method, url: String, body: Vec<u8>) -> SyncResult<reqwest::Response> {
        let proof = RequestProof::sign(
            self.identity.as_ref(),
            method.as_str(),
            &url,
            &body,
            now_millis(),
        );

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(HEADER_DID, proof.did.as_str())
            .header(HEADER_TIMESTAMP, proof.timestamp.to_string())
            .header(HEADER_SIGNATURE, proof.signature_b64());
        if !body.is_empty() {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        debug!(%method, %url, status = status.as_u16(), "Remote request");

        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(map_status(status, &text))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: String,
        body: Vec<u8>,
    ) -> SyncResult<T> {
        let response = self.send(method, url, body).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::RemoteProtocol(format!("invalid response body: {}", e)))
    }
}

fn to_body<T: Serialize + ?Sized>(value: &T) -> SyncResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| SyncError::Serialization(e.to_string()))
}

/// Map an HTTP status to the error taxonomy.
pub(crate) fn map_status(status: StatusCode, body: &str) -> SyncError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::PermissionDenied(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            SyncError::RemoteUnavailable(detail)
        }
        s if s.is_server_error() => SyncError::RemoteUnavailable(detail),
        _ => SyncError::RemoteProtocol(detail),
    }
}

fn map_transport_error(err: reqwest::Error) -> SyncError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        warn!(error = %err, "Remote store unreachable");
        SyncError::RemoteUnavailable(err.to_string())
    } else {
        SyncError::RemoteProtocol(err.to_string())
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn fetch(
        &self,
        owner: &Did,
        collection: &Collection,
        since: Option<u64>,
    ) -> SyncResult<Vec<RawEnvelope>> {
        let mut url = self.url(&format!("/v1/records/{}/{}", owner, collection));
        if let Some(since) = since {
            url.push_str(&format!("?since={}", since));
        }
        match self.send_json(Method::GET, url, Vec::new()).await {
            Err(SyncError::RemoteProtocol(msg)) if msg.starts_with("404") => Ok(Vec::new()),
            other => other,
        }
    }

    async fn push(&self, envelopes: Vec<SealedEnvelope>) -> SyncResult<PushOutcome> {
        if envelopes.is_empty() {
            return Ok(PushOutcome::default());
        }
        let body = to_body(&envelopes)?;
        self.send_json(Method::POST, self.url("/v1/records"), body).await
    }

    async fn grant_delegate(
        &self,
        scope: &DelegationScope,
        delegate: &Did,
        permission: Permission,
    ) -> SyncResult<()> {
        let body = to_body(&GrantBody {
            scope,
            delegate,
            permission: Some(permission),
        })?;
        self.send(Method::POST, self.url("/v1/delegations"), body).await?;
        Ok(())
    }

    async fn revoke_delegate(&self, scope: &DelegationScope, delegate: &Did) -> SyncResult<()> {
        let body = to_body(&GrantBody {
            scope,
            delegate,
            permission: None,
        })?;
        self.send(Method::DELETE, self.url("/v1/delegations"), body).await?;
        Ok(())
    }

    async fn list_delegations(&self, owner: &Did) -> SyncResult<Vec<Delegation>> {
        let url = self.url(&format!("/v1/delegations/{}", owner));
        self.send_json(Method::GET, url, Vec::new()).await
    }
}
