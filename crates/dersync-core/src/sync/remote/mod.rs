//! Remote record store capability
//!
//! The remote store is untrusted for confidentiality: it sees envelopes,
//! never plaintext or keys. It is trusted for availability and ordering,
//! and it is the only party that assigns versions.
//!
//! Implementations of the trait:
//!
//! - [`HttpRemoteStore`]: JSON over HTTPS with signed request proofs
//! - [`RelayRemoteStore`]: the same requests over an iroh connection to a
//!   [`RelayNode`] peer
//! - [`MemoryRemoteStore`]: in-process model of the server, one handle per
//!   caller identity over a shared [`MemoryRemoteServer`]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::identity::Did;
use crate::sync::envelope::{RawEnvelope, SealedEnvelope};
use crate::types::{Collection, Permission, RecordId};

mod http;
mod memory;
mod relay;

pub use http::{HttpRemoteStore, RequestProof};
pub use memory::{MemoryRemoteServer, MemoryRemoteStore};
pub use relay::{
    FaultCode, RelayBackend, RelayNode, RelayProtocolHandler, RelayRemoteStore, RelayRequest,
    RelayResponse, RELAY_ALPN,
};

/// What a delegation covers
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DelegationScope {
    /// One record
    Record { owner: Did, record_id: RecordId },
    /// Every record of a collection, including future ones
    Collection { owner: Did, collection: Collection },
}

impl DelegationScope {
    pub fn owner(&self) -> &Did {
        match self {
            DelegationScope::Record { owner, .. } | DelegationScope::Collection { owner, .. } => {
                owner
            }
        }
    }

    /// Whether this scope covers the given record
    pub fn covers(&self, owner: &Did, collection: &Collection, record_id: &RecordId) -> bool {
        match self {
            DelegationScope::Record {
                owner: o,
                record_id: r,
            } => o == owner && r == record_id,
            DelegationScope::Collection {
                owner: o,
                collection: c,
            } => o == owner && c == collection,
        }
    }
}

/// One row of the server's delegation table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub scope: DelegationScope,
    pub delegate: Did,
    pub permission: Permission,
}

/// A record the server took, with the version it assigned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    pub record_id: RecordId,
    pub version: u64,
}

/// Why the server refused a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
    /// Caller is neither the owner nor a write delegate
    PermissionDenied,
    /// Anything else the server did not like
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejected {
    pub record_id: RecordId,
    pub reason: RejectReason,
}

/// Per-record result of a batch push
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushOutcome {
    #[serde(default)]
    pub accepted: Vec<Accepted>,
    #[serde(default)]
    pub rejected: Vec<Rejected>,
}

/// Storage backend holding sealed envelopes.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Envelopes of `owner` in `collection` visible to the caller.
    ///
    /// `since` limits the result to versions greater than it. Remote
    /// deletion detection needs the full set, so sync passes pass `None`.
    async fn fetch(
        &self,
        owner: &Did,
        collection: &Collection,
        since: Option<u64>,
    ) -> SyncResult<Vec<RawEnvelope>>;

    /// Submit a batch; each record is accepted or rejected independently.
    async fn push(&self, envelopes: Vec<SealedEnvelope>) -> SyncResult<PushOutcome>;

    async fn grant_delegate(
        &self,
        scope: &DelegationScope,
        delegate: &Did,
        permission: Permission,
    ) -> SyncResult<()>;

    async fn revoke_delegate(&self, scope: &DelegationScope, delegate: &Did) -> SyncResult<()>;

    /// Delegations issued by `owner`
    async fn list_delegations(&self, owner: &Did) -> SyncResult<Vec<Delegation>>;
}
