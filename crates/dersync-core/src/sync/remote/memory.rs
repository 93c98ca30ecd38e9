//! In-process remote store
//!
//! [`MemoryRemoteServer`] holds the authoritative state: stored objects,
//! per-record version counters and the delegation table. Each device talks
//! to it through its own [`MemoryRemoteStore`] handle, which carries the
//! caller's Did the way a signed HTTP request would.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{
    Accepted, Delegation, DelegationScope, PushOutcome, RejectReason, Rejected, RemoteStore,
};
use crate::error::{SyncError, SyncResult};
use crate::identity::Did;
use crate::sync::envelope::{RawEnvelope, SealedEnvelope, UNVERSIONED};
use crate::types::{Collection, Permission, RecordId};

#[derive(Debug, Clone)]
struct StoredObject {
    collection: Collection,
    version: u64,
    raw: RawEnvelope,
}

#[derive(Debug, Default)]
struct ServerState {
    objects: BTreeMap<(Did, RecordId), StoredObject>,
    delegations: Vec<Delegation>,
    unavailable: bool,
    pushes: usize,
}

impl ServerState {
    fn permission(&self, caller: &Did, owner: &Did, collection: &Collection, record_id: &RecordId) -> Option<Permission> {
        if caller == owner {
            return Some(Permission::Write);
        }
        self.delegations
            .iter()
            .filter(|d| &d.delegate == caller && d.scope.covers(owner, collection, record_id))
            .map(|d| d.permission)
            .max()
    }

    fn check_available(&self) -> SyncResult<()> {
        if self.unavailable {
            Err(SyncError::RemoteUnavailable("memory server offline".into()))
        } else {
            Ok(())
        }
    }
}

/// Shared authoritative state.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemoteServer {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryRemoteServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle acting as `caller`
    pub fn client(&self, caller: Did) -> MemoryRemoteStore {
        MemoryRemoteStore {
            server: self.clone(),
            caller,
        }
    }

    /// Simulate an outage; every call fails with `RemoteUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.state.lock().unavailable = !available;
    }

    /// Store an object as an older client would have written it.
    pub fn insert_raw(&self, owner: &Did, collection: &Collection, raw: RawEnvelope) -> SyncResult<()> {
        let record_id = raw
            .record_id
            .clone()
            .map(RecordId::from_string)
            .ok_or_else(|| SyncError::InvalidOperation("raw object without record_id".into()))?;
        let version = raw.version.unwrap_or(UNVERSIONED);
        self.state.lock().objects.insert(
            (owner.clone(), record_id),
            StoredObject {
                collection: collection.clone(),
                version,
                raw,
            },
        );
        Ok(())
    }

    /// Delete an object out of band (another client, an administrator).
    pub fn remove(&self, owner: &Did, record_id: &RecordId) -> bool {
        self.state
            .lock()
            .objects
            .remove(&(owner.clone(), record_id.clone()))
            .is_some()
    }

    /// Current server version of a record
    pub fn version_of(&self, owner: &Did, record_id: &RecordId) -> Option<u64> {
        self.state
            .lock()
            .objects
            .get(&(owner.clone(), record_id.clone()))
            .map(|o| o.version)
    }

    /// Stored object, as a fetch would return it to the owner
    pub fn raw_of(&self, owner: &Did, record_id: &RecordId) -> Option<RawEnvelope> {
        self.state
            .lock()
            .objects
            .get(&(owner.clone(), record_id.clone()))
            .map(|o| o.raw.clone())
    }

    /// Number of objects held for `owner`
    pub fn object_count(&self, owner: &Did) -> usize {
        self.state
            .lock()
            .objects
            .keys()
            .filter(|(o, _)| o == owner)
            .count()
    }

    /// Number of push batches received
    pub fn push_count(&self) -> usize {
        self.state.lock().pushes
    }
}

/// One caller's view of a [`MemoryRemoteServer`].
#[derive(Debug, Clone)]
pub struct MemoryRemoteStore {
    server: MemoryRemoteServer,
    caller: Did,
}

impl MemoryRemoteStore {
    pub fn caller(&self) -> &Did {
        &self.caller
    }

    pub fn server(&self) -> &MemoryRemoteServer {
        &self.server
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn fetch(
        &self,
        owner: &Did,
        collection: &Collection,
        since: Option<u64>,
    ) -> SyncResult<Vec<RawEnvelope>> {
        let state = self.server.state.lock();
        state.check_available()?;

        let envelopes: Vec<RawEnvelope> = state
            .objects
            .iter()
            .filter(|((o, _), obj)| o == owner && &obj.collection == collection)
            .filter(|(_, obj)| since.map_or(true, |s| obj.version > s))
            .filter(|((o, id), obj)| {
                state
                    .permission(&self.caller, o, &obj.collection, id)
                    .is_some()
            })
            .map(|(_, obj)| obj.raw.clone())
            .collect();

        debug!(
            caller = %self.caller.short(),
            owner = %owner.short(),
            %collection,
            count = envelopes.len(),
            "Memory fetch"
        );
        Ok(envelopes)
    }

    async fn push(&self, envelopes: Vec<SealedEnvelope>) -> SyncResult<PushOutcome> {
        let mut state = self.server.state.lock();
        state.check_available()?;
        state.pushes += 1;

        let mut outcome = PushOutcome::default();
        for mut env in envelopes {
            if env.encrypted_from != self.caller {
                outcome.rejected.push(Rejected {
                    record_id: env.record_id,
                    reason: RejectReason::Invalid("encrypted_from is not the caller".into()),
                });
                continue;
            }

            let allowed = state
                .permission(&self.caller, &env.owner, &env.collection, &env.record_id)
                .is_some_and(|p| p.allows_write());
            if !allowed {
                outcome.rejected.push(Rejected {
                    record_id: env.record_id,
                    reason: RejectReason::PermissionDenied,
                });
                continue;
            }

            let key = (env.owner.clone(), env.record_id.clone());
            let version = state.objects.get(&key).map_or(0, |o| o.version) + 1;
            env.version = version;
            state.objects.insert(
                key,
                StoredObject {
                    collection: env.collection.clone(),
                    version,
                    raw: RawEnvelope::from(&env),
                },
            );
            outcome.accepted.push(Accepted {
                record_id: env.record_id,
                version,
            });
        }

        Ok(outcome)
    }

    async fn grant_delegate(
        &self,
        scope: &DelegationScope,
        delegate: &Did,
        permission: Permission,
    ) -> SyncResult<()> {
        let mut state = self.server.state.lock();
        state.check_available()?;
        if scope.owner() != &self.caller {
            return Err(SyncError::PermissionDenied(
                "only the owner may grant delegates".into(),
            ));
        }

        state
            .delegations
            .retain(|d| !(&d.scope == scope && &d.delegate == delegate));
        state.delegations.push(Delegation {
            scope: scope.clone(),
            delegate: delegate.clone(),
            permission,
        });
        Ok(())
    }

    async fn revoke_delegate(&self, scope: &DelegationScope, delegate: &Did) -> SyncResult<()> {
        let mut state = self.server.state.lock();
        state.check_available()?;
        if scope.owner() != &self.caller {
            return Err(SyncError::PermissionDenied(
                "only the owner may revoke delegates".into(),
            ));
        }

        state
            .delegations
            .retain(|d| !(&d.scope == scope && &d.delegate == delegate));
        Ok(())
    }

    async fn list_delegations(&self, owner: &Did) -> SyncResult<Vec<Delegation>> {
        let state = self.server.state.lock();
        state.check_available()?;

        Ok(state
            .delegations
            .iter()
            .filter(|d| d.scope.owner() == owner)
            .filter(|d| owner == &self.caller || d.delegate == self.caller)
            .cloned()
            .collect())
    }
}
