//! Delegation manifests
//!
//! An owner tells each delegate which records they may see, as one full
//! view per (owner, delegate) pair. A newer manifest replaces the previous
//! one wholesale, so a record missing from it has been revoked.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::identity::Did;
use crate::storage::Storage;
use crate::types::{now_millis, Collection, Permission, Record, RecordId};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub record_id: RecordId,
    pub collection: Collection,
    pub permission: Permission,
}

/// Everything `owner` currently shares with `delegate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationManifest {
    pub owner: Did,
    pub delegate: Did,
    /// Sorted by record id
    pub entries: Vec<ManifestEntry>,
    pub issued_at: i64,
}

impl DelegationManifest {
    /// Build the view of `records` granted to `delegate`, stamped now.
    ///
    /// Soft-deleted records are left out.
    pub fn from_records<'a>(
        owner: &Did,
        delegate: &Did,
        records: impl IntoIterator<Item = &'a Record>,
    ) -> Self {
        let mut entries: Vec<ManifestEntry> = records
            .into_iter()
            .filter(|r| &r.owner == owner && r.is_visible())
            .filter_map(|r| {
                r.grants.permission_of(delegate).map(|permission| ManifestEntry {
                    record_id: r.record_id.clone(),
                    collection: r.collection.clone(),
                    permission,
                })
            })
            .collect();
        entries.sort();

        Self {
            owner: owner.clone(),
            delegate: delegate.clone(),
            entries,
            issued_at: now_millis(),
        }
    }

    /// Move `issued_at` past `previous`, so manifests issued within the same
    /// millisecond still replace each other in order.
    pub fn issued_after(mut self, previous: Option<&DelegationManifest>) -> Self {
        if let Some(prev) = previous {
            self.issued_at = self.issued_at.max(prev.issued_at + 1);
        }
        self
    }

    pub fn permission_for(&self, record_id: &RecordId) -> Option<Permission> {
        self.entries
            .iter()
            .find(|e| &e.record_id == record_id)
            .map(|e| e.permission)
    }
}

/// What changed between two manifests for the same pair
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub granted: Vec<ManifestEntry>,
    pub revoked: Vec<ManifestEntry>,
    /// Same record, different permission (new value)
    pub changed: Vec<ManifestEntry>,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.granted.is_empty() && self.revoked.is_empty() && self.changed.is_empty()
    }

    pub fn between(old: Option<&DelegationManifest>, new: &DelegationManifest) -> Self {
        let old_entries: &[ManifestEntry] = old.map(|m| m.entries.as_slice()).unwrap_or(&[]);
        let mut diff = ManifestDiff::default();

        for entry in &new.entries {
            match old_entries.iter().find(|e| e.record_id == entry.record_id) {
                None => diff.granted.push(entry.clone()),
                Some(prev) if prev.permission != entry.permission => diff.changed.push(entry.clone()),
                Some(_) => {}
            }
        }
        for entry in old_entries {
            if !new.entries.iter().any(|e| e.record_id == entry.record_id) {
                diff.revoked.push(entry.clone());
            }
        }
        diff
    }
}

/// The delegate-side record of manifests received.
#[derive(Clone)]
pub struct ManifestBook {
    storage: Storage,
    me: Did,
}

impl ManifestBook {
    pub fn new(storage: Storage, me: Did) -> Self {
        Self { storage, me }
    }

    /// Replace the stored view for this owner.
    ///
    /// Returns `None` when the manifest is not newer than the stored one.
    pub fn apply(&self, manifest: DelegationManifest) -> SyncResult<Option<ManifestDiff>> {
        if manifest.delegate != self.me {
            return Err(SyncError::InvalidOperation(format!(
                "manifest addressed to {}",
                manifest.delegate.short()
            )));
        }

        let stored = self.storage.load_manifest(&manifest.owner, &self.me)?;
        if let Some(prev) = &stored {
            if prev.issued_at >= manifest.issued_at {
                debug!(
                    owner = %manifest.owner.short(),
                    stored = prev.issued_at,
                    incoming = manifest.issued_at,
                    "Ignoring stale manifest"
                );
                return Ok(None);
            }
        }

        let diff = ManifestDiff::between(stored.as_ref(), &manifest);
        self.storage.save_manifest(&manifest)?;
        info!(
            owner = %manifest.owner.short(),
            granted = diff.granted.len(),
            revoked = diff.revoked.len(),
            changed = diff.changed.len(),
            "Applied delegation manifest"
        );
        Ok(Some(diff))
    }

    pub fn current(&self, owner: &Did) -> SyncResult<Option<DelegationManifest>> {
        self.storage.load_manifest(owner, &self.me)
    }

    /// Owners that currently share at least one record with us
    pub fn owners(&self) -> SyncResult<Vec<Did>> {
        Ok(self
            .storage
            .list_manifests(&self.me)?
            .into_iter()
            .filter(|m| !m.entries.is_empty())
            .map(|m| m.owner)
            .collect())
    }
}
