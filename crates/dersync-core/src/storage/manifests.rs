//! Manifest Storage - delegation manifests per (owner, delegate) pair
//!
//! A delegate keeps the last manifest received from each owner; an owner
//! keeps the last one it issued to each delegate. A newer manifest replaces
//! the stored one wholesale.

use crate::error::SyncError;
use crate::identity::Did;
use crate::sync::DelegationManifest;
use redb::{ReadableTable, TableDefinition};

use super::Storage;

/// Table for manifests (key: "{owner}/{delegate}", value: JSON manifest)
pub(crate) const MANIFESTS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("delegation_manifests");

fn manifest_key(owner: &Did, delegate: &Did) -> String {
    format!("{}/{}", owner, delegate)
}

impl Storage {
    /// Save a manifest, replacing any previous one for the same pair.
    pub fn save_manifest(&self, manifest: &DelegationManifest) -> Result<(), SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(MANIFESTS_TABLE)?;
            let data = serde_json::to_vec(manifest)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            let key = manifest_key(&manifest.owner, &manifest.delegate);
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the manifest `owner` issued to `delegate`.
    pub fn load_manifest(
        &self,
        owner: &Did,
        delegate: &Did,
    ) -> Result<Option<DelegationManifest>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(MANIFESTS_TABLE)?;

        match table.get(manifest_key(owner, delegate).as_str())? {
            Some(v) => {
                let manifest: DelegationManifest = serde_json::from_slice(v.value())
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                Ok(Some(manifest))
            }
            None => Ok(None),
        }
    }

    /// Every stored manifest addressed to `delegate`.
    pub fn list_manifests(&self, delegate: &Did) -> Result<Vec<DelegationManifest>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(MANIFESTS_TABLE)?;

        let mut manifests = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let manifest: DelegationManifest = serde_json::from_slice(value.value())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            if &manifest.delegate == delegate {
                manifests.push(manifest);
            }
        }
        Ok(manifests)
    }
}
