//! Record Storage - the versioned record store
//!
//! Records are keyed `"{owner}/{record_id}"`: a delegate device holds
//! records from several owners and their ids may collide. Listing one
//! owner is a key range scan over `"{owner}/" .. "{owner}0"` ('0' sorts
//! right after '/').

use crate::error::SyncError;
use crate::identity::Did;
use crate::types::{Record, RecordId};
use redb::{ReadableTable, TableDefinition};

use super::Storage;

/// Table for records (key: "{owner}/{record_id}", value: JSON Record)
pub(crate) const RECORDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

fn record_key(owner: &Did, record_id: &RecordId) -> String {
    format!("{}/{}", owner, record_id)
}

fn owner_range(owner: &Did) -> (String, String) {
    (format!("{}/", owner), format!("{}0", owner))
}

impl Storage {
    /// Load one record.
    pub fn get(&self, owner: &Did, record_id: &RecordId) -> Result<Option<Record>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(RECORDS_TABLE)?;

        match table.get(record_key(owner, record_id).as_str())? {
            Some(v) => {
                let record: Record = serde_json::from_slice(v.value())
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Insert or replace a record wholesale, in one write transaction.
    pub fn put(&self, record: &Record) -> Result<(), SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(RECORDS_TABLE)?;
            let data =
                serde_json::to_vec(record).map_err(|e| SyncError::Serialization(e.to_string()))?;
            let key = record_key(&record.owner, &record.record_id);
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Remove all local trace of a record.
    ///
    /// Returns `Ok(false)` if there was nothing to remove.
    pub fn delete(&self, owner: &Did, record_id: &RecordId) -> Result<bool, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(RECORDS_TABLE)?;
            let existed = table.remove(record_key(owner, record_id).as_str())?.is_some();
            existed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Every record held for `owner`, soft-deleted ones included.
    pub fn list_by_owner(&self, owner: &Did) -> Result<Vec<Record>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(RECORDS_TABLE)?;

        let (start, end) = owner_range(owner);
        let mut records = Vec::new();
        for entry in table.range(start.as_str()..end.as_str())? {
            let (_, value) = entry?;
            let record: Record = serde_json::from_slice(value.value())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Records for `owner` with unpushed local mutations.
    pub fn list_pending(&self, owner: &Did) -> Result<Vec<Record>, SyncError> {
        Ok(self
            .list_by_owner(owner)?
            .into_iter()
            .filter(|r| r.pending)
            .collect())
    }

    /// Distinct owners with at least one stored record.
    pub fn list_owners(&self) -> Result<Vec<Did>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(RECORDS_TABLE)?;

        let mut owners: Vec<Did> = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            let Some((owner, _)) = key.value().split_once('/') else {
                continue;
            };
            if owners.last().map(|d| d.as_str()) != Some(owner) {
                owners.push(Did::parse(owner)?);
            }
        }
        Ok(owners)
    }
}
