//! Persistent storage using redb.
//!
//! This module provides ACID-compliant storage for:
//! - Versioned records, keyed by owner and record id
//! - The local identity and device id
//! - Delegation manifests received from owners
//!
//! Nothing in here touches the network.

use crate::error::SyncError;
use crate::identity::LocalIdentity;
use crate::types::DeviceId;
use parking_lot::RwLock;
use redb::{Database, TableDefinition};
use std::path::Path;
use std::sync::Arc;

mod manifests;
mod records;

use manifests::MANIFESTS_TABLE;
use records::RECORDS_TABLE;

const IDENTITY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("identity");

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Open (or create) the database at `path`.
    ///
    /// Parent directories are created as needed and every table exists
    /// after this returns.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Ephemeral database that lives only as long as this handle.
    pub fn in_memory() -> Result<Self, SyncError> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self, SyncError> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(RECORDS_TABLE)?;
            let _ = write_txn.open_table(IDENTITY_TABLE)?;
            let _ = write_txn.open_table(MANIFESTS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Shared database handle for the submodules
    pub(crate) fn db_handle(&self) -> Arc<RwLock<Database>> {
        self.db.clone()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Identity Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Identity storage key (there's only one identity per installation)
    const IDENTITY_KEY: &'static str = "local_identity";

    /// Device id storage key
    const DEVICE_ID_KEY: &'static str = "device_id";

    /// Save the local identity.
    pub fn save_identity(&self, identity: &LocalIdentity) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(IDENTITY_TABLE)?;
            let data = identity.to_bytes();
            table.insert(Self::IDENTITY_KEY, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the local identity.
    ///
    /// Returns `None` if no identity has been created yet.
    pub fn load_identity(&self) -> Result<Option<LocalIdentity>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(IDENTITY_TABLE)?;

        match table.get(Self::IDENTITY_KEY)? {
            Some(v) => Ok(Some(LocalIdentity::from_bytes(v.value())?)),
            None => Ok(None),
        }
    }

    /// Check if an identity exists in storage.
    pub fn has_identity(&self) -> Result<bool, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(IDENTITY_TABLE)?;

        Ok(table.get(Self::IDENTITY_KEY)?.is_some())
    }

    /// Load the identity, generating and saving one on first use.
    pub fn load_or_create_identity(&self) -> Result<LocalIdentity, SyncError> {
        if let Some(identity) = self.load_identity()? {
            return Ok(identity);
        }
        let identity = LocalIdentity::generate();
        self.save_identity(&identity)?;
        Ok(identity)
    }

    /// Stable per-installation device id, created on first call.
    pub fn device_id(&self) -> Result<DeviceId, SyncError> {
        let db = self.db.read();
        {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(IDENTITY_TABLE)?;
            if let Some(v) = table.get(Self::DEVICE_ID_KEY)? {
                let bytes: [u8; 16] = v
                    .value()
                    .try_into()
                    .map_err(|_| SyncError::Storage("corrupt device id".to_string()))?;
                return Ok(DeviceId::from_bytes(bytes));
            }
        }

        let device_id = DeviceId::new();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(IDENTITY_TABLE)?;
            table.insert(Self::DEVICE_ID_KEY, device_id.as_bytes().as_slice())?;
        }
        write_txn.commit()?;
        Ok(device_id)
    }
}
