//! Simulated devices sharing one in-process remote store (and optionally
//! one broadcast medium).

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use dersync_core::identity::{IdentityProvider, LocalIdentity};
use dersync_core::sync::{
    BroadcastMedium, MemoryRemoteServer, Notifier, RemoteStore, SyncOutcome, SyncReport,
};
use dersync_core::{Collection, Did, Record, RecordId, Storage, SyncContext, SyncEngine};
use tempfile::TempDir;

pub struct Device {
    pub engine: Arc<SyncEngine>,
    pub identity: Arc<LocalIdentity>,
    _dir: TempDir,
}

impl Device {
    /// A device with its own on-disk store, acting as `identity`.
    pub fn new(server: &MemoryRemoteServer, identity: Arc<LocalIdentity>) -> Self {
        let remote = Arc::new(server.client(identity.did()));
        Self::build(remote, identity, None)
    }

    /// A device talking to the store through `remote`
    pub fn with_remote(remote: Arc<dyn RemoteStore>, identity: Arc<LocalIdentity>) -> Self {
        Self::build(remote, identity, None)
    }

    /// Same, with a notifier over `medium`.
    pub fn with_medium(
        server: &MemoryRemoteServer,
        identity: Arc<LocalIdentity>,
        medium: Arc<dyn BroadcastMedium>,
    ) -> Self {
        let remote = Arc::new(server.client(identity.did()));
        Self::build(remote, identity, Some(medium))
    }

    fn build(
        remote: Arc<dyn RemoteStore>,
        identity: Arc<LocalIdentity>,
        medium: Option<Arc<dyn BroadcastMedium>>,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path().join("dersync.redb")).unwrap();
        let ctx = SyncContext::new(identity.clone(), storage.device_id().unwrap());

        let mut engine = SyncEngine::new(storage, remote, ctx.clone(), vec![Collection::tasks()]);
        if let Some(medium) = medium {
            engine = engine.with_notifier(Arc::new(Notifier::new(ctx, medium, Duration::ZERO)));
        }

        Self {
            engine: Arc::new(engine),
            identity,
            _dir: dir,
        }
    }

    pub fn did(&self) -> Did {
        self.identity.did()
    }

    /// Explicit sync of `owner`, expecting a completed pass.
    pub async fn sync(&self, owner: &Did) -> SyncReport {
        match self.engine.sync_once(owner).await.unwrap() {
            SyncOutcome::Completed(report) => report,
            other => panic!("expected a completed pass, got {:?}", other),
        }
    }

    pub async fn sync_self(&self) -> SyncReport {
        self.sync(&self.did()).await
    }

    pub fn record(&self, owner: &Did, id: &RecordId) -> Option<Record> {
        self.engine.get_record(owner, id).unwrap()
    }

    /// Every stored record of `owner`, hidden ones included
    pub fn all_records(&self, owner: &Did) -> Vec<Record> {
        self.engine.storage().list_by_owner(owner).unwrap()
    }
}

pub fn identity() -> Arc<LocalIdentity> {
    Arc::new(LocalIdentity::generate())
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
