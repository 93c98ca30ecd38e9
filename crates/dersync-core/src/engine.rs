//! SyncEngine - pull, merge and push of sealed records
//!
//! One pass for one owner runs three strictly ordered phases across the
//! tracked collections:
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────────────┐   ┌──────────────┐
//! │ 1. Pull      │──▶│ 2. Detect remote deletion │──▶│ 3. Push      │
//! │ fetch, open, │   │ synced, clean records the │   │ seal pending │
//! │ decode,      │   │ server no longer returns  │   │ records, one │
//! │ reconcile    │   │ are removed locally       │   │ batch        │
//! └──────────────┘   └───────────────────────────┘   └──────────────┘
//! ```
//!
//! The server-assigned `version` is the only ordering authority. An
//! envelope replaces a local record only when its version is strictly
//! greater, which also makes a device ignore echoes of its own pushes.
//! A pending record is never overwritten: a newer remote version only moves
//! its base version forward, unless the remote content is the pending edit
//! itself (a push whose answer was lost), which settles it.
//!
//! # Example
//!
//! ```ignore
//! use dersync_core::{SyncEngine, SyncContext, Storage, TaskFields, Collection};
//!
//! let engine = SyncEngine::new(storage, remote, ctx, vec![Collection::tasks()]);
//! let record = engine.create_record(Collection::tasks(), TaskFields::titled("Plant garden"))?;
//! engine.sync_once(&engine.did()).await?;
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{self, RecordPayload, Recovery};
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::identity::Did;
use crate::storage::Storage;
use crate::sync::envelope::{detect, SealedEnvelope, WireEnvelope};
use crate::sync::events::{SyncEvent, SyncOutcome, SyncPhase, SyncReport, SyncStatus};
use crate::sync::manifest::{DelegationManifest, ManifestBook};
use crate::sync::notifier::{subject_tag, Notifier, SubscriptionHandle, TrackedSubjects};
use crate::sync::remote::{Delegation, DelegationScope, RejectReason, RemoteStore};
use crate::types::{now_millis, Collection, Permission, Record, RecordId, TaskFields};

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct OwnerSlot {
    rerun: bool,
}

/// Clears an owner's in-flight slot if the pass future is dropped early.
struct PassGuard<'a> {
    in_flight: &'a Mutex<HashMap<Did, OwnerSlot>>,
    owner: Did,
    armed: bool,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.in_flight.lock().remove(&self.owner);
        }
    }
}

/// Main entry point for record replication.
///
/// Shareable across tasks behind an `Arc`; passes for different owners run
/// concurrently, passes for the same owner never do.
pub struct SyncEngine {
    storage: Storage,
    remote: Arc<dyn RemoteStore>,
    ctx: SyncContext,
    collections: Vec<Collection>,
    manifests: ManifestBook,
    notifier: Option<Arc<Notifier>>,
    tracked: TrackedSubjects,
    in_flight: Mutex<HashMap<Did, OwnerSlot>>,
    /// Serializes manifest stamping
    manifest_stamp: Mutex<()>,
    status: RwLock<HashMap<Did, SyncStatus>>,
    event_tx: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    pub fn new(
        storage: Storage,
        remote: Arc<dyn RemoteStore>,
        ctx: SyncContext,
        collections: Vec<Collection>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let manifests = ManifestBook::new(storage.clone(), ctx.did());
        let tracked = TrackedSubjects::new();
        for collection in &collections {
            tracked.track(&ctx.did(), collection);
        }
        info!(
            did = %ctx.did().short(),
            device = %ctx.device_id,
            collections = collections.len(),
            "SyncEngine created"
        );
        Self {
            storage,
            remote,
            ctx,
            collections,
            manifests,
            notifier: None,
            tracked,
            in_flight: Mutex::new(HashMap::new()),
            manifest_stamp: Mutex::new(()),
            status: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    /// Send notices after pushes and manifests after grant changes.
    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn did(&self) -> Did {
        self.ctx.did()
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn collections(&self) -> &[Collection] {
        &self.collections
    }

    pub fn manifests(&self) -> &ManifestBook {
        &self.manifests
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    /// Status of the last pass for `owner` (Idle if none ran)
    pub fn status(&self, owner: &Did) -> SyncStatus {
        self.status.read().get(owner).cloned().unwrap_or_default()
    }

    /// Ourselves, every owner with records stored locally, and every owner
    /// whose manifest lists something for us.
    pub fn tracked_owners(&self) -> SyncResult<Vec<Did>> {
        let mut owners: BTreeSet<Did> = BTreeSet::new();
        owners.insert(self.did());
        owners.extend(self.storage.list_owners()?);
        owners.extend(self.manifests.owners()?);
        for owner in &owners {
            self.track_owner(owner);
        }
        Ok(owners.into_iter().collect())
    }

    /// Accept notices about `owner`'s collections from now on.
    pub fn track_owner(&self, owner: &Did) {
        for collection in &self.collections {
            self.tracked.track(owner, collection);
        }
    }

    fn emit_event(&self, event: SyncEvent) {
        // No receivers is fine
        let _ = self.event_tx.send(event);
    }

    fn set_status(&self, owner: &Did, status: SyncStatus) {
        self.status.write().insert(owner.clone(), status.clone());
        self.emit_event(SyncEvent::StatusChanged {
            owner: owner.clone(),
            status,
        });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Local mutations
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a record we own. It stays pending until the next push.
    pub fn create_record(&self, collection: Collection, mut fields: TaskFields) -> SyncResult<Record> {
        let now = now_millis();
        if fields.created_at == 0 {
            fields.created_at = now;
        }
        fields.updated_at = now;
        fields.deleted = false;

        let record = Record::new(self.did(), collection, fields);
        self.storage.put(&record)?;
        info!(record_id = %record.record_id, collection = %record.collection, "Created record");
        Ok(record)
    }

    /// Apply `edit` to a record's fields and mark it pending.
    ///
    /// `created_at` survives whatever `edit` does; `updated_at` is re-stamped.
    pub fn update_record<F>(&self, owner: &Did, record_id: &RecordId, edit: F) -> SyncResult<Record>
    where
        F: FnOnce(&mut TaskFields),
    {
        let mut record = self.require_record(owner, record_id)?;
        self.check_writable(&record)?;

        let created_at = record.fields.created_at;
        edit(&mut record.fields);
        record.fields.created_at = created_at;
        record.fields.updated_at = now_millis().max(record.fields.updated_at);
        record.pending = true;

        self.storage.put(&record)?;
        debug!(record_id = %record_id, owner = %owner.short(), "Updated record");
        Ok(record)
    }

    /// Set the soft-delete flag. The record is hard-deleted locally only
    /// after the remote store has accepted the deletion.
    pub fn soft_delete(&self, owner: &Did, record_id: &RecordId) -> SyncResult<Record> {
        self.update_record(owner, record_id, |fields| fields.deleted = true)
    }

    pub fn get_record(&self, owner: &Did, record_id: &RecordId) -> SyncResult<Option<Record>> {
        self.storage.get(owner, record_id)
    }

    /// Visible (not soft-deleted) records of `owner` in `collection`
    pub fn list_records(&self, owner: &Did, collection: &Collection) -> SyncResult<Vec<Record>> {
        Ok(self
            .storage
            .list_by_owner(owner)?
            .into_iter()
            .filter(|r| &r.collection == collection && r.is_visible())
            .collect())
    }

    /// Grant `delegate` access to one of our records.
    ///
    /// The remote delegation is registered first; the record is then
    /// marked pending so the next push seals a copy for the delegate.
    pub async fn grant(
        &self,
        record_id: &RecordId,
        delegate: &Did,
        permission: Permission,
    ) -> SyncResult<Record> {
        let me = self.did();
        if delegate == &me {
            return Err(SyncError::InvalidOperation("cannot delegate to yourself".into()));
        }
        let mut record = self.require_record(&me, record_id)?;

        let scope = DelegationScope::Record {
            owner: me.clone(),
            record_id: record_id.clone(),
        };
        self.remote.grant_delegate(&scope, delegate, permission).await?;

        record.grants.grant(delegate.clone(), permission);
        record.pending = true;
        self.storage.put(&record)?;
        info!(record_id = %record_id, delegate = %delegate.short(), %permission, "Granted delegate");

        self.publish_manifest(delegate).await;
        Ok(record)
    }

    /// Withdraw a delegate's access to one of our records.
    pub async fn revoke(&self, record_id: &RecordId, delegate: &Did) -> SyncResult<Record> {
        let me = self.did();
        let mut record = self.require_record(&me, record_id)?;

        let scope = DelegationScope::Record {
            owner: me.clone(),
            record_id: record_id.clone(),
        };
        self.remote.revoke_delegate(&scope, delegate).await?;

        if record.grants.revoke(delegate) {
            record.pending = true;
            self.storage.put(&record)?;
        }
        info!(record_id = %record_id, delegate = %delegate.short(), "Revoked delegate");

        self.publish_manifest(delegate).await;
        Ok(record)
    }

    /// Delegations we issued, as the remote store knows them
    pub async fn delegations(&self) -> SyncResult<Vec<Delegation>> {
        self.remote.list_delegations(&self.did()).await
    }

    /// Republish the full manifest for `delegate`. Best effort.
    ///
    /// Each manifest for a delegate is stamped strictly later than the last
    /// one issued, so back-to-back grant changes are never taken as replays.
    pub async fn publish_manifest(&self, delegate: &Did) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let manifest = match self.issue_manifest(delegate) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(delegate = %delegate.short(), error = %e, "Failed to issue manifest");
                return;
            }
        };
        if let Err(e) = notifier.publish_manifest(&manifest).await {
            warn!(delegate = %delegate.short(), error = %e, "Failed to publish manifest");
        }
    }

    fn issue_manifest(&self, delegate: &Did) -> SyncResult<DelegationManifest> {
        let _stamp = self.manifest_stamp.lock();
        let me = self.did();
        let previous = self.storage.load_manifest(&me, delegate)?;
        let records = self.storage.list_by_owner(&me)?;
        let manifest =
            DelegationManifest::from_records(&me, delegate, &records).issued_after(previous.as_ref());
        self.storage.save_manifest(&manifest)?;
        Ok(manifest)
    }

    fn require_record(&self, owner: &Did, record_id: &RecordId) -> SyncResult<Record> {
        self.storage
            .get(owner, record_id)?
            .ok_or_else(|| SyncError::RecordNotFound(record_id.to_string()))
    }

    /// Delegates may only edit what they hold a write grant for.
    fn check_writable(&self, record: &Record) -> SyncResult<()> {
        let me = self.did();
        if record.owner == me || record.grants.permission_of(&me) == Some(Permission::Write) {
            Ok(())
        } else {
            Err(SyncError::PermissionDenied(format!(
                "{} is read-only for {}",
                record.record_id,
                me.short()
            )))
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync passes
    // ═══════════════════════════════════════════════════════════════════════

    /// Explicit sync: every error is surfaced to the caller.
    pub async fn sync_once(&self, owner: &Did) -> SyncResult<SyncOutcome> {
        self.run_guarded(owner).await
    }

    /// Background sync: transient errors are logged and reported as
    /// [`SyncOutcome::Deferred`].
    pub async fn trigger(&self, owner: &Did) -> SyncResult<SyncOutcome> {
        match self.run_guarded(owner).await {
            Err(e) if e.is_transient() => {
                warn!(owner = %owner.short(), error = %e, "Background pass deferred");
                Ok(SyncOutcome::Deferred(e.to_string()))
            }
            other => other,
        }
    }

    /// Trigger every tracked owner in turn.
    pub async fn trigger_all(&self) -> SyncResult<Vec<(Did, SyncOutcome)>> {
        let mut outcomes = Vec::new();
        for owner in self.tracked_owners()? {
            let outcome = self.trigger(&owner).await?;
            outcomes.push((owner, outcome));
        }
        Ok(outcomes)
    }

    async fn run_guarded(&self, owner: &Did) -> SyncResult<SyncOutcome> {
        self.track_owner(owner);
        {
            let mut in_flight = self.in_flight.lock();
            if let Some(slot) = in_flight.get_mut(owner) {
                slot.rerun = true;
                debug!(owner = %owner.short(), "Pass already running, coalesced");
                return Ok(SyncOutcome::Coalesced);
            }
            in_flight.insert(owner.clone(), OwnerSlot::default());
        }
        let mut guard = PassGuard {
            in_flight: &self.in_flight,
            owner: owner.clone(),
            armed: true,
        };

        self.set_status(owner, SyncStatus::Syncing);
        let mut total = SyncReport::default();
        loop {
            match self.run_pass(owner).await {
                Ok(report) => total.absorb(report),
                Err(e) => {
                    self.set_status(owner, SyncStatus::Error(e.to_string()));
                    self.emit_event(SyncEvent::PassFailed {
                        owner: owner.clone(),
                        error: e.to_string(),
                    });
                    return Err(e);
                }
            }
            if !self.take_rerun(&mut guard) {
                break;
            }
            debug!(owner = %owner.short(), "Running coalesced pass");
        }

        self.set_status(owner, SyncStatus::Idle);
        self.emit_event(SyncEvent::PassCompleted {
            owner: owner.clone(),
            report: total.clone(),
        });
        Ok(SyncOutcome::Completed(total))
    }

    /// Either consume a pending rerun request or release the slot, atomically.
    fn take_rerun(&self, guard: &mut PassGuard<'_>) -> bool {
        let mut in_flight = self.in_flight.lock();
        match in_flight.get_mut(&guard.owner) {
            Some(slot) if slot.rerun => {
                slot.rerun = false;
                true
            }
            _ => {
                in_flight.remove(&guard.owner);
                guard.armed = false;
                false
            }
        }
    }

    /// One full pass for `owner`.
    ///
    /// A fetch or push that cannot reach the remote store aborts the pass;
    /// per-record problems are recorded in the report and skipped.
    async fn run_pass(&self, owner: &Did) -> SyncResult<SyncReport> {
        let mut report = SyncReport::default();

        // Phase 1: pull
        let mut fetched: HashMap<Collection, HashSet<RecordId>> = HashMap::new();
        for collection in &self.collections {
            let raws = self.remote.fetch(owner, collection, None).await?;
            let mut seen = HashSet::new();
            for raw in raws {
                let raw_id = raw.record_id.clone().map(RecordId::from_string);
                if let Some(id) = &raw_id {
                    seen.insert(id.clone());
                }
                let envelope = match detect(raw, owner, collection) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(owner = %owner.short(), error = %e, "Skipping unrecognized envelope");
                        report.fail(raw_id, SyncPhase::Pull, e);
                        continue;
                    }
                };
                let record_id = envelope.record_id().clone();
                if let Err(e) = self.pull_one(owner, envelope, &mut report) {
                    warn!(record_id = %record_id, error = %e, "Failed to pull record");
                    report.fail(Some(record_id), SyncPhase::Pull, e);
                }
            }
            fetched.insert(collection.clone(), seen);
        }

        // Phase 2: records the server no longer has
        for record in self.storage.list_by_owner(owner)? {
            let Some(seen) = fetched.get(&record.collection) else {
                continue;
            };
            if record.was_synced() && !record.pending && !seen.contains(&record.record_id) {
                match self.storage.delete(owner, &record.record_id) {
                    Ok(_) => {
                        debug!(record_id = %record.record_id, "Removed record deleted upstream");
                        report.removed += 1;
                    }
                    Err(e) => report.fail(Some(record.record_id), SyncPhase::RemoteDeletion, e),
                }
            }
        }

        // Phase 3: push
        self.push_pending(owner, &mut report).await?;

        info!(owner = %owner.short(), %report, "Sync pass complete");
        Ok(report)
    }

    fn pull_one(&self, owner: &Did, envelope: WireEnvelope, report: &mut SyncReport) -> SyncResult<()> {
        if envelope.owner() != owner {
            return Err(SyncError::RemoteProtocol(format!(
                "envelope owned by {} in listing for {}",
                envelope.owner().short(),
                owner.short()
            )));
        }

        let record_id = envelope.record_id().clone();
        let remote_version = envelope.version();
        let holders = match &envelope {
            WireEnvelope::Versioned(env) => env.payload_holders(),
            _ => BTreeSet::new(),
        };
        let local = self.storage.get(owner, &record_id)?;

        if let Some(local) = &local {
            if remote_version <= local.version {
                // Already reconciled (or our own echo)
                if !local.pending && self.needs_reseal(local, &holders) {
                    let mut local = local.clone();
                    local.pending = true;
                    self.storage.put(&local)?;
                    report.resealed += 1;
                }
                return Ok(());
            }
        }

        let format = envelope.format_name();
        let opened = envelope.open(self.ctx.identity.as_ref())?;
        let decoded = codec::decode_tolerant(&opened.plaintext);
        if decoded.recovery != Recovery::Clean {
            report.recovered += 1;
        }
        let tombstone = decoded.payload.task.deleted && decoded.recovery != Recovery::Placeholder;
        let grants = if decoded.payload.delegates.is_empty() {
            opened.clear_grants.unwrap_or_default()
        } else {
            decoded.payload.delegates
        };

        let mut record = Record {
            record_id: record_id.clone(),
            owner: owner.clone(),
            collection: opened.collection,
            fields: decoded.payload.task,
            grants,
            version: remote_version,
            pending: false,
        };

        match local {
            None if tombstone => {
                debug!(record_id = %record_id, "Not importing remote tombstone");
            }
            None => {
                if self.needs_reseal(&record, &holders) {
                    record.pending = true;
                    report.resealed += 1;
                }
                self.storage.put(&record)?;
                debug!(record_id = %record_id, version = remote_version, %format, "Pulled new record");
                report.pulled += 1;
            }
            Some(local) if local.pending => {
                if record.fields == local.fields && record.grants == local.grants {
                    // Our own push, committed without an answer reaching us
                    if tombstone {
                        self.storage.delete(owner, &record_id)?;
                        debug!(record_id = %record_id, version = remote_version, "Hard-deleted after late acknowledgement");
                        report.hard_deleted += 1;
                    } else {
                        record.pending = self.needs_reseal(&record, &holders);
                        if record.pending {
                            report.resealed += 1;
                        }
                        self.storage.put(&record)?;
                        debug!(record_id = %record_id, version = remote_version, "Pending edit acknowledged by pull");
                    }
                } else {
                    // Unpushed edit: keep it, rebase onto the newer version, push it next
                    let mut kept = local;
                    kept.version = remote_version;
                    self.storage.put(&kept)?;
                    info!(
                        record_id = %record_id,
                        remote = remote_version,
                        "Kept pending local edit over newer remote version"
                    );
                }
            }
            Some(local) if tombstone => {
                self.storage.delete(owner, &record_id)?;
                debug!(record_id = %record_id, from = local.version, to = remote_version, "Removed record tombstoned upstream");
                report.removed += 1;
            }
            Some(local) => {
                if self.needs_reseal(&record, &holders) {
                    record.pending = true;
                    report.resealed += 1;
                }
                self.storage.put(&record)?;
                debug!(record_id = %record_id, from = local.version, to = remote_version, %format, "Updated record");
                report.updated += 1;
            }
        }
        Ok(())
    }

    /// We own the record and a granted delegate has no sealed copy.
    fn needs_reseal(&self, record: &Record, holders: &BTreeSet<Did>) -> bool {
        record.owner == self.did()
            && record
                .grants
                .recipients()
                .iter()
                .any(|delegate| !holders.contains(delegate))
    }

    async fn push_pending(&self, owner: &Did, report: &mut SyncReport) -> SyncResult<()> {
        let pending = self.storage.list_pending(owner)?;
        if pending.is_empty() {
            return Ok(());
        }

        let mut envelopes = Vec::with_capacity(pending.len());
        let mut sent: HashMap<RecordId, Record> = HashMap::new();
        for record in pending {
            let payload = RecordPayload::new(record.fields.clone(), record.grants.clone());
            let sealed = codec::encode(&payload).and_then(|plaintext| {
                SealedEnvelope::seal(self.ctx.identity.as_ref(), &record, &plaintext)
            });
            match sealed {
                Ok(envelope) => {
                    envelopes.push(envelope);
                    sent.insert(record.record_id.clone(), record);
                }
                Err(e) => {
                    warn!(record_id = %record.record_id, error = %e, "Failed to seal record");
                    report.fail(Some(record.record_id), SyncPhase::Push, e);
                }
            }
        }
        if envelopes.is_empty() {
            return Ok(());
        }

        debug!(owner = %owner.short(), count = envelopes.len(), "Pushing batch");
        let outcome = self.remote.push(envelopes).await?;

        let mut notify: BTreeSet<(Did, String)> = BTreeSet::new();
        for accepted in outcome.accepted {
            let Some(pushed) = sent.remove(&accepted.record_id) else {
                warn!(record_id = %accepted.record_id, "Server accepted a record we did not send");
                continue;
            };
            // Re-read: a local edit may have landed while the push was in flight
            let Some(mut current) = self.storage.get(owner, &accepted.record_id)? else {
                continue;
            };
            current.version = current.version.max(accepted.version);
            let unchanged = current.fields == pushed.fields && current.grants == pushed.grants;
            report.pushed += 1;

            let subject = subject_tag(owner, &current.collection);
            notify.insert((owner.clone(), subject.clone()));
            for delegate in current.grants.recipients().into_iter().chain(pushed.grants.recipients()) {
                notify.insert((delegate, subject.clone()));
            }

            if unchanged && current.fields.deleted {
                self.storage.delete(owner, &accepted.record_id)?;
                debug!(record_id = %accepted.record_id, version = accepted.version, "Hard-deleted after confirmed push");
                report.hard_deleted += 1;
                continue;
            }
            if unchanged {
                current.pending = false;
            }
            self.storage.put(&current)?;
            debug!(record_id = %accepted.record_id, version = accepted.version, "Push accepted");
        }

        for rejected in outcome.rejected {
            match rejected.reason {
                RejectReason::PermissionDenied => {
                    warn!(record_id = %rejected.record_id, "Push rejected: no write permission");
                    report.permission_denied.push(rejected.record_id);
                }
                RejectReason::Invalid(reason) => {
                    warn!(record_id = %rejected.record_id, %reason, "Push rejected");
                    report.fail(Some(rejected.record_id), SyncPhase::Push, reason);
                }
            }
        }

        if let Some(notifier) = &self.notifier {
            for (recipient, subject) in notify {
                if let Err(e) = notifier.publish(&recipient, &subject).await {
                    warn!(recipient = %recipient.short(), error = %e, "Failed to send notice");
                }
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Background wiring
    // ═══════════════════════════════════════════════════════════════════════

    /// Sync on incoming notices and manifest changes.
    ///
    /// Dropping the handles stops listening.
    pub async fn listen(self: &Arc<Self>) -> SyncResult<Vec<SubscriptionHandle>> {
        let Some(notifier) = self.notifier.clone() else {
            return Err(SyncError::InvalidOperation("engine has no notifier".into()));
        };
        self.tracked_owners()?;

        let engine = Arc::clone(self);
        let notices = notifier
            .subscribe(self.tracked.clone(), |_| true, move |event| {
                let engine = engine.clone();
                async move {
                    debug!(owner = %event.owner.short(), from = %event.notice.sender.short(), "Notice triggered sync");
                    if let Err(e) = engine.trigger(&event.owner).await {
                        warn!(owner = %event.owner.short(), error = %e, "Notice-triggered pass failed");
                    }
                }
            })
            .await?;

        let engine = Arc::clone(self);
        let manifests = notifier
            .subscribe_manifests(self.manifests.clone(), move |owner, diff| {
                let engine = engine.clone();
                async move {
                    engine.track_owner(&owner);
                    info!(
                        owner = %owner.short(),
                        granted = diff.granted.len(),
                        revoked = diff.revoked.len(),
                        "Delegation manifest changed"
                    );
                    if let Err(e) = engine.trigger(&owner).await {
                        warn!(owner = %owner.short(), error = %e, "Manifest-triggered pass failed");
                    }
                }
            })
            .await?;

        Ok(vec![notices, manifests])
    }

    /// Trigger every tracked owner on a fixed interval.
    pub fn start_periodic_sync(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.trigger_all().await {
                    warn!(error = %e, "Periodic sync failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityProvider, LocalIdentity};
    use crate::sync::envelope::RawEnvelope;
    use crate::sync::remote::MemoryRemoteServer;

    struct Device {
        engine: SyncEngine,
    }

    fn device(server: &MemoryRemoteServer, identity: Arc<LocalIdentity>) -> Device {
        let remote = Arc::new(server.client(identity.did()));
        let ctx = SyncContext::with_random_device(identity);
        Device {
            engine: SyncEngine::new(
                Storage::in_memory().unwrap(),
                remote,
                ctx,
                vec![Collection::tasks()],
            ),
        }
    }

    fn completed(outcome: SyncOutcome) -> SyncReport {
        match outcome {
            SyncOutcome::Completed(report) => report,
            other => panic!("expected a completed pass, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_and_push() {
        let server = MemoryRemoteServer::new();
        let alice = Arc::new(LocalIdentity::generate());
        let d = device(&server, alice.clone());

        let record = d
            .engine
            .create_record(Collection::tasks(), TaskFields::titled("Plant garden"))
            .unwrap();
        assert!(record.pending);
        assert_eq!(record.version, 0);

        let report = completed(d.engine.sync_once(&alice.did()).await.unwrap());
        assert_eq!(report.pushed, 1);

        let stored = d.engine.get_record(&alice.did(), &record.record_id).unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert!(!stored.pending);
        assert_eq!(server.version_of(&alice.did(), &record.record_id), Some(1));
    }

    #[tokio::test]
    async fn test_update_keeps_created_at() {
        let server = MemoryRemoteServer::new();
        let alice = Arc::new(LocalIdentity::generate());
        let d = device(&server, alice.clone());

        let record = d
            .engine
            .create_record(Collection::tasks(), TaskFields::titled("Draft"))
            .unwrap();
        let created_at = record.fields.created_at;

        let updated = d
            .engine
            .update_record(&alice.did(), &record.record_id, |f| {
                f.title = "Final".into();
                f.created_at = 0;
            })
            .unwrap();
        assert_eq!(updated.fields.title, "Final");
        assert_eq!(updated.fields.created_at, created_at);
        assert!(updated.fields.updated_at >= created_at);
        assert!(updated.pending);
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let server = MemoryRemoteServer::new();
        let alice = Arc::new(LocalIdentity::generate());
        let d = device(&server, alice.clone());

        let result = d
            .engine
            .update_record(&alice.did(), &RecordId::from_string("nope"), |_| {});
        assert!(matches!(result, Err(SyncError::RecordNotFound(_))));
    }

    #[tokio::test]
    async fn test_soft_delete_hard_deletes_after_push() {
        let server = MemoryRemoteServer::new();
        let alice = Arc::new(LocalIdentity::generate());
        let d = device(&server, alice.clone());
        let me = alice.did();

        let record = d
            .engine
            .create_record(Collection::tasks(), TaskFields::titled("Temp"))
            .unwrap();
        d.engine.sync_once(&me).await.unwrap();

        d.engine.soft_delete(&me, &record.record_id).unwrap();
        // Hidden but still stored
        assert!(d.engine.list_records(&me, &Collection::tasks()).unwrap().is_empty());
        assert!(d.engine.get_record(&me, &record.record_id).unwrap().is_some());

        server.set_available(false);
        assert!(d.engine.sync_once(&me).await.is_err());
        assert!(d.engine.get_record(&me, &record.record_id).unwrap().is_some());

        server.set_available(true);
        let report = completed(d.engine.sync_once(&me).await.unwrap());
        assert_eq!(report.hard_deleted, 1);
        assert!(d.engine.get_record(&me, &record.record_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_trigger_defers_transient_errors() {
        let server = MemoryRemoteServer::new();
        let alice = Arc::new(LocalIdentity::generate());
        let d = device(&server, alice.clone());
        server.set_available(false);

        let outcome = d.engine.trigger(&alice.did()).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Deferred(_)));
        assert!(matches!(d.engine.status(&alice.did()), SyncStatus::Error(_)));

        let explicit = d.engine.sync_once(&alice.did()).await;
        assert!(matches!(explicit, Err(SyncError::RemoteUnavailable(_))));
    }

    #[tokio::test]
    async fn test_grant_requires_ownership() {
        let server = MemoryRemoteServer::new();
        let alice = Arc::new(LocalIdentity::generate());
        let bob = LocalIdentity::generate().did();
        let d = device(&server, alice.clone());

        let result = d
            .engine
            .grant(&RecordId::from_string("missing"), &bob, Permission::Read)
            .await;
        assert!(matches!(result, Err(SyncError::RecordNotFound(_))));

        let record = d
            .engine
            .create_record(Collection::tasks(), TaskFields::titled("Shared"))
            .unwrap();
        let self_grant = d
            .engine
            .grant(&record.record_id, &alice.did(), Permission::Read)
            .await;
        assert!(matches!(self_grant, Err(SyncError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn test_echo_is_ignored() {
        let server = MemoryRemoteServer::new();
        let alice = Arc::new(LocalIdentity::generate());
        let d = device(&server, alice.clone());
        let me = alice.did();

        d.engine
            .create_record(Collection::tasks(), TaskFields::titled("Once"))
            .unwrap();
        d.engine.sync_once(&me).await.unwrap();

        // Second pass sees its own push at the same version
        let report = completed(d.engine.sync_once(&me).await.unwrap());
        assert_eq!(report, SyncReport::default());
    }

    #[tokio::test]
    async fn test_unrecognized_envelope_is_kept_out_of_deletion() {
        let server = MemoryRemoteServer::new();
        let alice = Arc::new(LocalIdentity::generate());
        let d = device(&server, alice.clone());
        let me = alice.did();

        let record = d
            .engine
            .create_record(Collection::tasks(), TaskFields::titled("Keep"))
            .unwrap();
        d.engine.sync_once(&me).await.unwrap();

        // Another client overwrote it with something unreadable
        server
            .insert_raw(
                &me,
                &Collection::tasks(),
                RawEnvelope {
                    record_id: Some(record.record_id.to_string()),
                    encrypted_data: Some("not json, not base64 either!".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        let report = completed(d.engine.sync_once(&me).await.unwrap());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.removed, 0);
        assert!(d.engine.get_record(&me, &record.record_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let server = MemoryRemoteServer::new();
        let alice = Arc::new(LocalIdentity::generate());
        let d = device(&server, alice.clone());
        let mut events = d.engine.subscribe_events();

        d.engine.sync_once(&alice.did()).await.unwrap();

        let mut saw_completed = false;
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.owner(), &alice.did());
            if matches!(event, SyncEvent::PassCompleted { .. }) {
                saw_completed = true;
            }
        }
        assert!(saw_completed);
        assert_eq!(d.engine.status(&alice.did()), SyncStatus::Idle);
    }
}
