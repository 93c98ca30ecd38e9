//! Delegation notifier
//!
//! Notices tell another device "something you track changed, sync now".
//! They carry no record content: only who sent them, to whom, from which
//! installation, an opaque subject tag and a signature.
//!
//! ```text
//! owner device A ── push ──▶ remote store
//!        │
//!        └── Notice{recipient: B, subject: tag(owner, tasks)} ──▶ medium ──▶ device B
//!                                                                              │
//!                                                        verify, filter, trigger sync
//! ```
//!
//! Manifests travel the same medium as replaceable events, sealed to the
//! delegate so the medium never learns which records are shared.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::manifest::{DelegationManifest, ManifestBook, ManifestDiff};
use super::medium::{BroadcastEvent, BroadcastMedium, EventFilter};
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::identity::{Did, IdentityProvider};
use crate::seal;
use crate::types::{now_millis, Collection, DeviceId};

pub const NOTICE_KIND: &str = "dersync/notice";
pub const MANIFEST_KIND: &str = "dersync/manifest";

const TAG_RECIPIENT: &str = "p";
const TAG_SUBJECT: &str = "s";

/// Opaque routing tag for (owner, collection).
pub fn subject_tag(owner: &Did, collection: &Collection) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(owner.as_str().as_bytes());
    hasher.update(&[0]);
    hasher.update(collection.as_str().as_bytes());
    hex::encode(&hasher.finalize().as_bytes()[..16])
}

/// The (owner, collection) pairs a device wants notices about, by subject tag.
///
/// Cloning shares the set, so a running subscription sees later additions.
#[derive(Clone, Default)]
pub struct TrackedSubjects {
    inner: Arc<RwLock<HashMap<String, (Did, Collection)>>>,
}

impl TrackedSubjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, owner: &Did, collection: &Collection) {
        self.inner
            .write()
            .entry(subject_tag(owner, collection))
            .or_insert_with(|| (owner.clone(), collection.clone()));
    }

    pub fn resolve(&self, subject: &str) -> Option<(Did, Collection)> {
        self.inner.read().get(subject).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// Signed change signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub sender: Did,
    pub recipient: Did,
    pub device_id: DeviceId,
    pub subject: String,
    pub timestamp: i64,
    pub signature: Vec<u8>,
}

impl Notice {
    fn signing_bytes(
        sender: &Did,
        recipient: &Did,
        device_id: &DeviceId,
        subject: &str,
        timestamp: i64,
    ) -> Vec<u8> {
        format!(
            "dersync-notice-v1\n{}\n{}\n{}\n{}\n{}",
            sender,
            recipient,
            device_id.to_hex(),
            subject,
            timestamp
        )
        .into_bytes()
    }

    pub fn signed(ctx: &SyncContext, recipient: &Did, subject: &str) -> Self {
        let sender = ctx.did();
        let timestamp = now_millis();
        let bytes = Self::signing_bytes(&sender, recipient, &ctx.device_id, subject, timestamp);
        Self {
            signature: ctx.identity.sign(&bytes),
            sender,
            recipient: recipient.clone(),
            device_id: ctx.device_id,
            subject: subject.to_string(),
            timestamp,
        }
    }

    pub fn verify(&self) -> bool {
        let bytes = Self::signing_bytes(
            &self.sender,
            &self.recipient,
            &self.device_id,
            &self.subject,
            self.timestamp,
        );
        self.sender.verify(&bytes, &self.signature)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    /// Dropped: the same notice went out less than the minimum interval ago
    Throttled,
}

/// A notice that passed every filter, resolved to what it is about
#[derive(Debug, Clone)]
pub struct NoticeEvent {
    pub notice: Notice,
    pub owner: Did,
    pub collection: Collection,
}

#[derive(Serialize, Deserialize)]
struct SealedManifest {
    owner: Did,
    ciphertext: Vec<u8>,
}

/// Aborts the background task when dropped.
pub struct SubscriptionHandle {
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct Notifier {
    ctx: SyncContext,
    medium: Arc<dyn BroadcastMedium>,
    min_interval: Duration,
    last_sent: Mutex<HashMap<(Did, String), Instant>>,
}

impl Notifier {
    pub fn new(ctx: SyncContext, medium: Arc<dyn BroadcastMedium>, min_interval: Duration) -> Self {
        Self {
            ctx,
            medium,
            min_interval,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Signal `recipient` that `subject` changed.
    pub async fn publish(&self, recipient: &Did, subject: &str) -> SyncResult<PublishOutcome> {
        let key = (recipient.clone(), subject.to_string());
        {
            let mut last_sent = self.last_sent.lock();
            let now = Instant::now();
            if let Some(prev) = last_sent.get(&key) {
                if now.duration_since(*prev) < self.min_interval {
                    debug!(recipient = %recipient.short(), %subject, "Notice throttled");
                    return Ok(PublishOutcome::Throttled);
                }
            }
            last_sent.insert(key, now);
        }

        let notice = Notice::signed(&self.ctx, recipient, subject);
        let payload =
            postcard::to_allocvec(&notice).map_err(|e| SyncError::Serialization(e.to_string()))?;
        let event = BroadcastEvent::new(NOTICE_KIND, payload)
            .with_tag(TAG_RECIPIENT, recipient.as_str())
            .with_tag(TAG_SUBJECT, subject);

        self.medium.publish(event).await?;
        debug!(recipient = %recipient.short(), %subject, "Notice sent");
        Ok(PublishOutcome::Sent)
    }

    /// Listen for notices about subjects in `tracked`.
    ///
    /// Notices not addressed to us, sent from this device, about untracked
    /// subjects, with bad signatures or rejected by `predicate` are
    /// dropped. The rest are handed to `callback` one at a time. Subjects
    /// tracked after this call are honoured.
    pub async fn subscribe<P, F, Fut>(
        &self,
        tracked: TrackedSubjects,
        predicate: P,
        callback: F,
    ) -> SyncResult<SubscriptionHandle>
    where
        P: Fn(&Notice) -> bool + Send + Sync + 'static,
        F: Fn(NoticeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let me = self.ctx.did();
        let my_device = self.ctx.device_id;

        let mut rx = self
            .medium
            .subscribe(EventFilter::kind(NOTICE_KIND).with_tag(TAG_RECIPIENT, me.as_str()))
            .await?;

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let notice: Notice = match postcard::from_bytes(&event.payload) {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "Dropping undecodable notice");
                        continue;
                    }
                };
                if notice.recipient != me || notice.device_id == my_device {
                    continue;
                }
                let Some((owner, collection)) = tracked.resolve(&notice.subject) else {
                    continue;
                };
                if !notice.verify() {
                    warn!(sender = %notice.sender.short(), "Dropping notice with bad signature");
                    continue;
                }
                if !predicate(&notice) {
                    continue;
                }
                debug!(sender = %notice.sender.short(), owner = %owner.short(), %collection, "Notice accepted");
                callback(NoticeEvent {
                    notice,
                    owner,
                    collection,
                })
                .await;
            }
        });

        Ok(SubscriptionHandle { task })
    }

    /// Seal `manifest` to its delegate and publish it as a replaceable event.
    pub async fn publish_manifest(&self, manifest: &DelegationManifest) -> SyncResult<()> {
        if manifest.owner != self.ctx.did() {
            return Err(SyncError::InvalidOperation(
                "only the owner publishes a manifest".into(),
            ));
        }
        let plaintext =
            serde_json::to_vec(manifest).map_err(|e| SyncError::Serialization(e.to_string()))?;
        let ciphertext = seal::seal_to(self.ctx.identity.as_ref(), &plaintext, &manifest.delegate)?;
        let payload = postcard::to_allocvec(&SealedManifest {
            owner: manifest.owner.clone(),
            ciphertext,
        })
        .map_err(|e| SyncError::Serialization(e.to_string()))?;

        let mut event = BroadcastEvent::new(MANIFEST_KIND, payload)
            .with_tag(TAG_RECIPIENT, manifest.delegate.as_str())
            .replaceable(format!("{}/{}", manifest.owner, manifest.delegate));
        event.created_at = manifest.issued_at;

        self.medium.publish(event).await?;
        info!(
            delegate = %manifest.delegate.short(),
            entries = manifest.entries.len(),
            "Published delegation manifest"
        );
        Ok(())
    }

    /// Apply incoming manifests to `book`; non-empty diffs go to `callback`.
    pub async fn subscribe_manifests<F, Fut>(
        &self,
        book: ManifestBook,
        callback: F,
    ) -> SyncResult<SubscriptionHandle>
    where
        F: Fn(Did, ManifestDiff) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let identity = self.ctx.identity.clone();
        let me = self.ctx.did();
        let mut rx = self
            .medium
            .subscribe(EventFilter::kind(MANIFEST_KIND).with_tag(TAG_RECIPIENT, me.as_str()))
            .await?;

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let manifest = match open_manifest(identity.as_ref(), &event.payload) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "Dropping unreadable manifest");
                        continue;
                    }
                };
                if manifest.delegate != me {
                    continue;
                }
                let owner = manifest.owner.clone();
                match book.apply(manifest) {
                    Ok(Some(diff)) if !diff.is_empty() => callback(owner, diff).await,
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Failed to apply manifest"),
                }
            }
        });

        Ok(SubscriptionHandle { task })
    }
}

fn open_manifest(
    identity: &dyn IdentityProvider,
    payload: &[u8],
) -> SyncResult<DelegationManifest> {
    let sealed: SealedManifest =
        postcard::from_bytes(payload).map_err(|e| SyncError::Serialization(e.to_string()))?;
    let plaintext = seal::unseal_from(identity, &sealed.ciphertext, &sealed.owner)?;
    let manifest: DelegationManifest =
        serde_json::from_slice(&plaintext).map_err(|e| SyncError::Decode(e.to_string()))?;
    if manifest.owner != sealed.owner {
        return Err(SyncError::Unseal("manifest owner mismatch".into()));
    }
    Ok(manifest)
}
