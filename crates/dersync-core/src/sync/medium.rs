//! Broadcast medium for out-of-band notices
//!
//! A medium moves small opaque events between devices. It is best effort:
//! nothing here is required for correctness, since every device also syncs
//! on its own schedule.
//!
//! Events carry a `kind` (one channel per kind), routing `tags` for
//! filtering, and an optional `replace_key`: for replaceable events only
//! the newest one per (kind, key) is retained in history.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::types::now_millis;

/// Capacity of each subscriber's delivery queue
const SUBSCRIBER_QUEUE: usize = 256;

/// One event on a medium
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    pub kind: String,
    pub tags: BTreeMap<String, String>,
    pub payload: Vec<u8>,
    /// Unix milliseconds, set by the publisher
    pub created_at: i64,
    pub replace_key: Option<String>,
}

impl BroadcastEvent {
    pub fn new(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            tags: BTreeMap::new(),
            payload,
            created_at: now_millis(),
            replace_key: None,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn replaceable(mut self, key: impl Into<String>) -> Self {
        self.replace_key = Some(key.into());
        self
    }
}

/// Which events a subscriber wants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub kind: String,
    /// Every listed tag must be present with this value
    pub tags: BTreeMap<String, String>,
}

impl EventFilter {
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, event: &BroadcastEvent) -> bool {
        event.kind == self.kind
            && self
                .tags
                .iter()
                .all(|(k, v)| event.tags.get(k) == Some(v))
    }
}

#[async_trait]
pub trait BroadcastMedium: Send + Sync {
    async fn publish(&self, event: BroadcastEvent) -> SyncResult<()>;

    /// Matching events, starting with whatever recent history the medium
    /// keeps. The stream ends when the medium shuts down.
    async fn subscribe(&self, filter: EventFilter) -> SyncResult<mpsc::Receiver<BroadcastEvent>>;
}

/// Forward matching events from a broadcast receiver until either side closes.
pub(crate) fn spawn_filter_task(
    mut live: broadcast::Receiver<BroadcastEvent>,
    filter: EventFilter,
    tx: mpsc::Sender<BroadcastEvent>,
) {
    tokio::spawn(async move {
        loop {
            match live.recv().await {
                Ok(event) => {
                    if filter.matches(&event) && tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(kind = %filter.kind, skipped, "Subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

struct MemoryInner {
    live: broadcast::Sender<BroadcastEvent>,
    history: Mutex<Vec<BroadcastEvent>>,
    history_window: Duration,
}

/// In-process medium with time-bounded history replay.
///
/// Cloning shares the medium; every device in a test holds a clone.
#[derive(Clone)]
pub struct MemoryMedium {
    inner: Arc<MemoryInner>,
}

impl MemoryMedium {
    pub fn new(history_window: Duration) -> Self {
        let (live, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(MemoryInner {
                live,
                history: Mutex::new(Vec::new()),
                history_window,
            }),
        }
    }

    /// Events currently retained for replay
    pub fn history_len(&self) -> usize {
        self.inner.history.lock().len()
    }

    fn prune(&self, history: &mut Vec<BroadcastEvent>) {
        let cutoff = now_millis() - self.inner.history_window.as_millis() as i64;
        history.retain(|e| e.created_at >= cutoff);
    }
}

impl Default for MemoryMedium {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl BroadcastMedium for MemoryMedium {
    async fn publish(&self, event: BroadcastEvent) -> SyncResult<()> {
        {
            let mut history = self.inner.history.lock();
            self.prune(&mut history);

            if let Some(key) = &event.replace_key {
                let newer_exists = history.iter().any(|e| {
                    e.kind == event.kind
                        && e.replace_key.as_ref() == Some(key)
                        && e.created_at > event.created_at
                });
                if newer_exists {
                    debug!(kind = %event.kind, %key, "Dropping stale replaceable event");
                    return Ok(());
                }
                history.retain(|e| !(e.kind == event.kind && e.replace_key.as_ref() == Some(key)));
            }
            history.push(event.clone());

            // Send while holding the history lock so a concurrent subscriber
            // sees each event exactly once: either replayed or live.
            if self.inner.live.receiver_count() > 0 && self.inner.live.send(event).is_err() {
                return Err(SyncError::Broadcast("medium closed".into()));
            }
        }
        Ok(())
    }

    async fn subscribe(&self, filter: EventFilter) -> SyncResult<mpsc::Receiver<BroadcastEvent>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);

        let (replay, live) = {
            let mut history = self.inner.history.lock();
            self.prune(&mut history);
            let replay: Vec<BroadcastEvent> =
                history.iter().filter(|e| filter.matches(e)).cloned().collect();
            (replay, self.inner.live.subscribe())
        };

        for event in replay {
            if tx.try_send(event).is_err() {
                warn!(kind = %filter.kind, "Replay exceeded subscriber queue");
                break;
            }
        }
        spawn_filter_task(live, filter, tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_live_delivery_with_filter() {
        let medium = MemoryMedium::default();
        let mut rx = medium
            .subscribe(EventFilter::kind("notice").with_tag("p", "bob"))
            .await
            .unwrap();

        medium
            .publish(BroadcastEvent::new("notice", b"for carol".to_vec()).with_tag("p", "carol"))
            .await
            .unwrap();
        medium
            .publish(BroadcastEvent::new("other", b"wrong kind".to_vec()).with_tag("p", "bob"))
            .await
            .unwrap();
        medium
            .publish(BroadcastEvent::new("notice", b"for bob".to_vec()).with_tag("p", "bob"))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload, b"for bob");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_history_replay_for_late_subscriber() {
        let medium = MemoryMedium::default();
        medium
            .publish(BroadcastEvent::new("notice", b"early".to_vec()))
            .await
            .unwrap();

        let mut rx = medium.subscribe(EventFilter::kind("notice")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, b"early");
    }

    #[tokio::test]
    async fn test_history_window_expires() {
        let medium = MemoryMedium::new(Duration::from_secs(60));
        let mut old = BroadcastEvent::new("notice", b"old".to_vec());
        old.created_at -= 120_000;
        medium.publish(old).await.unwrap();
        medium
            .publish(BroadcastEvent::new("notice", b"fresh".to_vec()))
            .await
            .unwrap();

        assert_eq!(medium.history_len(), 1);
        let mut rx = medium.subscribe(EventFilter::kind("notice")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, b"fresh");
    }

    #[tokio::test]
    async fn test_replaceable_keeps_latest() {
        let medium = MemoryMedium::default();
        let base = now_millis();

        let mut v1 = BroadcastEvent::new("manifest", b"v1".to_vec()).replaceable("alice/bob");
        v1.created_at = base;
        let mut v2 = BroadcastEvent::new("manifest", b"v2".to_vec()).replaceable("alice/bob");
        v2.created_at = base + 1;
        let mut stale = BroadcastEvent::new("manifest", b"stale".to_vec()).replaceable("alice/bob");
        stale.created_at = base - 1;

        medium.publish(v1).await.unwrap();
        medium.publish(v2).await.unwrap();
        medium.publish(stale).await.unwrap();

        assert_eq!(medium.history_len(), 1);
        let mut rx = medium.subscribe(EventFilter::kind("manifest")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, b"v2");
    }
}
