//! Gossip-based broadcast medium using iroh-gossip
//!
//! Each event kind maps to one gossip topic:
//!
//! ```text
//! topic_id = blake3("dersync-medium-v1" || kind)
//! ```
//!
//! Events are postcard-framed. Filtering happens on the receiving side.
//! There is no history: a device that is offline when a notice is sent
//! simply picks the change up on its next scheduled sync.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use iroh::discovery::static_provider::StaticProvider;
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointAddr, EndpointId, SecretKey};
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use iroh_gossip::proto::TopicId;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use super::medium::{spawn_filter_task, BroadcastEvent, BroadcastMedium, EventFilter};
use crate::error::{SyncError, SyncResult};

/// Domain separation prefix for topic ids
const TOPIC_DOMAIN: &[u8] = b"dersync-medium-v1";

/// Notices and manifests are small; keep well under the gossip default
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Gossip topic for an event kind
pub fn topic_for_kind(kind: &str) -> TopicId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(TOPIC_DOMAIN);
    hasher.update(kind.as_bytes());
    TopicId::from_bytes(*hasher.finalize().as_bytes())
}

/// A joined topic: shared sender plus a local fan-out of received events
struct TopicChannel {
    sender: Arc<Mutex<iroh_gossip::api::GossipSender>>,
    local: broadcast::Sender<BroadcastEvent>,
}

/// Broadcast medium over an iroh endpoint.
pub struct GossipMedium {
    endpoint: Endpoint,
    gossip: Gossip,
    router: Router,
    static_provider: StaticProvider,
    bootstrap: parking_lot::Mutex<Vec<EndpointId>>,
    topics: Mutex<HashMap<TopicId, TopicChannel>>,
}

impl GossipMedium {
    /// Bind an endpoint and spawn the gossip protocol.
    ///
    /// Pass a persisted secret key to keep the same endpoint id across
    /// restarts.
    pub async fn bind(secret_key: Option<SecretKey>) -> SyncResult<Self> {
        let secret_key = secret_key.unwrap_or_else(|| SecretKey::generate(&mut rand::rng()));
        let static_provider = StaticProvider::new();

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![GOSSIP_ALPN.to_vec()])
            .discovery(static_provider.clone())
            .bind()
            .await
            .map_err(|e| SyncError::Broadcast(format!("Failed to bind endpoint: {}", e)))?;
        info!(endpoint_id = %endpoint.id(), "Endpoint bound");

        let gossip = Gossip::builder()
            .max_message_size(MAX_MESSAGE_SIZE)
            .spawn(endpoint.clone());

        let router = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gossip.clone())
            .spawn();

        Ok(Self {
            endpoint,
            gossip,
            router,
            static_provider,
            bootstrap: parking_lot::Mutex::new(Vec::new()),
            topics: Mutex::new(HashMap::new()),
        })
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    /// Full addressing info to hand to other devices
    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// Make a peer reachable and use it to bootstrap topics joined from now on.
    pub fn add_peer(&self, endpoint_addr: EndpointAddr) {
        info!(
            peer = %endpoint_addr.id,
            addrs = endpoint_addr.addrs.len(),
            "Adding peer address to static discovery"
        );
        let id = endpoint_addr.id;
        self.static_provider.add_endpoint_info(endpoint_addr);
        let mut bootstrap = self.bootstrap.lock();
        if !bootstrap.contains(&id) {
            bootstrap.push(id);
        }
    }

    /// Join the topic for `kind` once; later calls reuse it.
    async fn channel(
        &self,
        kind: &str,
    ) -> SyncResult<(Arc<Mutex<iroh_gossip::api::GossipSender>>, broadcast::Sender<BroadcastEvent>)> {
        let topic_id = topic_for_kind(kind);
        let mut topics = self.topics.lock().await;
        if let Some(channel) = topics.get(&topic_id) {
            return Ok((channel.sender.clone(), channel.local.clone()));
        }

        let bootstrap = self.bootstrap.lock().clone();
        info!(%kind, ?topic_id, peer_count = bootstrap.len(), "Subscribing to topic");
        let gossip_topic = self
            .gossip
            .subscribe(topic_id, bootstrap)
            .await
            .map_err(|e| SyncError::Broadcast(format!("Failed to subscribe: {}", e)))?;
        let (sender, receiver) = gossip_topic.split();

        let (local, _) = broadcast::channel(256);
        tokio::spawn(pump_topic(receiver, topic_id, local.clone()));

        let sender = Arc::new(Mutex::new(sender));
        topics.insert(
            topic_id,
            TopicChannel {
                sender: sender.clone(),
                local: local.clone(),
            },
        );
        Ok((sender, local))
    }

    /// Gracefully shut down the router and endpoint
    pub async fn shutdown(self) -> SyncResult<()> {
        info!("Shutting down gossip medium");
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }
        self.endpoint.close().await;
        Ok(())
    }
}

/// Decode received gossip messages into the topic's local fan-out.
async fn pump_topic(
    mut receiver: iroh_gossip::api::GossipReceiver,
    topic_id: TopicId,
    local: broadcast::Sender<BroadcastEvent>,
) {
    use iroh_gossip::api::Event;
    use n0_future::StreamExt;

    loop {
        match receiver.try_next().await {
            Ok(Some(Event::Received(msg))) => {
                match postcard::from_bytes::<BroadcastEvent>(&msg.content) {
                    Ok(event) => {
                        debug!(topic = ?topic_id, from = ?msg.delivered_from, kind = %event.kind, "Received event");
                        let _ = local.send(event);
                    }
                    Err(e) => {
                        warn!(topic = ?topic_id, error = %e, "Dropping undecodable gossip message");
                    }
                }
            }
            Ok(Some(Event::NeighborUp(peer))) => {
                info!(topic = ?topic_id, ?peer, "Neighbor joined");
            }
            Ok(Some(Event::NeighborDown(peer))) => {
                info!(topic = ?topic_id, ?peer, "Neighbor left");
            }
            Ok(Some(Event::Lagged)) => {
                warn!(topic = ?topic_id, "Lagged behind on topic");
            }
            Ok(None) => {
                debug!(topic = ?topic_id, "Topic subscription closed");
                return;
            }
            Err(e) => {
                warn!(topic = ?topic_id, error = ?e, "Error receiving from topic");
                return;
            }
        }
    }
}

#[async_trait]
impl BroadcastMedium for GossipMedium {
    async fn publish(&self, event: BroadcastEvent) -> SyncResult<()> {
        let (sender, local) = self.channel(&event.kind).await?;
        let data = postcard::to_allocvec(&event)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        debug!(kind = %event.kind, len = data.len(), "Broadcasting event");

        sender
            .lock()
            .await
            .broadcast(data.into())
            .await
            .map_err(|e| SyncError::Broadcast(format!("Failed to broadcast: {}", e)))?;

        // Gossip does not echo to the sender; local subscribers still see it
        let _ = local.send(event);
        Ok(())
    }

    async fn subscribe(&self, filter: EventFilter) -> SyncResult<mpsc::Receiver<BroadcastEvent>> {
        let (_, local) = self.channel(&filter.kind).await?;
        let (tx, rx) = mpsc::channel(256);
        spawn_filter_task(local.subscribe(), filter, tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_per_kind() {
        assert_eq!(topic_for_kind("notice"), topic_for_kind("notice"));
        assert_ne!(topic_for_kind("notice"), topic_for_kind("manifest"));
    }

    #[test]
    fn test_postcard_framing() {
        let event = BroadcastEvent::new("notice", vec![1, 2, 3])
            .with_tag("p", "did:der:zabc")
            .replaceable("k");
        let bytes = postcard::to_allocvec(&event).unwrap();
        assert_eq!(postcard::from_bytes::<BroadcastEvent>(&bytes).unwrap(), event);
    }

    #[tokio::test]
    async fn test_local_subscriber_sees_own_publish() {
        let medium = GossipMedium::bind(None).await.expect("Failed to bind");
        let mut rx = medium.subscribe(EventFilter::kind("notice")).await.unwrap();

        medium
            .publish(BroadcastEvent::new("notice", b"hello".to_vec()))
            .await
            .unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(event.payload, b"hello");

        medium.shutdown().await.unwrap();
    }
}
