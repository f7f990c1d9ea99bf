//! Gossip-backed relay using iroh-gossip
//!
//! One gossip topic per room, derived from the room id. Every write is
//! broadcast to the topic as a postcard envelope and applied to a local
//! replica per node. When a new neighbor joins the topic, the full replica
//! is re-broadcast as a snapshot so late joiners replay current state.
//!
//! Live writes apply in arrival order (last write wins as observed per
//! node); snapshot entries apply only when absent or strictly newer, so a
//! replay never regresses a newer local value.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use iroh::discovery::static_provider::StaticProvider;
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointAddr, SecretKey};
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use iroh_gossip::proto::TopicId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::replica::{ApplyPolicy, Replica};
use super::{KeyUpdate, Relay, RelayProvider};
use crate::error::{RoomError, RoomResult};
use crate::keyspace::{room_topic, KeyPath};
use crate::ticket::{NodeAddrBytes, RoomTicket};
use crate::types::RoomId;

/// Gossip messages can carry a document snapshot; the default 4KB limit is
/// too small for that.
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Wire format version
const WIRE_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    version: u8,
    frame: WireFrame,
}

#[derive(Debug, Serialize, Deserialize)]
enum WireFrame {
    /// One live write
    Write(WireEntry),
    /// Full-replica anti-entropy replay, sent when a neighbor joins
    Snapshot(Vec<WireEntry>),
}

#[derive(Debug, Serialize, Deserialize)]
struct WireEntry {
    channel: String,
    entry: Option<String>,
    /// JSON-encoded value bytes, or None for a tombstone
    value: Option<Vec<u8>>,
    written_at_ms: i64,
}

impl WireEntry {
    fn from_update(update: &KeyUpdate) -> Option<Self> {
        let value = match &update.value {
            Some(v) => match serde_json::to_vec(v) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(error = %e, "Failed to encode value for wire");
                    return None;
                }
            },
            None => None,
        };
        Some(Self {
            channel: update.key.channel.clone(),
            entry: update.key.entry.clone(),
            value,
            written_at_ms: update.written_at_ms,
        })
    }

    fn into_update(self) -> Option<KeyUpdate> {
        let value = match self.value {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(error = %e, "Discarding undecodable wire value");
                    return None;
                }
            },
            None => None,
        };
        Some(KeyUpdate {
            key: KeyPath {
                channel: self.channel,
                entry: self.entry,
            },
            value,
            written_at_ms: self.written_at_ms,
        })
    }
}

/// Gossip networking shared by all rooms of one node.
///
/// Wraps an iroh endpoint with the gossip protocol registered. Rooms map to
/// topics; bootstrap peers for a room are learned from [`RoomTicket`]s.
#[derive(Debug)]
pub struct GossipNet {
    endpoint: Endpoint,
    gossip: Gossip,
    router: Router,
    static_provider: StaticProvider,
    bootstrap: Mutex<HashMap<RoomId, Vec<iroh::EndpointId>>>,
}

impl GossipNet {
    /// Bind a gossip endpoint with a fresh identity
    pub async fn bind() -> RoomResult<Self> {
        let secret_key = SecretKey::generate(&mut rand::rng());
        let static_provider = StaticProvider::new();

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![GOSSIP_ALPN.to_vec()])
            .discovery(static_provider.clone())
            .bind()
            .await
            .map_err(|e| RoomError::Network(format!("Failed to bind endpoint: {}", e)))?;

        let endpoint_id = endpoint.id();
        info!(%endpoint_id, "Endpoint bound");

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
            bootstrap: Mutex::new(HashMap::new()),
        })
    }

    /// This node's endpoint id
    pub fn endpoint_id(&self) -> iroh::EndpointId {
        self.endpoint.id()
    }

    /// This node's current addressing information
    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// Issue a ticket for a room with this node as the bootstrap peer
    pub fn ticket(&self, room: &RoomId) -> RoomTicket {
        let our_addr = NodeAddrBytes::from_endpoint_addr(&self.endpoint_addr());
        RoomTicket::new(room, vec![our_addr])
    }

    /// Learn a ticket's bootstrap peers.
    ///
    /// Adds the peers' addresses to static discovery and remembers them as
    /// bootstrap nodes for the ticket's room, so a later open of that room
    /// joins the existing swarm.
    pub fn register_ticket(&self, ticket: &RoomTicket) -> RoomResult<RoomId> {
        let room = ticket.room();
        let mut ids = Vec::with_capacity(ticket.bootstrap.len());
        for peer in &ticket.bootstrap {
            let addr = peer.to_endpoint_addr()?;
            debug!(peer = %addr.id, "Adding bootstrap peer to static discovery");
            self.static_provider.add_endpoint_info(addr.clone());
            ids.push(addr.id);
        }
        self.bootstrap.lock().entry(room.clone()).or_default().extend(ids);
        Ok(room)
    }

    /// Open the gossip relay for a room, joining its topic.
    ///
    /// Bootstrap peers previously registered via tickets are used to join
    /// the swarm; with none, this node starts the swarm.
    pub async fn open_room(&self, room: &RoomId) -> RoomResult<GossipRelay> {
        let topic_id = TopicId::from_bytes(room_topic(room));
        let bootstrap = self.bootstrap.lock().get(room).cloned().unwrap_or_default();

        info!(%room, ?topic_id, peers = bootstrap.len(), "Joining room topic");

        let gossip_topic = self
            .gossip
            .subscribe(topic_id, bootstrap)
            .await
            .map_err(|e| RoomError::Relay(format!("Failed to subscribe: {}", e)))?;
        let (sender, receiver) = gossip_topic.split();

        let shared = Arc::new(GossipShared {
            room: room.clone(),
            replica: Mutex::new(Replica::new()),
            sender: Arc::new(tokio::sync::Mutex::new(sender)),
            closed: AtomicBool::new(false),
        });

        let recv_task = tokio::spawn(Self::recv_loop(shared.clone(), receiver));

        Ok(GossipRelay { shared, recv_task })
    }

    /// Receive loop for one room's topic: applies live writes and snapshot
    /// replays, and answers new neighbors with a snapshot of our replica.
    async fn recv_loop(shared: Arc<GossipShared>, mut receiver: iroh_gossip::api::GossipReceiver) {
        use iroh_gossip::api::Event;
        use n0_future::StreamExt;

        loop {
            match receiver.try_next().await {
                Ok(Some(Event::Received(msg))) => {
                    let decoded: Result<WireMessage, _> = postcard::from_bytes(&msg.content);
                    match decoded {
                        Ok(WireMessage { version, .. }) if version != WIRE_VERSION => {
                            warn!(room = %shared.room, version, "Discarding unsupported wire version");
                        }
                        Ok(WireMessage {
                            frame: WireFrame::Write(entry),
                            ..
                        }) => {
                            if let Some(update) = entry.into_update() {
                                shared.replica.lock().apply(update, ApplyPolicy::Arrival);
                            }
                        }
                        Ok(WireMessage {
                            frame: WireFrame::Snapshot(entries),
                            ..
                        }) => {
                            debug!(room = %shared.room, entries = entries.len(), "Applying snapshot");
                            let mut replica = shared.replica.lock();
                            for entry in entries {
                                if let Some(update) = entry.into_update() {
                                    replica.apply(update, ApplyPolicy::IfNewer);
                                }
                            }
                        }
                        Err(e) => {
                            warn!(room = %shared.room, error = %e, "Discarding undecodable gossip message");
                        }
                    }
                }
                Ok(Some(Event::NeighborUp(peer))) => {
                    info!(room = %shared.room, ?peer, "Neighbor joined, sending snapshot");
                    shared.broadcast_snapshot().await;
                }
                Ok(Some(Event::NeighborDown(peer))) => {
                    debug!(room = %shared.room, ?peer, "Neighbor left");
                }
                Ok(Some(Event::Lagged)) => {
                    warn!(room = %shared.room, "Lagged behind on topic");
                }
                Ok(None) => {
                    debug!(room = %shared.room, "Topic subscription closed");
                    break;
                }
                Err(e) => {
                    warn!(room = %shared.room, error = ?e, "Error receiving from topic");
                    break;
                }
            }
        }
    }

    /// Gracefully shut down the gossip networking
    pub async fn shutdown(self) -> RoomResult<()> {
        info!("Shutting down gossip networking");
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }
        self.endpoint.close().await;
        Ok(())
    }
}

#[async_trait::async_trait]
impl RelayProvider for GossipNet {
    async fn open(&self, room: &RoomId) -> RoomResult<Arc<dyn Relay>> {
        Ok(Arc::new(self.open_room(room).await?))
    }
}

struct GossipShared {
    room: RoomId,
    replica: Mutex<Replica>,
    sender: Arc<tokio::sync::Mutex<iroh_gossip::api::GossipSender>>,
    closed: AtomicBool,
}

impl GossipShared {
    async fn broadcast(&self, frame: WireFrame) {
        let message = WireMessage {
            version: WIRE_VERSION,
            frame,
        };
        let bytes = match postcard::to_stdvec(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(room = %self.room, error = %e, "Failed to encode gossip message");
                return;
            }
        };
        // Best-effort: an unreachable swarm means the write propagates later
        // via snapshot replay, never an error to the caller.
        if let Err(e) = self.sender.lock().await.broadcast(bytes.into()).await {
            debug!(room = %self.room, error = %e, "Broadcast did not go out");
        }
    }

    async fn broadcast_snapshot(&self) {
        let entries: Vec<WireEntry> = {
            let replica = self.replica.lock();
            replica
                .snapshot()
                .iter()
                .filter_map(WireEntry::from_update)
                .collect()
        };
        if entries.is_empty() {
            return;
        }
        self.broadcast(WireFrame::Snapshot(entries)).await;
    }
}

/// One room's connection to the gossip relay.
pub struct GossipRelay {
    shared: Arc<GossipShared>,
    recv_task: tokio::task::JoinHandle<()>,
}

impl Relay for GossipRelay {
    fn put(&self, key: KeyPath, value: Option<serde_json::Value>) {
        if self.shared.closed.load(Ordering::SeqCst) {
            return;
        }
        let update = KeyUpdate {
            key,
            value,
            written_at_ms: chrono::Utc::now().timestamp_millis(),
        };

        // Local-first: apply before (and regardless of) propagation
        self.shared.replica.lock().apply(update.clone(), ApplyPolicy::Arrival);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Some(entry) = WireEntry::from_update(&update) {
                shared.broadcast(WireFrame::Write(entry)).await;
            }
        });
    }

    fn subscribe(&self, channel: &str) -> mpsc::UnboundedReceiver<KeyUpdate> {
        if self.shared.closed.load(Ordering::SeqCst) {
            let (_tx, rx) = mpsc::unbounded_channel();
            return rx;
        }
        self.shared.replica.lock().subscribe(channel)
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.recv_task.abort();
        self.shared.replica.lock().clear_watchers();
        debug!(room = %self.shared.room, "Gossip relay closed");
    }
}

impl Drop for GossipRelay {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_entry_roundtrip() {
        let update = KeyUpdate {
            key: KeyPath::entry("chat", "m1"),
            value: Some(serde_json::json!({"text": "hi"})),
            written_at_ms: 42,
        };
        let entry = WireEntry::from_update(&update).unwrap();
        let back = entry.into_update().unwrap();
        assert_eq!(back, update);
    }

    #[test]
    fn test_wire_tombstone_roundtrip() {
        let update = KeyUpdate {
            key: KeyPath::value("code"),
            value: None,
            written_at_ms: 7,
        };
        let entry = WireEntry::from_update(&update).unwrap();
        assert!(entry.value.is_none());
        let back = entry.into_update().unwrap();
        assert_eq!(back, update);
    }

    #[test]
    fn test_wire_message_postcard_roundtrip() {
        let message = WireMessage {
            version: WIRE_VERSION,
            frame: WireFrame::Write(WireEntry {
                channel: "code".to_string(),
                entry: None,
                value: Some(b"\"x\"".to_vec()),
                written_at_ms: 1,
            }),
        };
        let bytes = postcard::to_stdvec(&message).unwrap();
        let decoded: WireMessage = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.version, WIRE_VERSION);
        match decoded.frame {
            WireFrame::Write(entry) => assert_eq!(entry.channel, "code"),
            _ => panic!("expected write frame"),
        }
    }

    #[test]
    fn test_undecodable_garbage_is_rejected() {
        let decoded: Result<WireMessage, _> = postcard::from_bytes(&[0xff, 0xee, 0xdd]);
        assert!(decoded.is_err());
    }
}
