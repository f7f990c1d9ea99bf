//! Relay clients: the shared key/value graph each room rides on
//!
//! The relay is consumed as a black box: an eventually-consistent,
//! gossip-replicated key/value graph used purely as a message bus. The
//! contract is deliberately thin:
//!
//! - writes are fire-and-forget and never fail the caller; while the relay
//!   is unreachable, data simply does not propagate until connectivity
//!   resumes,
//! - subscribing to a channel replays the current value(s) immediately and
//!   then delivers every later update at least once,
//! - there is no ordering guarantee across keys; within a key, the last
//!   observed write wins.
//!
//! Two backends implement the contract: [`memory::MemoryHub`] (a
//! process-local bus, the zero-configuration default and the test
//! substrate) and [`gossip::GossipNet`] (iroh-gossip topics, one per room).

pub mod gossip;
pub mod memory;
mod replica;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::RoomResult;
use crate::keyspace::KeyPath;
use crate::types::RoomId;

/// One observed write in a room's key/value graph.
///
/// `value == None` is a tombstone: the key has been removed.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyUpdate {
    /// The key that changed
    pub key: KeyPath,
    /// The new value, or None for a removal
    pub value: Option<serde_json::Value>,
    /// Unix milliseconds when the writer produced this update
    pub written_at_ms: i64,
}

/// A room-scoped relay client.
///
/// One instance per (client, room). All methods are synchronous and
/// non-blocking; backends that need I/O do it on background tasks.
pub trait Relay: Send + Sync + 'static {
    /// Fire-and-forget write. Applies to the local replica immediately and
    /// propagates on a best-effort basis; never blocks or fails the caller.
    fn put(&self, key: KeyPath, value: Option<serde_json::Value>);

    /// Subscribe to every key of one channel.
    ///
    /// The channel's current values are replayed into the receiver before
    /// any live update, so a late subscriber observes existing state.
    fn subscribe(&self, channel: &str) -> mpsc::UnboundedReceiver<KeyUpdate>;

    /// Release this room's relay resources. Subscriptions end after this.
    fn close(&self);
}

/// Factory for room-scoped relay clients.
#[async_trait]
pub trait RelayProvider: Send + Sync + 'static {
    /// Open (or create) the relay client for a room
    async fn open(&self, room: &RoomId) -> RoomResult<Arc<dyn Relay>>;
}

/// Explicit registry of per-room relay connections.
///
/// One relay connection object exists per room, created on first reference
/// through the provider and closed when the last reference is disposed.
/// The registry is owned by the engine; nothing is populated implicitly
/// behind a global.
#[derive(Clone)]
pub struct RelayRegistry {
    provider: Arc<dyn RelayProvider>,
    rooms: Arc<tokio::sync::Mutex<HashMap<RoomId, RoomEntry>>>,
}

struct RoomEntry {
    relay: Arc<dyn Relay>,
    references: usize,
}

impl RelayRegistry {
    /// Create a registry backed by the given provider
    pub fn new(provider: Arc<dyn RelayProvider>) -> Self {
        Self {
            provider,
            rooms: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Get the relay for a room, creating it on first reference.
    ///
    /// Each call takes one reference; pair it with one
    /// [`RelayRegistry::dispose`].
    pub async fn open(&self, room: &RoomId) -> RoomResult<Arc<dyn Relay>> {
        let mut rooms = self.rooms.lock().await;
        if let Some(entry) = rooms.get_mut(room) {
            entry.references += 1;
            return Ok(entry.relay.clone());
        }
        let relay = self.provider.open(room).await?;
        rooms.insert(
            room.clone(),
            RoomEntry {
                relay: relay.clone(),
                references: 1,
            },
        );
        Ok(relay)
    }

    /// Drop one reference to a room's relay connection.
    ///
    /// The relay is closed and removed when the last reference goes.
    /// Returns `true` if the room was open.
    pub async fn dispose(&self, room: &RoomId) -> bool {
        let relay = {
            let mut rooms = self.rooms.lock().await;
            let Some(entry) = rooms.get_mut(room) else {
                return false;
            };
            entry.references -= 1;
            if entry.references > 0 {
                return true;
            }
            rooms.remove(room).map(|entry| entry.relay)
        };
        if let Some(relay) = relay {
            relay.close();
        }
        true
    }

    /// Number of rooms currently open
    pub async fn open_count(&self) -> usize {
        self.rooms.lock().await.len()
    }
}
