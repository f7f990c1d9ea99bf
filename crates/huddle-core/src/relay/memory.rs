//! In-process relay: a process-local bus joining per-client replicas
//!
//! The zero-configuration substrate. Every client of the same hub and room
//! observes the same state; there is no network. Clients are local-first:
//! a detached client keeps applying its own writes and queues them for the
//! bus, then flushes and catches up when re-attached, modeling transient
//! relay unavailability.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::replica::{ApplyPolicy, Replica};
use super::{KeyUpdate, Relay, RelayProvider};
use crate::error::RoomResult;
use crate::keyspace::KeyPath;
use crate::types::RoomId;

/// Process-local relay hub. Cheap to clone; clones share the same rooms.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    rooms: Mutex<HashMap<RoomId, Arc<RoomBus>>>,
    next_client_id: AtomicU64,
}

struct RoomBus {
    /// Authoritative state used to catch up late joiners and re-attachers
    canonical: Mutex<Replica>,
    clients: Mutex<Vec<BusClient>>,
}

struct BusClient {
    id: u64,
    shared: Weak<ClientShared>,
}

impl RoomBus {
    fn new() -> Self {
        Self {
            canonical: Mutex::new(Replica::new()),
            clients: Mutex::new(Vec::new()),
        }
    }

    /// Apply an update to the canonical replica and fan it out to every
    /// attached client except the origin (which already applied it).
    fn publish(&self, update: KeyUpdate, origin: u64) {
        self.canonical.lock().apply(update.clone(), ApplyPolicy::Arrival);
        let clients = self.clients.lock();
        for client in clients.iter() {
            if client.id == origin {
                continue;
            }
            if let Some(shared) = client.shared.upgrade() {
                if shared.attached.load(Ordering::SeqCst) && !shared.closed.load(Ordering::SeqCst) {
                    shared.replica.lock().apply(update.clone(), ApplyPolicy::Arrival);
                }
            }
        }
    }

    fn remove_client(&self, id: u64) {
        self.clients.lock().retain(|c| c.id != id);
    }
}

impl MemoryHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new relay client for a room on this hub.
    ///
    /// The client starts attached and catches up from the room's current
    /// canonical state.
    pub fn client(&self, room: &RoomId) -> MemoryRelay {
        let bus = {
            let mut rooms = self.inner.rooms.lock();
            rooms
                .entry(room.clone())
                .or_insert_with(|| Arc::new(RoomBus::new()))
                .clone()
        };

        let id = self.inner.next_client_id.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::new(ClientShared {
            id,
            bus: bus.clone(),
            replica: Mutex::new(Replica::new()),
            attached: AtomicBool::new(true),
            pending: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        // Catch up from canonical state before going live
        {
            let snapshot = bus.canonical.lock().snapshot();
            let mut replica = shared.replica.lock();
            for update in snapshot {
                replica.apply(update, ApplyPolicy::Arrival);
            }
        }

        bus.clients.lock().push(BusClient {
            id,
            shared: Arc::downgrade(&shared),
        });

        debug!(%room, client = id, "Memory relay client opened");
        MemoryRelay { shared }
    }
}

#[async_trait::async_trait]
impl RelayProvider for MemoryHub {
    async fn open(&self, room: &RoomId) -> RoomResult<Arc<dyn Relay>> {
        Ok(Arc::new(self.client(room)))
    }
}

struct ClientShared {
    id: u64,
    bus: Arc<RoomBus>,
    replica: Mutex<Replica>,
    attached: AtomicBool,
    pending: Mutex<Vec<KeyUpdate>>,
    closed: AtomicBool,
}

/// One client's connection to a room on a [`MemoryHub`].
pub struct MemoryRelay {
    shared: Arc<ClientShared>,
}

impl MemoryRelay {
    /// Detach from the hub: writes keep applying locally and queue for the
    /// bus. Models the relay being unreachable.
    pub fn detach(&self) {
        self.shared.attached.store(false, Ordering::SeqCst);
    }

    /// Re-attach to the hub: flush queued writes, then catch up on state
    /// missed while detached.
    pub fn attach(&self) {
        if self.shared.closed.load(Ordering::SeqCst) {
            return;
        }
        self.shared.attached.store(true, Ordering::SeqCst);

        let pending: Vec<KeyUpdate> = std::mem::take(&mut *self.shared.pending.lock());
        for update in pending {
            self.shared.bus.publish(update, self.shared.id);
        }

        let snapshot = self.shared.bus.canonical.lock().snapshot();
        let mut replica = self.shared.replica.lock();
        for update in snapshot {
            replica.apply(update, ApplyPolicy::IfNewer);
        }
    }
}

impl Relay for MemoryRelay {
    fn put(&self, key: KeyPath, value: Option<serde_json::Value>) {
        if self.shared.closed.load(Ordering::SeqCst) {
            return;
        }
        let update = KeyUpdate {
            key,
            value,
            written_at_ms: chrono::Utc::now().timestamp_millis(),
        };

        // Local-first: the local replica always applies, reachable or not
        self.shared.replica.lock().apply(update.clone(), ApplyPolicy::Arrival);

        if self.shared.attached.load(Ordering::SeqCst) {
            self.shared.bus.publish(update, self.shared.id);
        } else {
            self.shared.pending.lock().push(update);
        }
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
        self.shared.bus.remove_client(self.shared.id);
        self.shared.replica.lock().clear_watchers();
        debug!(client = self.shared.id, "Memory relay client closed");
    }
}

impl Drop for MemoryRelay {
    fn drop(&mut self) {
        self.close();
    }
}
