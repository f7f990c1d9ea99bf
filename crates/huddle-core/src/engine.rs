//! Room engine: the caller-facing entry point
//!
//! A [`RoomEngine`] owns the relay registry and the peer transport and
//! hands out [`Room`]s. A room bundles everything a frontend needs: the
//! shared document, the chat log, and the media mesh, all scoped to one
//! room id.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use huddle_core::{MemoryHub, LoopbackTransport, RoomEngine, RoomId};
//!
//! let engine = RoomEngine::new(Arc::new(MemoryHub::new()), Arc::new(LoopbackTransport::new()));
//! let room = engine.join(RoomId::new("r9"), "alice").await?;
//!
//! let doc = room.document(String::new());
//! doc.set(&"hello".to_string());
//!
//! let chat = room.chat();
//! chat.send("hi everyone");
//!
//! room.mesh().start().await?;
//! room.leave().await;
//! ```

use std::sync::Arc;

use tracing::info;

use crate::error::RoomResult;
use crate::keyspace::{CHAT_CHANNEL, DOCUMENT_CHANNEL};
use crate::mesh::{MeshManager, PeerTransport};
use crate::relay::{RelayProvider, RelayRegistry};
use crate::session::{ChatLog, Document};
use crate::store::RoomStore;
use crate::types::{Participant, RoomId};

/// Entry point: joins rooms over one relay provider and one peer
/// transport.
pub struct RoomEngine<T: PeerTransport> {
    registry: RelayRegistry,
    transport: Arc<T>,
}

impl<T: PeerTransport> RoomEngine<T> {
    /// Create an engine over a relay provider and a peer transport
    pub fn new(provider: Arc<dyn RelayProvider>, transport: Arc<T>) -> Self {
        Self {
            registry: RelayRegistry::new(provider),
            transport,
        }
    }

    /// Join a room with a display name.
    ///
    /// Generates a fresh participant identity (a blank name becomes a
    /// generated guest name) and opens the room's relay through the
    /// registry. Joining the same room twice shares the relay connection.
    pub async fn join(&self, room_id: RoomId, display_name: &str) -> RoomResult<Room<T>> {
        let local = Participant::new(display_name);
        let relay = self.registry.open(&room_id).await?;
        let store = RoomStore::new(relay);
        let mesh = MeshManager::new(store.clone(), local.clone(), self.transport.clone());

        info!(room = %room_id, participant = %local.id, name = %local.display_name, "Joined room");

        Ok(Room {
            id: room_id,
            local,
            store,
            mesh,
            registry: self.registry.clone(),
        })
    }

    /// The engine's relay registry
    pub fn registry(&self) -> &RelayRegistry {
        &self.registry
    }
}

/// One joined room: document, chat, and media mesh behind a single handle.
pub struct Room<T: PeerTransport> {
    id: RoomId,
    local: Participant,
    store: RoomStore,
    mesh: MeshManager<T>,
    registry: RelayRegistry,
}

impl<T: PeerTransport> Room<T> {
    /// The room id
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// The local participant
    pub fn participant(&self) -> &Participant {
        &self.local
    }

    /// The room's typed store, for callers needing raw primitives
    pub fn store(&self) -> &RoomStore {
        &self.store
    }

    /// Open the shared document with a default value
    pub fn document<V>(&self, default: V) -> Document<V>
    where
        V: serde::Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static,
    {
        Document::open(self.store.clone(), DOCUMENT_CHANNEL, default)
    }

    /// Open a document on a custom channel
    pub fn document_on<V>(&self, channel: &str, default: V) -> Document<V>
    where
        V: serde::Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static,
    {
        Document::open(self.store.clone(), channel, default)
    }

    /// Open the room's chat log
    pub fn chat(&self) -> ChatLog {
        ChatLog::open(self.store.clone(), CHAT_CHANNEL, self.local.clone())
    }

    /// The room's media mesh
    pub fn mesh(&self) -> &MeshManager<T> {
        &self.mesh
    }

    /// Leave the room.
    ///
    /// Stops the mesh (closing every peer connection and releasing
    /// capture) and disposes the room's relay from the registry.
    pub async fn leave(self) {
        info!(room = %self.id, participant = %self.local.id, "Leaving room");
        self.mesh.stop().await;
        self.registry.dispose(&self.id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::loopback::LoopbackTransport;
    use crate::relay::memory::MemoryHub;

    fn engine() -> RoomEngine<LoopbackTransport> {
        RoomEngine::new(
            Arc::new(MemoryHub::new()),
            Arc::new(LoopbackTransport::new()),
        )
    }

    #[tokio::test]
    async fn test_join_generates_identity() {
        let engine = engine();
        let room = engine.join(RoomId::new("r1"), "alice").await.unwrap();
        assert_eq!(room.participant().display_name, "alice");
        assert_eq!(room.id(), &RoomId::new("r1"));
    }

    #[tokio::test]
    async fn test_join_blank_name_becomes_guest() {
        let engine = engine();
        let room = engine.join(RoomId::new("r1"), "").await.unwrap();
        assert!(room.participant().display_name.starts_with("guest-"));
    }

    #[tokio::test]
    async fn test_two_joins_get_distinct_identities() {
        let engine = engine();
        let a = engine.join(RoomId::new("r1"), "alice").await.unwrap();
        let b = engine.join(RoomId::new("r1"), "alice").await.unwrap();
        assert_ne!(a.participant().id, b.participant().id);
    }

    #[tokio::test]
    async fn test_leave_disposes_relay() {
        let engine = engine();
        let room = engine.join(RoomId::new("r1"), "alice").await.unwrap();
        assert_eq!(engine.registry().open_count().await, 1);
        room.leave().await;
        assert_eq!(engine.registry().open_count().await, 0);
    }

    #[tokio::test]
    async fn test_document_and_chat_flow_through_store() {
        let engine = engine();
        let alice = engine.join(RoomId::new("r1"), "alice").await.unwrap();
        let bob = engine.join(RoomId::new("r1"), "bob").await.unwrap();

        let doc_a = alice.document(String::new());
        let doc_b = bob.document(String::new());
        let mut watch_b = doc_b.watch();
        doc_a.set(&"shared".to_string());
        watch_b.changed().await.unwrap();
        assert_eq!(doc_b.current(), "shared");

        let chat_a = alice.chat();
        let chat_b = bob.chat();
        chat_a.send("hello bob");
        let mut chat_watch = chat_b.watch();
        while chat_b.entries().is_empty() {
            chat_watch.changed().await.unwrap();
        }
        assert_eq!(chat_b.entries()[0].text, "hello bob");
        assert_eq!(chat_b.entries()[0].sender_name, "alice");
    }
}
