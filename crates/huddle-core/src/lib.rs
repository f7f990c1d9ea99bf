//! Huddle Core Library
//!
//! Realtime room coordination without a central application server: a
//! shared eventually-consistent document and chat log per room, plus a
//! full-mesh peer media layer, all riding a gossiping key/value relay.
//!
//! ## Overview
//!
//! Participants join a room by id with a self-asserted display name. The
//! shared state layer offers a last-write-wins document and an append-only
//! chat log over the relay. The mesh layer announces presence, discovers
//! peers, deterministically elects the connection initiator for every
//! pair, relays negotiation payloads through the same shared state, and
//! maintains one direct media connection per peer.
//!
//! Two relay backends ship: an in-process hub (zero configuration, also
//! the test substrate) and an iroh-gossip backend with one topic per room,
//! bootstrapped by shareable room tickets. Two peer transports ship: a
//! WebRTC transport over the `webrtc` crate and an in-process loopback
//! transport for headless use.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use huddle_core::{LoopbackTransport, MemoryHub, RoomEngine, RoomId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = RoomEngine::new(
//!         Arc::new(MemoryHub::new()),
//!         Arc::new(LoopbackTransport::new()),
//!     );
//!     let room = engine.join(RoomId::new("r9"), "alice").await?;
//!
//!     let doc = room.document(String::new());
//!     doc.set(&"fn main() {}".to_string());
//!
//!     let chat = room.chat();
//!     chat.send("hello!");
//!
//!     room.mesh().start().await?;
//!     room.leave().await;
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod error;
pub mod keyspace;
pub mod mesh;
pub mod presence;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod store;
pub mod ticket;
pub mod types;

// Re-exports
pub use engine::{Room, RoomEngine};
pub use error::{RoomError, RoomResult};
pub use mesh::loopback::{LoopbackMedia, LoopbackStream, LoopbackTransport};
pub use mesh::rtc::{RtcConfig, RtcLocalMedia, RtcRemoteStream, RtcTransport};
pub use mesh::{
    initiates, role_for, LocalMediaControl, MeshEvent, MeshManager, PeerEvent, PeerHandle,
    PeerLifecycle, PeerTransport, Role, StreamRecord, StreamSource,
};
pub use presence::PresenceTracker;
pub use relay::gossip::{GossipNet, GossipRelay};
pub use relay::memory::{MemoryHub, MemoryRelay};
pub use relay::{KeyUpdate, Relay, RelayProvider, RelayRegistry};
pub use session::{ChatLog, Document};
pub use signaling::{SignalBlob, SignalEnvelope, SignalingChannel};
pub use store::{RoomStore, Subscription};
pub use ticket::{NodeAddrBytes, RoomTicket};
pub use types::{ChatEntry, Participant, ParticipantId, PresenceRecord, RoomId};
