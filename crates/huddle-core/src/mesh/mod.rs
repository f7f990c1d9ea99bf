//! Peer connection manager: the room's media mesh
//!
//! Owns the set of active peer connections, the local media stream, and
//! the topology decision. Discovery comes from presence, the initiator is
//! elected deterministically from the pair of ids, negotiation payloads
//! are relayed through the signaling channel, and every pair of active
//! participants ends up with one direct connection.
//!
//! Per remote peer the lifecycle is `absent → negotiating → connected →
//! closed`; `closed` removes the record entirely, so a later re-discovery
//! starts a fresh connection. A failure on one peer never disturbs the
//! others — the worst case is a participant with zero connected peers who
//! can still use the document and chat channels.

pub mod election;
pub mod loopback;
pub mod rtc;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use election::{initiates, role_for, Role};
pub use transport::{LocalMediaControl, PeerEvent, PeerHandle, PeerLink, PeerTransport};

use crate::error::RoomResult;
use crate::presence::PresenceTracker;
use crate::signaling::SignalingChannel;
use crate::store::{RoomStore, Subscription};
use crate::types::{Participant, ParticipantId};

/// Capacity of the mesh event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted as peers move through the mesh.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A new peer id appeared in presence and a connection was started
    PeerDiscovered(ParticipantId),
    /// A peer's connection is established
    PeerConnected(ParticipantId),
    /// A peer's connection closed and its records were removed
    PeerClosed(ParticipantId),
    /// A peer's connection failed and its records were removed
    PeerFailed {
        /// The peer whose connection failed
        participant: ParticipantId,
        /// Failure description
        reason: String,
    },
}

/// Lifecycle of one peer connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLifecycle {
    /// Negotiation payloads are being exchanged
    Negotiating,
    /// A media stream is established
    Connected,
}

/// Where a stream record's media comes from.
pub enum StreamSource<T: PeerTransport> {
    /// The local capture, shared by reference with every connection
    Local(T::LocalMedia),
    /// A remote peer's stream
    Remote(T::RemoteStream),
}

impl<T: PeerTransport> Clone for StreamSource<T> {
    fn clone(&self) -> Self {
        match self {
            StreamSource::Local(media) => StreamSource::Local(media.clone()),
            StreamSource::Remote(stream) => StreamSource::Remote(stream.clone()),
        }
    }
}

/// One entry in the live set of media streams.
pub struct StreamRecord<T: PeerTransport> {
    /// Owning participant (the local id for the self record)
    pub participant: ParticipantId,
    /// Display label: the local display name, or a short peer id prefix
    pub label: String,
    /// The stream itself
    pub source: StreamSource<T>,
}

impl<T: PeerTransport> Clone for StreamRecord<T> {
    fn clone(&self) -> Self {
        Self {
            participant: self.participant.clone(),
            label: self.label.clone(),
            source: self.source.clone(),
        }
    }
}

impl<T: PeerTransport> StreamRecord<T> {
    /// Whether this is the local participant's own record
    pub fn is_local(&self) -> bool {
        matches!(self.source, StreamSource::Local(_))
    }
}

struct PeerRecord<T: PeerTransport> {
    role: Role,
    lifecycle: PeerLifecycle,
    handle: Option<Arc<PeerHandle<T::RemoteStream>>>,
    /// Inbound signal watch; dropping it stops delivery
    signal_sub: Option<Subscription>,
    pump_task: Option<JoinHandle<()>>,
}

struct MeshState<T: PeerTransport> {
    started: bool,
    local_media: Option<T::LocalMedia>,
    peers: HashMap<ParticipantId, PeerRecord<T>>,
    /// Remote streams in arrival order
    remote_streams: Vec<(ParticipantId, T::RemoteStream)>,
    presence_sub: Option<Subscription>,
    discovery_task: Option<JoinHandle<()>>,
}

impl<T: PeerTransport> Default for MeshState<T> {
    fn default() -> Self {
        Self {
            started: false,
            local_media: None,
            peers: HashMap::new(),
            remote_streams: Vec::new(),
            presence_sub: None,
            discovery_task: None,
        }
    }
}

/// Manager for a room's peer media mesh.
///
/// Cheap to clone; clones share all state.
pub struct MeshManager<T: PeerTransport> {
    local: Participant,
    presence: PresenceTracker,
    signaling: SignalingChannel,
    transport: Arc<T>,
    state: Arc<tokio::sync::Mutex<MeshState<T>>>,
    streams_tx: Arc<watch::Sender<Vec<StreamRecord<T>>>>,
    events_tx: broadcast::Sender<MeshEvent>,
}

impl<T: PeerTransport> Clone for MeshManager<T> {
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
            presence: self.presence.clone(),
            signaling: self.signaling.clone(),
            transport: Arc::clone(&self.transport),
            state: Arc::clone(&self.state),
            streams_tx: Arc::clone(&self.streams_tx),
            events_tx: self.events_tx.clone(),
        }
    }
}

impl<T: PeerTransport> MeshManager<T> {
    /// Create a mesh manager for the local participant in one room
    pub fn new(store: RoomStore, local: Participant, transport: Arc<T>) -> Self {
        let presence = PresenceTracker::new(store.clone(), local.clone());
        let signaling = SignalingChannel::new(store, local.id.clone());
        let (streams_tx, _) = watch::channel(Vec::new());
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            local,
            presence,
            signaling,
            transport,
            state: Arc::new(tokio::sync::Mutex::new(MeshState::default())),
            streams_tx: Arc::new(streams_tx),
            events_tx,
        }
    }

    /// The local participant
    pub fn participant(&self) -> &Participant {
        &self.local
    }

    /// Live full snapshot of the active stream records
    pub fn streams(&self) -> watch::Receiver<Vec<StreamRecord<T>>> {
        self.streams_tx.subscribe()
    }

    /// Subscribe to mesh events
    pub fn events(&self) -> broadcast::Receiver<MeshEvent> {
        self.events_tx.subscribe()
    }

    /// Start the mesh.
    ///
    /// Acquires local capture, registers the self stream record, announces
    /// presence, and begins connecting to every currently-visible and
    /// later-discovered peer. Idempotent: a second call while started is a
    /// no-op. If media acquisition fails, the error is returned and the
    /// manager stays in its pre-start state so the caller may retry.
    pub async fn start(&self) -> RoomResult<()> {
        {
            let state = self.state.lock().await;
            if state.started {
                debug!("Mesh already started");
                return Ok(());
            }
        }

        // The only suspending step: waits on permission / device
        let media = self.transport.acquire_media().await?;

        {
            let mut state = self.state.lock().await;
            if state.started {
                // Lost a race with a concurrent start; keep the first capture
                media.stop();
                return Ok(());
            }
            state.started = true;
            state.local_media = Some(media);
            let snapshot = self.stream_snapshot(&state);
            let _ = self.streams_tx.send(snapshot);
        }

        info!(participant = %self.local.id, "Mesh started");
        self.presence.announce();

        // Discovery pipeline: presence callbacks feed a queue drained by a
        // single task, so connection setup never runs inside the watch.
        let (discovered_tx, mut discovered_rx) = mpsc::unbounded_channel();
        let presence_sub = self.presence.watch_peers(move |peer| {
            let _ = discovered_tx.send(peer);
        });
        let manager = self.clone();
        let discovery_task = tokio::spawn(async move {
            while let Some(peer) = discovered_rx.recv().await {
                manager.connect_peer(peer).await;
            }
        });

        let mut state = self.state.lock().await;
        state.presence_sub = Some(presence_sub);
        state.discovery_task = Some(discovery_task);
        Ok(())
    }

    /// Stop the mesh.
    ///
    /// Tears down every connection record (releasing its resources), stops
    /// local capture, and clears all stream records including self.
    pub async fn stop(&self) {
        let (records, media, presence_sub, discovery_task) = {
            let mut state = self.state.lock().await;
            if !state.started {
                return;
            }
            state.started = false;
            let records: Vec<(ParticipantId, PeerRecord<T>)> = state.peers.drain().collect();
            state.remote_streams.clear();
            (
                records,
                state.local_media.take(),
                state.presence_sub.take(),
                state.discovery_task.take(),
            )
        };

        if let Some(task) = discovery_task {
            task.abort();
        }
        drop(presence_sub);

        for (peer, record) in records {
            debug!(%peer, "Closing connection on stop");
            if let Some(handle) = &record.handle {
                handle.close();
            }
            // Pump tasks end on the Closed event each close produces
        }

        // A later start is a fresh session: replayed presence records
        // trigger discovery again
        self.presence.reset();

        if let Some(media) = media {
            media.stop();
        }
        let _ = self.streams_tx.send(Vec::new());
        info!(participant = %self.local.id, "Mesh stopped");
    }

    /// Flip the camera's enabled flag and report the resulting state.
    ///
    /// A media-level mute: no renegotiation, and every connection observes
    /// the same flag. A no-op returning `false` when no capture is active.
    pub async fn toggle_camera(&self) -> bool {
        let state = self.state.lock().await;
        match &state.local_media {
            Some(media) => {
                let next = !media.camera_enabled();
                media.set_camera_enabled(next);
                next
            }
            None => false,
        }
    }

    /// Flip the microphone's enabled flag and report the resulting state.
    ///
    /// Same semantics as [`MeshManager::toggle_camera`].
    pub async fn toggle_microphone(&self) -> bool {
        let state = self.state.lock().await;
        match &state.local_media {
            Some(media) => {
                let next = !media.microphone_enabled();
                media.set_microphone_enabled(next);
                next
            }
            None => false,
        }
    }

    /// Whether the camera track is currently live
    pub async fn camera_enabled(&self) -> bool {
        let state = self.state.lock().await;
        state
            .local_media
            .as_ref()
            .map(|media| media.camera_enabled())
            .unwrap_or(false)
    }

    /// Whether the microphone track is currently live
    pub async fn microphone_enabled(&self) -> bool {
        let state = self.state.lock().await;
        state
            .local_media
            .as_ref()
            .map(|media| media.microphone_enabled())
            .unwrap_or(false)
    }

    /// Whether the mesh is started
    pub async fn is_started(&self) -> bool {
        self.state.lock().await.started
    }

    /// Ids of all peers with a connection record
    pub async fn peer_ids(&self) -> Vec<ParticipantId> {
        self.state.lock().await.peers.keys().cloned().collect()
    }

    /// The negotiated role toward one peer, if a record exists
    pub async fn peer_role(&self, peer: &ParticipantId) -> Option<Role> {
        self.state.lock().await.peers.get(peer).map(|r| r.role)
    }

    /// The lifecycle of one peer's connection, if a record exists
    pub async fn peer_lifecycle(&self, peer: &ParticipantId) -> Option<PeerLifecycle> {
        self.state.lock().await.peers.get(peer).map(|r| r.lifecycle)
    }

    /// Re-announce the local participant's presence.
    ///
    /// Overwrites the presence record with a fresh timestamp; useful after
    /// rejoining so peers that forgot this participant rediscover it.
    pub async fn announce(&self) {
        if self.state.lock().await.started {
            self.presence.announce();
        }
    }

    /// Explicitly close one peer's connection.
    ///
    /// The connection's own close event then removes its records, exactly
    /// as a remote close would. Returns whether a record existed.
    pub async fn disconnect_peer(&self, peer: &ParticipantId) -> bool {
        let handle = {
            let state = self.state.lock().await;
            state
                .peers
                .get(peer)
                .and_then(|record| record.handle.clone())
        };
        match handle {
            Some(handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    /// Connect to a newly discovered peer.
    ///
    /// Ordering discipline per peer: the connection record is created
    /// first, then the inbound signal watch (whose subscribe replays the
    /// current value, so an early-arrived payload is not dropped), and only
    /// then does the connection's outbound pump begin relaying.
    async fn connect_peer(&self, remote: ParticipantId) {
        let role = role_for(&self.local.id, &remote);
        let media = {
            let mut state = self.state.lock().await;
            if !state.started {
                return;
            }
            if state.peers.contains_key(&remote) {
                debug!(peer = %remote, "Connection record already exists");
                return;
            }
            state.peers.insert(
                remote.clone(),
                PeerRecord {
                    role,
                    lifecycle: PeerLifecycle::Negotiating,
                    handle: None,
                    signal_sub: None,
                    pump_task: None,
                },
            );
            match state.local_media.clone() {
                Some(media) => media,
                None => {
                    state.peers.remove(&remote);
                    return;
                }
            }
        };

        info!(peer = %remote, ?role, "Connecting to peer");
        let _ = self.events_tx.send(MeshEvent::PeerDiscovered(remote.clone()));

        let mut handle = match self
            .transport
            .connect(&self.local.id, &remote, role, &media)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(peer = %remote, error = %e, "Connection setup failed");
                self.state.lock().await.peers.remove(&remote);
                self.presence.forget(&remote);
                let _ = self.events_tx.send(MeshEvent::PeerFailed {
                    participant: remote,
                    reason: e.to_string(),
                });
                return;
            }
        };

        let events = handle.take_events();
        let handle = Arc::new(handle);

        // Inbound signals flow into the connection as soon as it exists
        let signal_sub = {
            let handle = handle.clone();
            self.signaling.watch(&remote, move |blob| {
                handle.deliver_signal(blob);
            })
        };

        let pump_task = match events {
            Some(events) => {
                let manager = self.clone();
                let peer = remote.clone();
                tokio::spawn(async move {
                    manager.pump_peer(peer, events).await;
                })
            }
            None => {
                // Unreachable: events are taken exactly once above
                warn!(peer = %remote, "Connection has no event stream");
                self.state.lock().await.peers.remove(&remote);
                return;
            }
        };

        let mut state = self.state.lock().await;
        let started = state.started;
        match state.peers.get_mut(&remote) {
            Some(record) if started => {
                record.handle = Some(handle);
                record.signal_sub = Some(signal_sub);
                record.pump_task = Some(pump_task);
            }
            _ => {
                // Stopped (or cleaned up) while connecting; the close event
                // lets the pump wind down on its own
                handle.close();
                drop(pump_task);
            }
        }
    }

    /// Forward one connection's events until it ends.
    async fn pump_peer(
        &self,
        remote: ParticipantId,
        mut events: mpsc::UnboundedReceiver<PeerEvent<T::RemoteStream>>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                PeerEvent::Signal(blob) => {
                    self.signaling.send(&remote, blob);
                }
                PeerEvent::Connected => {
                    let mut state = self.state.lock().await;
                    if let Some(record) = state.peers.get_mut(&remote) {
                        record.lifecycle = PeerLifecycle::Connected;
                    }
                    drop(state);
                    info!(peer = %remote, "Peer connected");
                    let _ = self.events_tx.send(MeshEvent::PeerConnected(remote.clone()));
                }
                PeerEvent::Stream(stream) => {
                    let snapshot = {
                        let mut state = self.state.lock().await;
                        if !state.started || !state.peers.contains_key(&remote) {
                            continue;
                        }
                        match state
                            .remote_streams
                            .iter_mut()
                            .find(|(peer, _)| peer == &remote)
                        {
                            Some(slot) => slot.1 = stream,
                            None => state.remote_streams.push((remote.clone(), stream)),
                        }
                        self.stream_snapshot(&state)
                    };
                    let _ = self.streams_tx.send(snapshot);
                }
                PeerEvent::Closed => {
                    if self.cleanup_peer(&remote).await {
                        let _ = self.events_tx.send(MeshEvent::PeerClosed(remote.clone()));
                    }
                    break;
                }
                PeerEvent::Failed(reason) => {
                    warn!(peer = %remote, %reason, "Peer connection failed");
                    if self.cleanup_peer(&remote).await {
                        let _ = self.events_tx.send(MeshEvent::PeerFailed {
                            participant: remote.clone(),
                            reason,
                        });
                    }
                    break;
                }
            }
        }
    }

    /// Remove one peer's connection and stream records.
    ///
    /// Isolated to that peer: every other connection keeps running. The
    /// peer is also forgotten in presence, so a still-present record can
    /// trigger a fresh connection attempt (reconnection path). Returns
    /// whether a record existed.
    async fn cleanup_peer(&self, remote: &ParticipantId) -> bool {
        let snapshot = {
            let mut state = self.state.lock().await;
            let Some(record) = state.peers.get(remote) else {
                return false;
            };
            // Release connection resources before the record disappears
            if let Some(handle) = &record.handle {
                handle.close();
            }
            state.peers.remove(remote);
            state.remote_streams.retain(|(peer, _)| peer != remote);
            self.stream_snapshot(&state)
        };

        self.presence.forget(remote);
        let _ = self.streams_tx.send(snapshot);
        debug!(peer = %remote, "Peer records removed");
        true
    }

    /// Build the full stream record snapshot: self first, then remotes in
    /// arrival order.
    fn stream_snapshot(&self, state: &MeshState<T>) -> Vec<StreamRecord<T>> {
        let mut records = Vec::with_capacity(1 + state.remote_streams.len());
        if let Some(media) = &state.local_media {
            records.push(StreamRecord {
                participant: self.local.id.clone(),
                label: self.local.display_name.clone(),
                source: StreamSource::Local(media.clone()),
            });
        }
        for (peer, stream) in &state.remote_streams {
            records.push(StreamRecord {
                participant: peer.clone(),
                label: peer.short(),
                source: StreamSource::Remote(stream.clone()),
            });
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::loopback::LoopbackTransport;
    use super::*;
    use crate::relay::memory::MemoryHub;
    use crate::types::RoomId;

    fn manager() -> (MeshManager<LoopbackTransport>, Arc<LoopbackTransport>) {
        let hub = MemoryHub::new();
        let store = RoomStore::new(Arc::new(hub.client(&RoomId::new("r1"))));
        let transport = Arc::new(LoopbackTransport::new());
        (
            MeshManager::new(store, Participant::new("alice"), transport.clone()),
            transport,
        )
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (mesh, transport) = manager();
        mesh.start().await.unwrap();
        mesh.start().await.unwrap();

        assert!(mesh.is_started().await);
        assert_eq!(transport.acquired_count(), 1);
        let streams = mesh.streams().borrow().clone();
        assert_eq!(streams.len(), 1);
        assert!(streams[0].is_local());
    }

    #[tokio::test]
    async fn test_denied_media_leaves_pre_start_state() {
        let (mesh, transport) = manager();
        transport.set_deny_media(true);

        let err = mesh.start().await.unwrap_err();
        assert!(matches!(err, crate::error::RoomError::Media(_)));
        assert!(!mesh.is_started().await);
        assert!(mesh.streams().borrow().is_empty());

        // The caller may retry once the device is available again
        transport.set_deny_media(false);
        mesh.start().await.unwrap();
        assert!(mesh.is_started().await);
    }

    #[tokio::test]
    async fn test_toggles_are_noops_before_start() {
        let (mesh, _) = manager();
        assert!(!mesh.toggle_camera().await);
        assert!(!mesh.toggle_microphone().await);
        assert!(!mesh.camera_enabled().await);
    }

    #[tokio::test]
    async fn test_toggles_flip_and_report_state() {
        let (mesh, _) = manager();
        mesh.start().await.unwrap();

        assert!(mesh.camera_enabled().await);
        assert!(!mesh.toggle_camera().await);
        assert!(!mesh.camera_enabled().await);
        assert!(mesh.toggle_camera().await);

        assert!(mesh.microphone_enabled().await);
        assert!(!mesh.toggle_microphone().await);
        assert!(mesh.toggle_microphone().await);
    }

    #[tokio::test]
    async fn test_stop_clears_streams_and_capture() {
        let (mesh, _) = manager();
        mesh.start().await.unwrap();
        assert_eq!(mesh.streams().borrow().len(), 1);

        mesh.stop().await;
        assert!(!mesh.is_started().await);
        assert!(mesh.streams().borrow().is_empty());
        assert!(mesh.peer_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_before_start_is_a_noop() {
        let (mesh, _) = manager();
        mesh.stop().await;
        assert!(!mesh.is_started().await);
    }
}
