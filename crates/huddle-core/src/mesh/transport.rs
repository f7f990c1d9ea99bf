//! Peer transport seam: how the mesh opens and drives connections
//!
//! The mesh manager is generic over a [`PeerTransport`]. A transport knows
//! how to acquire local media and how to open one negotiated connection to
//! a remote peer; the manager owns discovery, election, signal relaying,
//! and lifecycle. Negotiation payloads cross this seam as opaque blobs:
//! the transport produces and consumes them, the manager only relays them
//! through the signaling channel.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::election::Role;
use crate::error::RoomResult;
use crate::signaling::SignalBlob;
use crate::types::ParticipantId;

/// Events emitted by one peer connection over its lifetime.
#[derive(Debug)]
pub enum PeerEvent<S> {
    /// An outbound negotiation payload to relay to the remote peer
    Signal(SignalBlob),
    /// The connection is established
    Connected,
    /// A remote media stream arrived (or grew by a track)
    Stream(S),
    /// The connection closed
    Closed,
    /// The connection failed
    Failed(String),
}

/// Control surface of one live connection, held by the manager.
///
/// Implementations must be non-blocking: both methods queue work and
/// return. Malformed inbound blobs are discarded without disturbing the
/// connection.
pub trait PeerLink: Send + Sync {
    /// Feed an inbound negotiation payload received via signaling
    fn deliver_signal(&self, blob: SignalBlob);

    /// Close the connection, releasing its resources. Idempotent. Must
    /// cause a [`PeerEvent::Closed`] on the connection's event stream so
    /// the owner can finish its lifecycle.
    fn close(&self);
}

/// One opened peer connection: its event stream plus its control surface.
pub struct PeerHandle<S> {
    events: Option<mpsc::UnboundedReceiver<PeerEvent<S>>>,
    link: Box<dyn PeerLink>,
}

impl<S> PeerHandle<S> {
    /// Assemble a handle from an event receiver and a link
    pub fn new(events: mpsc::UnboundedReceiver<PeerEvent<S>>, link: Box<dyn PeerLink>) -> Self {
        Self {
            events: Some(events),
            link,
        }
    }

    /// Take the event stream. Yields `Some` exactly once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<PeerEvent<S>>> {
        self.events.take()
    }

    /// Feed an inbound negotiation payload
    pub fn deliver_signal(&self, blob: SignalBlob) {
        self.link.deliver_signal(blob);
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.link.close();
    }
}

/// Local capture control shared by every connection of the mesh.
///
/// All connections hold the same local media by reference; flipping an
/// enabled flag here is a media-level mute observed uniformly by all of
/// them, with no renegotiation.
pub trait LocalMediaControl: Clone + Send + Sync + 'static {
    /// Set whether the camera track is live
    fn set_camera_enabled(&self, enabled: bool);

    /// Whether the camera track is live
    fn camera_enabled(&self) -> bool;

    /// Set whether the microphone track is live
    fn set_microphone_enabled(&self, enabled: bool);

    /// Whether the microphone track is live
    fn microphone_enabled(&self) -> bool;

    /// Stop capture and release the underlying tracks
    fn stop(&self);
}

/// A backend able to acquire local media and open peer connections.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Shared local capture handle
    type LocalMedia: LocalMediaControl;
    /// Remote stream handle delivered by [`PeerEvent::Stream`]
    type RemoteStream: Clone + Send + Sync + 'static;

    /// Acquire camera+microphone capture.
    ///
    /// The only suspending operation in the mesh: completes or fails
    /// asynchronously (permission, device availability). Failure is
    /// surfaced as a distinct media error and must leave no resources
    /// behind.
    async fn acquire_media(&self) -> RoomResult<Self::LocalMedia>;

    /// Open one connection toward a remote peer.
    ///
    /// An initiator begins emitting negotiation payloads immediately; a
    /// responder waits for the inbound offer. The local media is attached
    /// by reference.
    async fn connect(
        &self,
        local: &ParticipantId,
        remote: &ParticipantId,
        role: Role,
        media: &Self::LocalMedia,
    ) -> RoomResult<PeerHandle<Self::RemoteStream>>;
}
