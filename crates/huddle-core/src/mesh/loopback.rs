//! Loopback transport: in-process connections over the real signaling path
//!
//! Performs the same two-phase handshake as a real negotiated transport —
//! the initiator emits an offer blob, the responder answers — but carries
//! no actual media; streams are placeholders. The blobs travel through the
//! real signaling channel, so discovery, election, relay ordering, and
//! lifecycle are exercised end-to-end without devices or network.
//!
//! Connections of the same transport instance are wired together per
//! participant pair: closing one side delivers `Closed` to the other, the
//! way a dying transport session does. Used headless and by the
//! integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::election::Role;
use super::transport::{LocalMediaControl, PeerEvent, PeerHandle, PeerLink, PeerTransport};
use crate::error::{RoomError, RoomResult};
use crate::signaling::SignalBlob;
use crate::types::ParticipantId;

/// Handshake payloads carried as opaque blobs through signaling.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Handshake {
    Offer,
    Answer,
}

/// Placeholder local capture: enabled flags only.
#[derive(Debug, Clone)]
pub struct LoopbackMedia {
    camera: Arc<AtomicBool>,
    microphone: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl LoopbackMedia {
    fn live() -> Self {
        Self {
            camera: Arc::new(AtomicBool::new(true)),
            microphone: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether capture has been released
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl LocalMediaControl for LoopbackMedia {
    fn set_camera_enabled(&self, enabled: bool) {
        self.camera.store(enabled, Ordering::SeqCst);
    }

    fn camera_enabled(&self) -> bool {
        self.camera.load(Ordering::SeqCst)
    }

    fn set_microphone_enabled(&self, enabled: bool) {
        self.microphone.store(enabled, Ordering::SeqCst);
    }

    fn microphone_enabled(&self) -> bool {
        self.microphone.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Placeholder remote stream: identifies the sending peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackStream {
    /// The remote participant this stream belongs to
    pub participant: ParticipantId,
}

/// Unordered participant pair, the wiring key for two link halves
fn pair_key(a: &ParticipantId, b: &ParticipantId) -> (ParticipantId, ParticipantId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

struct LinkHalf {
    /// The participant owning this half
    owner: ParticipantId,
    remote: ParticipantId,
    role: Role,
    events: mpsc::UnboundedSender<PeerEvent<LoopbackStream>>,
    /// The counterpart half, once both sides exist
    peer: Mutex<Option<Weak<LinkHalf>>>,
    connected: Mutex<bool>,
    closed: AtomicBool,
}

impl LinkHalf {
    fn establish(&self) {
        let mut connected = self.connected.lock();
        if *connected || self.closed.load(Ordering::SeqCst) {
            return;
        }
        *connected = true;
        let _ = self.events.send(PeerEvent::Connected);
        let _ = self.events.send(PeerEvent::Stream(LoopbackStream {
            participant: self.remote.clone(),
        }));
    }

    /// Close initiated locally: notify our side and the counterpart
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(PeerEvent::Closed);
        let peer = self.peer.lock().take();
        if let Some(peer) = peer.and_then(|weak| weak.upgrade()) {
            peer.peer_went_away();
        }
    }

    /// The counterpart closed underneath us
    fn peer_went_away(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.peer.lock().take();
        let _ = self.events.send(PeerEvent::Closed);
    }
}

struct LoopbackLink {
    half: Arc<LinkHalf>,
}

impl PeerLink for LoopbackLink {
    fn deliver_signal(&self, blob: SignalBlob) {
        let half = &self.half;
        if half.closed.load(Ordering::SeqCst) {
            return;
        }
        let message: Handshake = match serde_json::from_str(&blob) {
            Ok(message) => message,
            Err(e) => {
                warn!(remote = %half.remote, error = %e, "Discarding malformed signal");
                return;
            }
        };
        match (message, half.role) {
            (Handshake::Offer, Role::Responder) => {
                if *half.connected.lock() {
                    debug!(remote = %half.remote, "Ignoring replayed offer");
                    return;
                }
                let answer = match serde_json::to_string(&Handshake::Answer) {
                    Ok(answer) => answer,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode answer");
                        return;
                    }
                };
                let _ = half.events.send(PeerEvent::Signal(answer));
                half.establish();
            }
            (Handshake::Answer, Role::Initiator) => {
                half.establish();
            }
            (message, role) => {
                debug!(remote = %half.remote, ?message, ?role, "Ignoring out-of-role signal");
            }
        }
    }

    fn close(&self) {
        self.half.close();
    }
}

/// In-process peer transport.
///
/// Share one instance (behind an `Arc`) between the participants that
/// should be able to reach each other.
#[derive(Default)]
pub struct LoopbackTransport {
    deny_media: AtomicBool,
    acquired: AtomicUsize,
    /// Halves waiting for their counterpart, keyed by unordered pair
    pending: Mutex<HashMap<(ParticipantId, ParticipantId), Weak<LinkHalf>>>,
}

impl LoopbackTransport {
    /// Create a transport that grants media and connects every peer
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent media acquisition fail, modeling a denied
    /// permission prompt or missing device
    pub fn set_deny_media(&self, deny: bool) {
        self.deny_media.store(deny, Ordering::SeqCst);
    }

    /// How many times media has been acquired
    pub fn acquired_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Wire a new half to its counterpart, or park it until one appears
    fn wire(&self, half: &Arc<LinkHalf>) {
        let key = pair_key(&half.owner, &half.remote);
        let mut pending = self.pending.lock();
        let counterpart = pending
            .get(&key)
            .and_then(Weak::upgrade)
            .filter(|other| !other.closed.load(Ordering::SeqCst) && other.owner == half.remote);
        match counterpart {
            Some(other) => {
                pending.remove(&key);
                *half.peer.lock() = Some(Arc::downgrade(&other));
                *other.peer.lock() = Some(Arc::downgrade(half));
                debug!(a = %half.owner, b = %half.remote, "Loopback pair wired");
            }
            None => {
                pending.insert(key, Arc::downgrade(half));
            }
        }
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    type LocalMedia = LoopbackMedia;
    type RemoteStream = LoopbackStream;

    async fn acquire_media(&self) -> RoomResult<Self::LocalMedia> {
        if self.deny_media.load(Ordering::SeqCst) {
            return Err(RoomError::Media("capture denied".to_string()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(LoopbackMedia::live())
    }

    async fn connect(
        &self,
        local: &ParticipantId,
        remote: &ParticipantId,
        role: Role,
        _media: &Self::LocalMedia,
    ) -> RoomResult<PeerHandle<Self::RemoteStream>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let half = Arc::new(LinkHalf {
            owner: local.clone(),
            remote: remote.clone(),
            role,
            events: events_tx.clone(),
            peer: Mutex::new(None),
            connected: Mutex::new(false),
            closed: AtomicBool::new(false),
        });

        self.wire(&half);

        if role == Role::Initiator {
            let offer = serde_json::to_string(&Handshake::Offer)
                .map_err(|e| RoomError::Transport(format!("Failed to encode offer: {}", e)))?;
            let _ = events_tx.send(PeerEvent::Signal(offer));
        }

        Ok(PeerHandle::new(events_rx, Box::new(LoopbackLink { half })))
    }
}
