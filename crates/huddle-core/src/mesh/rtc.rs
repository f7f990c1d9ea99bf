//! WebRTC peer transport
//!
//! Real negotiated connections over the `webrtc` crate: offer/answer SDP
//! exchange plus trickled ICE candidates, all serialized as opaque JSON
//! blobs for the signaling channel to round-trip. Local capture is a pair
//! of sample tracks (Opus audio, VP8 video) shared by reference across
//! every connection; the embedder feeds captured frames through
//! [`RtcLocalMedia::write_audio_sample`] / [`write_video_sample`], and a
//! disabled track simply stops accepting samples (media-level mute, no
//! renegotiation).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::election::Role;
use super::transport::{LocalMediaControl, PeerEvent, PeerHandle, PeerLink, PeerTransport};
use crate::error::{RoomError, RoomResult};
use crate::signaling::SignalBlob;
use crate::types::ParticipantId;

/// Negotiation payload as round-tripped through the signaling channel.
///
/// Opaque to every layer except this transport.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: RTCIceCandidateInit },
}

/// Configuration for the WebRTC transport.
#[derive(Debug, Clone)]
pub struct RtcConfig {
    /// STUN servers used for connectivity discovery
    pub stun_servers: Vec<String>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:global.stun.twilio.com:3478?transport=udp".to_string(),
            ],
        }
    }
}

/// Shared local capture: one Opus audio track and one VP8 video track.
///
/// Every peer connection attaches the same two tracks by reference. The
/// enabled flags gate sample writes, so a toggle mutes all connections
/// uniformly.
#[derive(Clone)]
pub struct RtcLocalMedia {
    audio: Arc<TrackLocalStaticSample>,
    video: Arc<TrackLocalStaticSample>,
    camera: Arc<AtomicBool>,
    microphone: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl RtcLocalMedia {
    fn create() -> Self {
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            "huddle-local".to_string(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video".to_string(),
            "huddle-local".to_string(),
        ));
        Self {
            audio,
            video,
            camera: Arc::new(AtomicBool::new(true)),
            microphone: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Feed one captured audio sample. Silently dropped while the
    /// microphone is muted or capture is stopped.
    pub async fn write_audio_sample(&self, sample: &Sample) -> RoomResult<()> {
        if self.stopped.load(Ordering::SeqCst) || !self.microphone.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.audio
            .write_sample(sample)
            .await
            .map_err(|e| RoomError::Media(format!("Failed to write audio sample: {}", e)))
    }

    /// Feed one captured video sample. Silently dropped while the camera
    /// is muted or capture is stopped.
    pub async fn write_video_sample(&self, sample: &Sample) -> RoomResult<()> {
        if self.stopped.load(Ordering::SeqCst) || !self.camera.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.video
            .write_sample(sample)
            .await
            .map_err(|e| RoomError::Media(format!("Failed to write video sample: {}", e)))
    }
}

impl LocalMediaControl for RtcLocalMedia {
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

/// A remote peer's media: the set of inbound tracks for one connection.
///
/// Created when the connection opens and grows as tracks arrive; the same
/// handle is re-delivered on each new track so consumers always hold the
/// full set.
#[derive(Clone)]
pub struct RtcRemoteStream {
    /// The remote participant this stream belongs to
    pub participant: ParticipantId,
    tracks: Arc<parking_lot::Mutex<Vec<Arc<TrackRemote>>>>,
}

impl RtcRemoteStream {
    fn new(participant: ParticipantId) -> Self {
        Self {
            participant,
            tracks: Arc::new(parking_lot::Mutex::new(Vec::new())),
        }
    }

    /// The inbound tracks received so far
    pub fn tracks(&self) -> Vec<Arc<TrackRemote>> {
        self.tracks.lock().clone()
    }
}

struct LinkShared {
    remote: ParticipantId,
    role: Role,
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<PeerEvent<RtcRemoteStream>>,
    /// Candidates that arrived before the remote description
    pending_candidates: tokio::sync::Mutex<Vec<RTCIceCandidateInit>>,
    remote_description_set: AtomicBool,
    closed: AtomicBool,
    /// Held so the attached local tracks are not cleaned up
    _senders: Vec<Arc<RTCRtpSender>>,
}

impl LinkShared {
    /// Apply one inbound payload. Every failure is logged and swallowed;
    /// a bad payload must never take down the connection or the loop
    /// feeding it.
    async fn handle_signal(&self, blob: SignalBlob) {
        let payload: SignalPayload = match serde_json::from_str(&blob) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(remote = %self.remote, error = %e, "Discarding malformed signal");
                return;
            }
        };

        match payload {
            SignalPayload::Offer { sdp } => {
                if self.role != Role::Responder {
                    debug!(remote = %self.remote, "Ignoring offer: not the responder");
                    return;
                }
                if self.remote_description_set.load(Ordering::SeqCst) {
                    debug!(remote = %self.remote, "Ignoring replayed offer");
                    return;
                }
                let offer = match RTCSessionDescription::offer(sdp) {
                    Ok(offer) => offer,
                    Err(e) => {
                        warn!(remote = %self.remote, error = %e, "Discarding unparseable offer");
                        return;
                    }
                };
                if let Err(e) = self.pc.set_remote_description(offer).await {
                    warn!(remote = %self.remote, error = %e, "Failed to apply offer");
                    return;
                }
                self.remote_description_set.store(true, Ordering::SeqCst);
                self.drain_pending_candidates().await;

                let answer = match self.pc.create_answer(None).await {
                    Ok(answer) => answer,
                    Err(e) => {
                        warn!(remote = %self.remote, error = %e, "Failed to create answer");
                        return;
                    }
                };
                if let Err(e) = self.pc.set_local_description(answer).await {
                    warn!(remote = %self.remote, error = %e, "Failed to set local answer");
                    return;
                }
                let Some(local) = self.pc.local_description().await else {
                    warn!(remote = %self.remote, "No local description after answer");
                    return;
                };
                self.emit_payload(SignalPayload::Answer { sdp: local.sdp });
            }
            SignalPayload::Answer { sdp } => {
                if self.role != Role::Initiator {
                    debug!(remote = %self.remote, "Ignoring answer: not the initiator");
                    return;
                }
                if self.remote_description_set.load(Ordering::SeqCst) {
                    debug!(remote = %self.remote, "Ignoring replayed answer");
                    return;
                }
                let answer = match RTCSessionDescription::answer(sdp) {
                    Ok(answer) => answer,
                    Err(e) => {
                        warn!(remote = %self.remote, error = %e, "Discarding unparseable answer");
                        return;
                    }
                };
                if let Err(e) = self.pc.set_remote_description(answer).await {
                    warn!(remote = %self.remote, error = %e, "Failed to apply answer");
                    return;
                }
                self.remote_description_set.store(true, Ordering::SeqCst);
                self.drain_pending_candidates().await;
            }
            SignalPayload::Candidate { candidate } => {
                if !self.remote_description_set.load(Ordering::SeqCst) {
                    self.pending_candidates.lock().await.push(candidate);
                    return;
                }
                if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                    warn!(remote = %self.remote, error = %e, "Discarding bad ICE candidate");
                }
            }
        }
    }

    async fn drain_pending_candidates(&self) {
        let pending: Vec<RTCIceCandidateInit> =
            std::mem::take(&mut *self.pending_candidates.lock().await);
        for candidate in pending {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                warn!(remote = %self.remote, error = %e, "Discarding queued ICE candidate");
            }
        }
    }

    fn emit_payload(&self, payload: SignalPayload) {
        match serde_json::to_string(&payload) {
            Ok(blob) => {
                let _ = self.events.send(PeerEvent::Signal(blob));
            }
            Err(e) => warn!(remote = %self.remote, error = %e, "Failed to encode payload"),
        }
    }
}

struct RtcLink {
    shared: Arc<LinkShared>,
}

impl PeerLink for RtcLink {
    fn deliver_signal(&self, blob: SignalBlob) {
        if self.shared.closed.load(Ordering::SeqCst) {
            return;
        }
        let shared = self.shared.clone();
        tokio::spawn(async move {
            shared.handle_signal(blob).await;
        });
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = shared.pc.close().await {
                warn!(remote = %shared.remote, error = %e, "Error closing connection");
            }
        });
    }
}

/// Peer transport over the `webrtc` crate.
#[derive(Debug, Default)]
pub struct RtcTransport {
    config: RtcConfig,
}

impl RtcTransport {
    /// Create a transport with the given configuration
    pub fn new(config: RtcConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    type LocalMedia = RtcLocalMedia;
    type RemoteStream = RtcRemoteStream;

    async fn acquire_media(&self) -> RoomResult<Self::LocalMedia> {
        // Track creation itself cannot be denied; device capture is the
        // embedder's side of the seam and feeds samples in.
        Ok(RtcLocalMedia::create())
    }

    async fn connect(
        &self,
        local: &ParticipantId,
        remote: &ParticipantId,
        role: Role,
        media: &Self::LocalMedia,
    ) -> RoomResult<PeerHandle<Self::RemoteStream>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| RoomError::Transport(format!("Failed to register codecs: {}", e)))?;
        let interceptors = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| RoomError::Transport(format!("Failed to register interceptors: {}", e)))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptors)
            .build();

        let ice_servers: Vec<RTCIceServer> = self
            .config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(|e| RoomError::Transport(format!("Failed to create connection: {}", e)))?,
        );

        info!(%local, %remote, ?role, "Opening peer connection");

        // The shared local tracks ride every connection; keep the senders
        // so the tracks stay attached.
        let audio_sender = pc
            .add_track(media.audio.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| RoomError::Transport(format!("Failed to add audio track: {}", e)))?;
        let video_sender = pc
            .add_track(media.video.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| RoomError::Transport(format!("Failed to add video track: {}", e)))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stream = RtcRemoteStream::new(remote.clone());

        // Trickled candidates go out as they are gathered
        {
            let events_tx = events_tx.clone();
            let remote = remote.clone();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events_tx = events_tx.clone();
                let remote = remote.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => {
                            match serde_json::to_string(&SignalPayload::Candidate {
                                candidate: init,
                            }) {
                                Ok(blob) => {
                                    let _ = events_tx.send(PeerEvent::Signal(blob));
                                }
                                Err(e) => {
                                    warn!(%remote, error = %e, "Failed to encode candidate")
                                }
                            }
                        }
                        Err(e) => warn!(%remote, error = %e, "Failed to serialize candidate"),
                    }
                })
            }));
        }

        // Each inbound track grows the peer's stream and re-delivers it
        {
            let events_tx = events_tx.clone();
            let stream = stream.clone();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let events_tx = events_tx.clone();
                let stream = stream.clone();
                Box::pin(async move {
                    debug!(participant = %stream.participant, kind = %track.kind(), "Remote track added");
                    stream.tracks.lock().push(track);
                    let _ = events_tx.send(PeerEvent::Stream(stream.clone()));
                })
            }));
        }

        {
            let events_tx = events_tx.clone();
            let remote = remote.clone();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events_tx = events_tx.clone();
                let remote = remote.clone();
                Box::pin(async move {
                    debug!(%remote, ?state, "Connection state changed");
                    match state {
                        RTCPeerConnectionState::Connected => {
                            let _ = events_tx.send(PeerEvent::Connected);
                        }
                        RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                            let _ = events_tx.send(PeerEvent::Closed);
                        }
                        RTCPeerConnectionState::Failed => {
                            let _ = events_tx
                                .send(PeerEvent::Failed("connection failed".to_string()));
                        }
                        _ => {}
                    }
                })
            }));
        }

        let shared = Arc::new(LinkShared {
            remote: remote.clone(),
            role,
            pc: pc.clone(),
            events: events_tx.clone(),
            pending_candidates: tokio::sync::Mutex::new(Vec::new()),
            remote_description_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            _senders: vec![audio_sender, video_sender],
        });

        // The initiator emits its offer as the first outbound payload
        if role == Role::Initiator {
            let offer = pc
                .create_offer(None)
                .await
                .map_err(|e| RoomError::Transport(format!("Failed to create offer: {}", e)))?;
            pc.set_local_description(offer)
                .await
                .map_err(|e| RoomError::Transport(format!("Failed to set local offer: {}", e)))?;
            let local_desc = pc.local_description().await.ok_or_else(|| {
                RoomError::Transport("No local description after offer".to_string())
            })?;
            shared.emit_payload(SignalPayload::Offer {
                sdp: local_desc.sdp,
            });
        }

        Ok(PeerHandle::new(events_rx, Box::new(RtcLink { shared })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_payload_roundtrip() {
        let payload = SignalPayload::Offer {
            sdp: "v=0\r\no=- ...".to_string(),
        };
        let blob = serde_json::to_string(&payload).unwrap();
        assert!(blob.contains("\"type\":\"offer\""));
        let parsed: SignalPayload = serde_json::from_str(&blob).unwrap();
        assert!(matches!(parsed, SignalPayload::Offer { .. }));
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        assert!(serde_json::from_str::<SignalPayload>("not json").is_err());
        assert!(serde_json::from_str::<SignalPayload>("{\"type\":\"bogus\"}").is_err());
    }

    #[test]
    fn test_default_config_has_stun_servers() {
        let config = RtcConfig::default();
        assert!(!config.stun_servers.is_empty());
        assert!(config.stun_servers[0].starts_with("stun:"));
    }

    #[tokio::test]
    async fn test_local_media_toggles() {
        let transport = RtcTransport::default();
        let media = transport.acquire_media().await.unwrap();
        assert!(media.camera_enabled());
        media.set_camera_enabled(false);
        assert!(!media.camera_enabled());
        assert!(media.microphone_enabled());
        media.set_microphone_enabled(false);
        assert!(!media.microphone_enabled());
    }

    #[tokio::test]
    async fn test_muted_media_drops_samples() {
        let transport = RtcTransport::default();
        let media = transport.acquire_media().await.unwrap();
        media.set_microphone_enabled(false);
        // With no attached connection a live write would fail; a muted
        // write is dropped before reaching the track.
        let sample = Sample {
            data: bytes::Bytes::from_static(&[0u8; 4]),
            duration: std::time::Duration::from_millis(20),
            ..Default::default()
        };
        assert!(media.write_audio_sample(&sample).await.is_ok());
    }
}
