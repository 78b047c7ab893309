use crate::config::Config;
use crate::error::RelayError;
use crate::media::decode::DecodeSettings;
use crate::media::frame::TrackKind;
use crate::media::remote::spawn_remote_reader;
use crate::media::sink::TrackSink;
use crate::session::registry::{Session, SessionRegistry};
use async_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

/// Negotiation state of one peer session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PeerState {
    /// Peer created, offer not yet sent.
    Negotiating,
    /// Offer sent, waiting for the answer and connectivity.
    AwaitingRemote,
    Connected,
    /// Both a video and an audio track are bound.
    StreamReady,
    Failed,
    Closed,
}

impl PeerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Failed | PeerState::Closed)
    }
}

/// ICE candidate as exchanged with the browser.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

/// Payload of a `webrtc-signal` message, in either direction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Signal {
    Offer { sdp: String },
    Answer { sdp: String },
    Ice { candidate: IceCandidate },
}

/// A signal addressed to the browser side of a session.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundSignal {
    pub session_id: String,
    pub signal: Signal,
}

/// Everything that can happen to a session, processed in arrival order.
pub enum SessionEvent {
    Remote(Signal),
    /// Local description is set; the offer goes out before any local candidate.
    LocalOffer(String),
    LocalCandidate(IceCandidate),
    ConnectionState(RTCPeerConnectionState),
    TrackArrived(Arc<TrackSink>),
    TrackEnded { kind: TrackKind, track_id: String },
    Close,
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::Remote(signal) => f.debug_tuple("Remote").field(signal).finish(),
            SessionEvent::LocalOffer(_) => f.write_str("LocalOffer"),
            SessionEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            SessionEvent::ConnectionState(state) => {
                f.debug_tuple("ConnectionState").field(state).finish()
            }
            SessionEvent::TrackArrived(sink) => f.debug_tuple("TrackArrived").field(sink).finish(),
            SessionEvent::TrackEnded { kind, track_id } => f
                .debug_struct("TrackEnded")
                .field("kind", kind)
                .field("track_id", track_id)
                .finish(),
            SessionEvent::Close => f.write_str("Close"),
        }
    }
}

/// State after a connection state change.
pub fn transition(
    current: PeerState,
    change: RTCPeerConnectionState,
    stream_ready: bool,
) -> PeerState {
    match change {
        RTCPeerConnectionState::Connected => match current {
            _ if current.is_terminal() => current,
            _ if stream_ready => PeerState::StreamReady,
            _ => PeerState::Connected,
        },
        RTCPeerConnectionState::Failed if current != PeerState::Closed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        _ => current,
    }
}

/// Applies the registry side of an event to session `id` of registration `epoch`.
///
/// Returns the resulting peer state, or `None` when the session is gone, belongs to a
/// newer registration or the event carries no state.
pub fn apply_event(
    registry: &SessionRegistry,
    id: &str,
    epoch: u64,
    event: &SessionEvent,
) -> Option<PeerState> {
    registry
        .update(id, |session| {
            if session.epoch != epoch {
                return None;
            }
            match event {
                SessionEvent::ConnectionState(change) => {
                    let next = transition(session.peer_state, *change, session.stream_ready);
                    match change {
                        RTCPeerConnectionState::Connected => {
                            info!(session_id = id, "WebRTC connection established")
                        }
                        RTCPeerConnectionState::Failed => {
                            warn!(session_id = id, "WebRTC connection failed")
                        }
                        _ => debug!(session_id = id, state = %change, "WebRTC connection state changed"),
                    }
                    session.peer_state = next;
                }
                SessionEvent::TrackArrived(sink) => {
                    info!(session_id = id, kind = %sink.kind(), track_id = %sink.id(), "Track received");
                    *session.track_slot(sink.kind()) = Some(sink.clone());
                    if session.has_both_tracks() && !session.stream_ready {
                        session.stream_ready = true;
                        info!(session_id = id, "All tracks received, stream ready");
                    }
                    if session.stream_ready && session.peer_state == PeerState::Connected {
                        session.peer_state = PeerState::StreamReady;
                    }
                }
                SessionEvent::TrackEnded { kind, track_id } => {
                    let slot = session.track_slot(*kind);
                    if slot.as_ref().is_some_and(|sink| sink.id() == track_id.as_str()) {
                        slot.take();
                        session.stream_ready = false;
                        if session.peer_state == PeerState::StreamReady {
                            session.peer_state = PeerState::Connected;
                        }
                        info!(session_id = id, %kind, track_id, "Track ended, stream no longer ready");
                    }
                }
                SessionEvent::Remote(_)
                | SessionEvent::LocalOffer(_)
                | SessionEvent::LocalCandidate(_)
                | SessionEvent::Close => {}
            }
            Some(session.peer_state)
        })
        .flatten()
}

/// Stops the encoder, closes the peer and forgets the session.
///
/// Only the registration identified by `epoch` is torn down; returns whether anything
/// was removed.
pub async fn teardown(registry: &SessionRegistry, id: &str, epoch: u64) -> bool {
    let Some(session) = registry.remove_epoch(id, epoch) else {
        return false;
    };
    release(session).await;
    true
}

async fn release(session: Session) {
    let id = session.id.as_str();
    if let Some(events) = &session.events {
        events.close();
    }

    if let Some(encoder) = &session.encoder {
        let outcome = encoder.stop();
        info!(session_id = id, ?outcome, "Stopping encoder for closed session");
    }

    for sink in [&session.video_track, &session.audio_track].into_iter().flatten() {
        sink.end();
    }

    if let Some(peer) = &session.peer {
        if let Err(error) = peer.close().await {
            warn!(session_id = id, ?error, "Failed to close peer connection");
        }
    }

    info!(session_id = id, "Session closed");
}

/// Drives peer sessions: creates the peer for `set-session`, feeds remote signals
/// into it and tears it down again.
#[derive(Clone)]
pub struct PeerController {
    registry: SessionRegistry,
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
    decode: DecodeSettings,
    epochs: Arc<AtomicU64>,
}

impl PeerController {
    pub fn new(registry: SessionRegistry, config: &Config) -> Result<Self, RelayError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut interceptors = Registry::new();
        interceptors = register_default_interceptors(interceptors, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptors)
            .build();

        Ok(Self {
            registry,
            api: Arc::new(api),
            ice_servers: ice_servers(config),
            decode: DecodeSettings::from_config(config),
            epochs: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Creates a receive-only peer for `session_id` and sends the offer to `outbound`.
    ///
    /// An existing session under the same id is torn down first. Returns the epoch of
    /// the new registration.
    pub async fn register(
        &self,
        session_id: &str,
        outbound: Sender<OutboundSignal>,
    ) -> Result<u64, RelayError> {
        if let Some(existing) = self.registry.get(session_id) {
            info!(session_id, "Session registered again, closing previous peer");
            teardown(&self.registry, session_id, existing.epoch).await;
        }

        let peer = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration {
                    ice_servers: self.ice_servers.clone(),
                    ..Default::default()
                })
                .await?,
        );

        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            peer.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        }

        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        let (events_tx, events_rx) = async_channel::unbounded();

        let mut session = Session::new(session_id);
        session.epoch = epoch;
        session.peer = Some(peer.clone());
        session.events = Some(events_tx.clone());
        self.registry.insert(session);

        self.bind_peer_events(session_id, &peer, &events_tx);
        tokio::spawn(run_session(
            self.registry.clone(),
            session_id.to_string(),
            epoch,
            peer.clone(),
            events_rx,
            outbound,
        ));

        if let Err(error) = self.send_offer(session_id, epoch, &peer, &events_tx).await {
            teardown(&self.registry, session_id, epoch).await;
            return Err(error);
        }

        info!(session_id, epoch, "Peer session registered");
        Ok(epoch)
    }

    async fn send_offer(
        &self,
        session_id: &str,
        epoch: u64,
        peer: &RTCPeerConnection,
        events: &Sender<SessionEvent>,
    ) -> Result<(), RelayError> {
        let offer = peer.create_offer(None).await?;
        peer.set_local_description(offer.clone()).await?;

        self.registry.update(session_id, |session| {
            if session.epoch == epoch && session.peer_state == PeerState::Negotiating {
                session.peer_state = PeerState::AwaitingRemote;
            }
        });

        events
            .try_send(SessionEvent::LocalOffer(offer.sdp))
            .map_err(|_| RelayError::Signaling("session event queue closed".into()))?;
        Ok(())
    }

    fn bind_peer_events(
        &self,
        session_id: &str,
        peer: &Arc<RTCPeerConnection>,
        events: &Sender<SessionEvent>,
    ) {
        let tx = events.clone();
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(SessionEvent::LocalCandidate(init.into())).await;
                    }
                    Err(error) => warn!(?error, "Failed to serialize local ICE candidate"),
                }
            })
        }));

        let tx = events.clone();
        peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(SessionEvent::ConnectionState(state)).await;
            })
        }));

        let tx = events.clone();
        let weak_peer = Arc::downgrade(peer);
        let session_id = session_id.to_string();
        let decode = self.decode;
        peer.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();
                let weak_peer = weak_peer.clone();
                let session_id = session_id.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Video => TrackKind::Video,
                        RTPCodecType::Audio => TrackKind::Audio,
                        _ => {
                            warn!(%session_id, "Ignoring track of unknown kind");
                            return;
                        }
                    };

                    let track_id = track.id();
                    let mut sink = TrackSink::new(kind, track_id.clone());
                    if kind == TrackKind::Video {
                        sink = sink.with_keyframe_request(keyframe_request(weak_peer, track.ssrc()));
                    }
                    let sink = Arc::new(sink);

                    let ended_tx = tx.clone();
                    spawn_remote_reader(session_id, track, sink.clone(), decode, move || {
                        let _ = ended_tx.try_send(SessionEvent::TrackEnded { kind, track_id });
                    });

                    let _ = tx.send(SessionEvent::TrackArrived(sink)).await;
                })
            },
        ));
    }

    /// Queues a remote signal for the session.
    pub fn signal(&self, session_id: &str, signal: Signal) -> Result<(), RelayError> {
        self.post(session_id, SessionEvent::Remote(signal))
    }

    pub fn post(&self, session_id: &str, event: SessionEvent) -> Result<(), RelayError> {
        let events = self
            .registry
            .get(session_id)
            .and_then(|session| session.events)
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?;

        events
            .try_send(event)
            .map_err(|_| RelayError::SessionNotFound(session_id.to_string()))
    }

    /// Tears the session down, in order with whatever is already queued for it.
    pub async fn close(&self, session_id: &str) {
        if let Some(session) = self.registry.get(session_id) {
            self.close_epoch(session_id, session.epoch).await;
        }
    }

    /// Like [`close`](Self::close), but leaves a newer registration of the same id alone.
    pub async fn close_epoch(&self, session_id: &str, epoch: u64) {
        let Some(session) = self
            .registry
            .get(session_id)
            .filter(|session| session.epoch == epoch)
        else {
            return;
        };

        let queued = session
            .events
            .as_ref()
            .is_some_and(|events| events.try_send(SessionEvent::Close).is_ok());
        if !queued {
            teardown(&self.registry, session_id, session.epoch).await;
        }
    }

    /// Closes every session, used on shutdown.
    pub async fn close_all(&self) {
        for session in self.registry.clear() {
            release(session).await;
        }
    }
}

fn ice_servers(config: &Config) -> Vec<RTCIceServer> {
    let mut servers = config
        .stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .collect::<Vec<_>>();

    match config.turn_credentials() {
        Some((username, credential)) => {
            servers.push(RTCIceServer {
                urls: config.turn_servers.clone(),
                username: username.to_string(),
                credential: credential.to_string(),
                ..Default::default()
            });
            info!(count = config.turn_servers.len(), "TURN servers enabled");
        }
        None => info!("TURN credentials not configured, using STUN only"),
    }

    servers
}

/// Asks the sender for a fresh key frame so a newly bound consumer does not wait a
/// whole GOP.
fn keyframe_request(peer: Weak<RTCPeerConnection>, media_ssrc: u32) -> Arc<dyn Fn() + Send + Sync> {
    Arc::new(move || {
        let Some(peer) = peer.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let packets: [Box<dyn RtcpPacket + Send + Sync>; 1] = [Box::new(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            })];
            if let Err(error) = peer.write_rtcp(&packets).await {
                debug!(?error, media_ssrc, "Failed to request key frame");
            }
        });
    })
}

async fn run_session(
    registry: SessionRegistry,
    session_id: String,
    epoch: u64,
    peer: Arc<RTCPeerConnection>,
    events: Receiver<SessionEvent>,
    outbound: Sender<OutboundSignal>,
) {
    // local candidates gathered before the offer went out
    let mut held: Option<Vec<IceCandidate>> = Some(Vec::new());

    while let Ok(event) = events.recv().await {
        match event {
            SessionEvent::Remote(signal) => {
                if let Err(error) = apply_remote_signal(&peer, signal).await {
                    warn!(%session_id, ?error, "Failed to apply remote signal");
                }
            }
            SessionEvent::LocalOffer(sdp) => {
                forward(&outbound, &session_id, Signal::Offer { sdp }).await;
                debug!(%session_id, "Offer sent");
                for candidate in held.take().unwrap_or_default() {
                    forward(&outbound, &session_id, Signal::Ice { candidate }).await;
                }
            }
            SessionEvent::LocalCandidate(candidate) => match held.as_mut() {
                Some(held) => held.push(candidate),
                None => forward(&outbound, &session_id, Signal::Ice { candidate }).await,
            },
            SessionEvent::Close => {
                teardown(&registry, &session_id, epoch).await;
                break;
            }
            event => {
                apply_event(&registry, &session_id, epoch, &event);
            }
        }
    }

    debug!(%session_id, epoch, "Session event loop finished");
}

async fn forward(outbound: &Sender<OutboundSignal>, session_id: &str, signal: Signal) {
    let message = OutboundSignal {
        session_id: session_id.to_string(),
        signal,
    };
    if outbound.send(message).await.is_err() {
        debug!(session_id, "Signaling channel gone, dropping outbound signal");
    }
}

async fn apply_remote_signal(peer: &RTCPeerConnection, signal: Signal) -> Result<(), RelayError> {
    match signal {
        Signal::Answer { sdp } => {
            let answer = RTCSessionDescription::answer(sdp)?;
            peer.set_remote_description(answer).await?;
            debug!("Remote answer applied");
        }
        Signal::Ice { candidate } => {
            peer.add_ice_candidate(candidate.into()).await?;
        }
        Signal::Offer { .. } => {
            return Err(RelayError::Signaling(
                "unexpected offer, the relay is always the offerer".into(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sink(kind: TrackKind, id: &str) -> Arc<TrackSink> {
        Arc::new(TrackSink::new(kind, id))
    }

    fn registry_with(id: &str, epoch: u64) -> SessionRegistry {
        let registry = SessionRegistry::new();
        let mut session = Session::new(id);
        session.epoch = epoch;
        registry.insert(session);
        registry
    }

    #[test]
    fn test_transition() {
        use RTCPeerConnectionState as Rtc;

        assert_eq!(transition(PeerState::AwaitingRemote, Rtc::Connected, false), PeerState::Connected);
        assert_eq!(transition(PeerState::AwaitingRemote, Rtc::Connected, true), PeerState::StreamReady);
        assert_eq!(transition(PeerState::Connected, Rtc::Connecting, false), PeerState::Connected);
        assert_eq!(transition(PeerState::StreamReady, Rtc::Disconnected, true), PeerState::StreamReady);
        assert_eq!(transition(PeerState::Connected, Rtc::Failed, false), PeerState::Failed);
        assert_eq!(transition(PeerState::Failed, Rtc::Connected, true), PeerState::Failed);
        assert_eq!(transition(PeerState::Closed, Rtc::Failed, false), PeerState::Closed);
        assert_eq!(transition(PeerState::Connected, Rtc::Closed, false), PeerState::Closed);
    }

    #[test]
    fn test_stream_ready_needs_both_tracks() {
        let registry = registry_with("S1", 1);

        let state = apply_event(
            &registry,
            "S1",
            1,
            &SessionEvent::ConnectionState(RTCPeerConnectionState::Connected),
        );
        assert_eq!(state, Some(PeerState::Connected));

        apply_event(&registry, "S1", 1, &SessionEvent::TrackArrived(sink(TrackKind::Video, "v")));
        assert!(!registry.get("S1").unwrap().stream_ready);

        let state = apply_event(&registry, "S1", 1, &SessionEvent::TrackArrived(sink(TrackKind::Audio, "a")));
        assert_eq!(state, Some(PeerState::StreamReady));
        assert!(registry.get("S1").unwrap().stream_ready);
    }

    #[test]
    fn test_tracks_before_connection_still_ready() {
        let registry = registry_with("S1", 1);
        apply_event(&registry, "S1", 1, &SessionEvent::TrackArrived(sink(TrackKind::Audio, "a")));
        apply_event(&registry, "S1", 1, &SessionEvent::TrackArrived(sink(TrackKind::Video, "v")));

        let state = apply_event(
            &registry,
            "S1",
            1,
            &SessionEvent::ConnectionState(RTCPeerConnectionState::Connected),
        );
        assert_eq!(state, Some(PeerState::StreamReady));
    }

    #[test]
    fn test_track_end_clears_slot_and_readiness() {
        let registry = registry_with("S1", 1);
        apply_event(&registry, "S1", 1, &SessionEvent::TrackArrived(sink(TrackKind::Video, "v1")));
        apply_event(&registry, "S1", 1, &SessionEvent::TrackArrived(sink(TrackKind::Audio, "a1")));

        // a stale end for a track that was already replaced changes nothing
        apply_event(
            &registry,
            "S1",
            1,
            &SessionEvent::TrackEnded { kind: TrackKind::Video, track_id: "v0".into() },
        );
        assert!(registry.get("S1").unwrap().stream_ready);

        let state = apply_event(
            &registry,
            "S1",
            1,
            &SessionEvent::TrackEnded { kind: TrackKind::Video, track_id: "v1".into() },
        );
        assert_eq!(state, Some(PeerState::Negotiating));

        let session = registry.get("S1").unwrap();
        assert!(session.video_track.is_none());
        assert!(session.audio_track.is_some());
        assert!(!session.stream_ready);
    }

    #[test]
    fn test_failure_is_terminal_but_keeps_session() {
        let registry = registry_with("S1", 1);
        apply_event(
            &registry,
            "S1",
            1,
            &SessionEvent::ConnectionState(RTCPeerConnectionState::Failed),
        );
        apply_event(&registry, "S1", 1, &SessionEvent::TrackArrived(sink(TrackKind::Video, "v")));
        apply_event(&registry, "S1", 1, &SessionEvent::TrackArrived(sink(TrackKind::Audio, "a")));

        let session = registry.get("S1").unwrap();
        assert_eq!(session.peer_state, PeerState::Failed);
        assert!(session.stream_ready);
    }

    #[test]
    fn test_events_for_stale_epoch_are_ignored() {
        let registry = registry_with("S1", 2);
        let state = apply_event(&registry, "S1", 1, &SessionEvent::TrackArrived(sink(TrackKind::Video, "v")));
        assert_eq!(state, None);
        assert!(registry.get("S1").unwrap().video_track.is_none());
        assert_eq!(apply_event(&registry, "missing", 1, &SessionEvent::Close), None);
    }

    #[test]
    fn test_signal_wire_format() {
        let signal: Signal = serde_json::from_str(
            r#"{"type":"ice","candidate":{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .unwrap();
        let Signal::Ice { candidate } = &signal else {
            panic!("expected ice signal");
        };
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));

        let outbound = OutboundSignal {
            session_id: "S1".into(),
            signal: Signal::Offer { sdp: "v=0".into() },
        };
        let json = serde_json::to_value(&outbound).unwrap();
        assert_eq!(json["sessionId"], "S1");
        assert_eq!(json["signal"]["type"], "offer");
        assert_eq!(json["signal"]["sdp"], "v=0");
    }

    #[tokio::test]
    async fn test_teardown_stops_sinks_and_removes_session() {
        let registry = registry_with("S1", 1);
        let video = sink(TrackKind::Video, "v");
        registry.update("S1", |session| session.video_track = Some(video.clone()));

        assert!(!teardown(&registry, "S1", 2).await);
        assert!(teardown(&registry, "S1", 1).await);
        assert!(video.is_ended());
        assert!(registry.get("S1").is_none());
        assert!(!teardown(&registry, "S1", 1).await);
    }

    fn offline_config() -> Config {
        Config {
            stun_servers: Vec::new(),
            ..Config::default()
        }
    }

    async fn next_offer(rx: &Receiver<OutboundSignal>) -> String {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("offer within timeout")
                .unwrap();
            if let Signal::Offer { sdp } = message.signal {
                return sdp;
            }
        }
    }

    #[tokio::test]
    async fn test_register_sends_recvonly_offer() {
        let registry = SessionRegistry::new();
        let controller = PeerController::new(registry.clone(), &offline_config()).unwrap();
        let (tx, rx) = async_channel::unbounded();

        let first_epoch = controller.register("S1", tx.clone()).await.unwrap();
        let sdp = next_offer(&rx).await;
        assert!(sdp.contains("m=video"));
        assert!(sdp.contains("m=audio"));
        assert!(sdp.contains("a=recvonly"));

        let session = registry.get("S1").unwrap();
        assert_eq!(session.peer_state, PeerState::AwaitingRemote);
        assert_eq!(session.epoch, first_epoch);

        // registering again replaces the peer
        let second_epoch = controller.register("S1", tx).await.unwrap();
        next_offer(&rx).await;
        assert!(second_epoch > first_epoch);
        assert_eq!(registry.len(), 1);

        // a late close from the first registration does not touch the second
        controller.close_epoch("S1", first_epoch).await;
        assert_eq!(registry.get("S1").unwrap().epoch, second_epoch);

        controller.close("S1").await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.contains("S1") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session removed after close");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_offer_precedes_local_candidates() {
        let registry = SessionRegistry::new();
        let controller = PeerController::new(registry.clone(), &offline_config()).unwrap();

        for n in 0..20 {
            let session_id = format!("S{n}");
            let (tx, rx) = async_channel::unbounded();
            controller.register(&session_id, tx).await.unwrap();

            let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("offer within timeout")
                .unwrap();
            assert_eq!(first.session_id, session_id);
            assert!(
                matches!(first.signal, Signal::Offer { .. }),
                "first outbound signal of {session_id} was {:?}",
                first.signal
            );
            controller.close(&session_id).await;
        }
    }

    #[tokio::test]
    async fn test_signal_unknown_session() {
        let controller = PeerController::new(SessionRegistry::new(), &offline_config()).unwrap();
        let result = controller.signal("nope", Signal::Answer { sdp: String::new() });
        assert!(matches!(result, Err(RelayError::SessionNotFound(_))));
    }
}
