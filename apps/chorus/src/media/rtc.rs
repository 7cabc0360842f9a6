//! webrtc-rs backed peer connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp::extension::audio_level_extension::AudioLevelExtension;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpHeaderExtensionCapability, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::Unmarshal;

use super::{
    ConnectionState, IceCandidate, IceConnectionState, IceServer, LocalTrack, MediaError,
    MediaKind, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink, RemoteTracks,
    SdpKind, SenderId, SessionDescription, SignalingState,
};

/// RFC 6464 client-to-mixer audio level.
pub const AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";

/// Readings older than this no longer describe what the peer is doing.
const LEVEL_TTL: Duration = Duration::from_millis(500);

fn backend(err: webrtc::Error) -> MediaError {
    MediaError::Backend(err.to_string())
}

fn build_api() -> Result<API, MediaError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(backend)?;
    media_engine
        .register_header_extension(
            RTCRtpHeaderExtensionCapability {
                uri: AUDIO_LEVEL_URI.to_owned(),
            },
            RTPCodecType::Audio,
            None,
        )
        .map_err(backend)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(backend)?;

    Ok(APIBuilder::new()
        .with_setting_engine(SettingEngine::default())
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Outbound sample tracks shared by every connection of one participant, so
/// a captured track is encoded once regardless of mesh size.
#[derive(Default)]
pub struct SampleTracks {
    tracks: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
}

impl SampleTracks {
    /// The sample sink the capture pipeline writes `track` into.
    pub fn get_or_create(&self, track: &LocalTrack, stream_id: &str) -> Arc<TrackLocalStaticSample> {
        let mut guard = self.tracks.lock();
        Arc::clone(guard.entry(track.id().to_string()).or_insert_with(|| {
            let mime_type = match track.kind() {
                MediaKind::Audio => MIME_TYPE_OPUS,
                MediaKind::Video => MIME_TYPE_VP8,
            };
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                track.id().to_string(),
                stream_id.to_string(),
            ))
        }))
    }

    pub fn forget(&self, track_id: &str) {
        self.tracks.lock().remove(track_id);
    }
}

/// `-dBov` (0 loudest, 127 silence) as a linear amplitude comparable to
/// the RMS of normalized samples.
pub fn dbov_to_linear(level: u8) -> f32 {
    10f32.powf(-f32::from(level.min(127)) / 20.0)
}

/// Level carried in the packet's audio-level header extension, if the
/// sender attached one.
pub fn level_from_extension(packet: &Packet, extension_id: Option<u8>) -> Option<f32> {
    let mut payload = packet.header.get_extension(extension_id?)?;
    let extension = AudioLevelExtension::unmarshal(&mut payload).ok()?;
    Some(dbov_to_linear(extension.level))
}

/// Latest inbound audio level of each remote audio track being read.
#[derive(Debug, Default)]
pub struct InboundLevels {
    tracks: Mutex<HashMap<String, Option<(f32, Instant)>>>,
}

impl InboundLevels {
    pub fn open(&self, track_id: &str) {
        self.tracks.lock().entry(track_id.to_string()).or_insert(None);
    }

    pub fn record(&self, track_id: &str, level: f32) {
        self.tracks
            .lock()
            .insert(track_id.to_string(), Some((level, Instant::now())));
    }

    pub fn close(&self, track_id: &str) {
        self.tracks.lock().remove(track_id);
    }

    /// Loudest recent reading; silence when audio is received but nothing
    /// fresh was measured, `None` with no remote audio at all.
    pub fn current(&self) -> Option<f32> {
        let tracks = self.tracks.lock();
        if tracks.is_empty() {
            return None;
        }
        let now = Instant::now();
        let loudest = tracks
            .values()
            .flatten()
            .filter(|(_, at)| now.duration_since(*at) <= LEVEL_TTL)
            .map(|(level, _)| *level)
            .fold(0.0_f32, f32::max);
        Some(loudest)
    }
}

/// Energy of decoded Opus frames, used when packets carry no level.
#[cfg(feature = "opus")]
struct DecodedLevel {
    decoder: opus::Decoder,
    pcm: Vec<f32>,
}

#[cfg(feature = "opus")]
impl DecodedLevel {
    // 120 ms of stereo at 48 kHz, the largest Opus frame.
    const MAX_SAMPLES: usize = 5_760 * 2;

    fn new() -> Option<Self> {
        match opus::Decoder::new(48_000, opus::Channels::Stereo) {
            Ok(decoder) => Some(Self {
                decoder,
                pcm: vec![0.0; Self::MAX_SAMPLES],
            }),
            Err(err) => {
                warn!(target = "chorus::media::rtc", error = %err, "opus decoder unavailable");
                None
            }
        }
    }

    fn level(&mut self, payload: &[u8]) -> Option<f32> {
        let frames = self.decoder.decode_float(payload, &mut self.pcm, false).ok()?;
        Some(crate::speaking::rms(&self.pcm[..frames * 2]))
    }
}

/// Reads RTP from a remote audio track until it ends, keeping `levels`
/// current. An ended track is reported as removed unless renegotiation
/// already did so.
fn spawn_audio_reader(
    track: Arc<TrackRemote>,
    extension_id: Option<u8>,
    levels: Arc<InboundLevels>,
    remote_tracks: Arc<Mutex<RemoteTracks>>,
    sink: PeerEventSink,
) {
    tokio::spawn(async move {
        let track_id = track.id();
        levels.open(&track_id);
        #[cfg(feature = "opus")]
        let mut decoded = DecodedLevel::new();
        loop {
            let packet = match track.read_rtp().await {
                Ok((packet, _)) => packet,
                Err(err) => {
                    debug!(
                        target = "chorus::media::rtc",
                        peer_id = %sink.peer_id(),
                        %track_id,
                        error = %err,
                        "remote audio ended"
                    );
                    break;
                }
            };
            let level = level_from_extension(&packet, extension_id);
            #[cfg(feature = "opus")]
            let level = level.or_else(|| {
                decoded
                    .as_mut()
                    .and_then(|decoded| decoded.level(&packet.payload))
            });
            if let Some(level) = level {
                levels.record(&track_id, level);
            }
        }
        levels.close(&track_id);
        let ended = remote_tracks.lock().end(&track_id);
        if let Some(event) = ended {
            sink.emit(event);
        }
    });
}

pub struct RtcFactory {
    local_peer: String,
    api: API,
    samples: Arc<SampleTracks>,
}

impl RtcFactory {
    pub fn new(local_peer: impl Into<String>) -> Result<Self, MediaError> {
        Ok(Self {
            local_peer: local_peer.into(),
            api: build_api()?,
            samples: Arc::new(SampleTracks::default()),
        })
    }

    pub fn samples(&self) -> Arc<SampleTracks> {
        Arc::clone(&self.samples)
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcFactory {
    async fn create(
        &self,
        remote_peer: &str,
        ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, MediaError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        trace!(
            target = "chorus::media::rtc",
            remote = %remote_peer,
            await = "api.new_peer_connection",
            state = "start"
        );
        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(backend)?);
        let remote_tracks = Arc::new(Mutex::new(RemoteTracks::default()));
        let levels = Arc::new(InboundLevels::default());
        install_callbacks(&pc, &events, &remote_tracks, &levels);

        Ok(Arc::new(RtcPeer {
            local_peer: self.local_peer.clone(),
            remote_peer: remote_peer.to_string(),
            pc,
            events,
            samples: Arc::clone(&self.samples),
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(1),
            remote_tracks,
            levels,
        }))
    }
}

fn install_callbacks(
    pc: &Arc<RTCPeerConnection>,
    events: &PeerEventSink,
    remote_tracks: &Arc<Mutex<RemoteTracks>>,
    levels: &Arc<InboundLevels>,
) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    sink.emit(PeerEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }));
                }
                Err(err) => {
                    warn!(target = "chorus::media::rtc", error = %err, "candidate serialization failed")
                }
            }
        })
    }));

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        if let Some(state) = map_connection_state(state) {
            sink.emit(PeerEvent::ConnectionStateChanged(state));
        }
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        if let Some(state) = map_ice_state(state) {
            sink.emit(PeerEvent::IceConnectionStateChanged(state));
        }
        Box::pin(async {})
    }));

    let sink = events.clone();
    let remote_tracks = Arc::clone(remote_tracks);
    let levels = Arc::clone(levels);
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, receiver: Arc<RTCRtpReceiver>, _transceiver| {
            let sink = sink.clone();
            let remote_tracks = Arc::clone(&remote_tracks);
            let levels = Arc::clone(&levels);
            Box::pin(async move {
                debug!(
                    target = "chorus::media::rtc",
                    peer_id = %sink.peer_id(),
                    track_id = %track.id(),
                    kind = %track.kind(),
                    "remote rtp flowing"
                );
                if track.kind() != RTPCodecType::Audio {
                    return;
                }
                let extension_id = receiver
                    .get_parameters()
                    .await
                    .header_extensions
                    .iter()
                    .find(|extension| extension.uri == AUDIO_LEVEL_URI)
                    .and_then(|extension| u8::try_from(extension.id).ok());
                spawn_audio_reader(track, extension_id, levels, remote_tracks, sink);
            })
        },
    ));
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    Some(match state {
        RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        RTCPeerConnectionState::Unspecified => return None,
    })
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        RTCIceConnectionState::Unspecified => return None,
    })
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp).map_err(backend),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp).map_err(backend),
    }
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, MediaError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(MediaError::Backend(format!("unsupported sdp type {other}"))),
    }
}

fn rollback_description() -> RTCSessionDescription {
    let mut rollback = RTCSessionDescription::default();
    rollback.sdp_type = RTCSdpType::Rollback;
    rollback
}

pub struct RtcPeer {
    local_peer: String,
    remote_peer: String,
    pc: Arc<RTCPeerConnection>,
    events: PeerEventSink,
    samples: Arc<SampleTracks>,
    senders: Mutex<HashMap<SenderId, Arc<RTCRtpSender>>>,
    next_sender: AtomicU64,
    remote_tracks: Arc<Mutex<RemoteTracks>>,
    levels: Arc<InboundLevels>,
}

impl RtcPeer {
    fn sender(&self, id: SenderId) -> Result<Arc<RTCRtpSender>, MediaError> {
        self.senders
            .lock()
            .get(&id)
            .cloned()
            .ok_or(MediaError::UnknownSender(id))
    }

    fn emit_track_changes(&self, sdp: Option<&str>) {
        let events = self.remote_tracks.lock().sync(sdp);
        for event in events {
            self.events.emit(event);
        }
    }

    fn sample_track(&self, track: &LocalTrack) -> Arc<dyn TrackLocal + Send + Sync> {
        self.samples.get_or_create(track, &self.local_peer)
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    fn remote_peer(&self) -> &str {
        &self.remote_peer
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
        }
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.pc.connection_state()).unwrap_or(ConnectionState::New)
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        map_ice_state(self.pc.ice_connection_state()).unwrap_or(IceConnectionState::New)
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, MediaError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await.map_err(backend)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self.pc.create_answer(None).await.map_err(backend)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(backend)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let sdp = desc.sdp.clone();
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(backend)?;
        self.emit_track_changes(Some(&sdp));
        Ok(())
    }

    async fn rollback(&self) -> Result<(), MediaError> {
        match self.signaling_state() {
            SignalingState::HaveLocalOffer => self
                .pc
                .set_local_description(rollback_description())
                .await
                .map_err(backend),
            SignalingState::HaveRemoteOffer => {
                self.pc
                    .set_remote_description(rollback_description())
                    .await
                    .map_err(backend)?;
                let committed = self.pc.current_remote_description().await;
                self.emit_track_changes(committed.as_ref().map(|desc| desc.sdp.as_str()));
                Ok(())
            }
            state => Err(MediaError::InvalidState {
                op: "rollback",
                state,
            }),
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        if self.pc.remote_description().await.is_none() {
            return Err(MediaError::NoRemoteDescription);
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await.map_err(backend)
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, MediaError> {
        let sender = self
            .pc
            .add_track(self.sample_track(track))
            .await
            .map_err(backend)?;

        // Drain RTCP so interceptors keep running.
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        let id = SenderId(self.next_sender.fetch_add(1, Ordering::Relaxed));
        self.senders.lock().insert(id, sender);
        Ok(id)
    }

    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> Result<(), MediaError> {
        self.sender(sender)?
            .replace_track(Some(self.sample_track(track)))
            .await
            .map_err(backend)
    }

    async fn remove_track(&self, sender: SenderId) -> Result<(), MediaError> {
        let rtp_sender = self.sender(sender)?;
        self.pc.remove_track(&rtp_sender).await.map_err(backend)?;
        self.senders.lock().remove(&sender);
        Ok(())
    }

    async fn audio_level(&self) -> Option<f32> {
        self.levels.current()
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.senders.lock().clear();
        self.pc.close().await.map_err(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::PeerEventEnvelope;
    use bytes::Bytes;
    use tokio::sync::mpsc;
    use webrtc::util::Marshal;

    fn packet_with_level(id: u8, level: u8) -> Packet {
        let mut packet = Packet::default();
        let payload = AudioLevelExtension { level, voice: true }
            .marshal()
            .expect("marshal level");
        packet.header.set_extension(id, payload).expect("set extension");
        packet.payload = Bytes::from_static(&[0xf8, 0xff, 0xfe]);
        packet
    }

    #[test]
    fn dbov_maps_onto_linear_amplitude() {
        assert!((dbov_to_linear(0) - 1.0).abs() < f32::EPSILON);
        assert!((dbov_to_linear(20) - 0.1).abs() < 1e-4);
        assert!(dbov_to_linear(127) < 1e-6);
    }

    #[test]
    fn level_comes_from_the_negotiated_extension() {
        let packet = packet_with_level(3, 20);
        let level = level_from_extension(&packet, Some(3)).expect("level");
        assert!((level - 0.1).abs() < 1e-4);
        assert_eq!(level_from_extension(&packet, Some(5)), None);
        assert_eq!(level_from_extension(&packet, None), None);
    }

    #[tokio::test(start_paused = true)]
    async fn readings_go_stale_but_open_tracks_stay_audible() {
        let levels = InboundLevels::default();
        assert_eq!(levels.current(), None);

        levels.open("microphone-1");
        assert_eq!(levels.current(), Some(0.0));
        levels.record("microphone-1", 0.4);
        levels.open("screen-audio-2");
        levels.record("screen-audio-2", 0.1);
        assert_eq!(levels.current(), Some(0.4));

        tokio::time::advance(LEVEL_TTL + Duration::from_millis(1)).await;
        assert_eq!(levels.current(), Some(0.0));
        levels.close("microphone-1");
        levels.close("screen-audio-2");
        assert_eq!(levels.current(), None);
    }

    #[tokio::test]
    async fn fresh_connection_has_no_remote_audio() {
        let factory = RtcFactory::new("a1").expect("api");
        let (tx, _rx) = mpsc::unbounded_channel::<PeerEventEnvelope>();
        let peer = factory
            .create("b2", &[], PeerEventSink::new("b2", 1, tx))
            .await
            .expect("peer connection");
        assert_eq!(peer.audio_level().await, None);
        assert_eq!(peer.signaling_state(), SignalingState::Stable);
        peer.close().await.expect("close");
    }
}
