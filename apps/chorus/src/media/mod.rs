use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::PeerId;

pub mod devices;
pub mod loopback;
pub mod rtc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// Logical role of an outbound track. Each role owns at most one sender per
/// peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackRole {
    Microphone,
    Camera,
    Screen,
    ScreenAudio,
}

impl TrackRole {
    pub const ALL: [TrackRole; 4] = [
        TrackRole::Microphone,
        TrackRole::Camera,
        TrackRole::Screen,
        TrackRole::ScreenAudio,
    ];

    pub fn kind(self) -> MediaKind {
        match self {
            TrackRole::Microphone | TrackRole::ScreenAudio => MediaKind::Audio,
            TrackRole::Camera | TrackRole::Screen => MediaKind::Video,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrackRole::Microphone => "microphone",
            TrackRole::Camera => "camera",
            TrackRole::Screen => "screen",
            TrackRole::ScreenAudio => "screen-audio",
        }
    }

    /// Recovers the role from a track id minted by [`LocalTrack::new`].
    pub fn from_track_id(track_id: &str) -> Option<Self> {
        // Longest prefix first: "screen-audio-" also starts with "screen-".
        [
            TrackRole::ScreenAudio,
            TrackRole::Microphone,
            TrackRole::Camera,
            TrackRole::Screen,
        ]
        .into_iter()
        .find(|role| {
            track_id
                .strip_prefix(role.as_str())
                .is_some_and(|rest| rest.starts_with('-'))
        })
    }
}

impl fmt::Display for TrackRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a captured local track. Clones share the enabled flag.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    role: TrackRole,
    label: String,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(role: TrackRole, label: impl Into<String>) -> Self {
        Self {
            id: format!("{}-{}", role.as_str(), Uuid::new_v4().simple()),
            role,
            label: label.into(),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> TrackRole {
        self.role
    }

    pub fn kind(&self) -> MediaKind {
        self.role.kind()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for LocalTrack {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SenderId(pub u64);

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sender#{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Aggregate connection state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media-layer reachability of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    IceCandidate(IceCandidate),
    ConnectionStateChanged(ConnectionState),
    IceConnectionStateChanged(IceConnectionState),
    RemoteTrackAdded {
        track_id: String,
        kind: MediaKind,
        role: Option<TrackRole>,
    },
    RemoteTrackRemoved {
        track_id: String,
        kind: MediaKind,
        role: Option<TrackRole>,
    },
}

/// A media-layer callback tagged with the connection it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEventEnvelope {
    pub peer_id: PeerId,
    /// Distinguishes successive connections to the same peer.
    pub generation: u64,
    pub event: PeerEvent,
}

/// Delivers media-layer callbacks into the owning session.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    peer_id: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEventEnvelope>,
}

impl PeerEventSink {
    pub fn new(
        peer_id: impl Into<PeerId>,
        generation: u64,
        tx: mpsc::UnboundedSender<PeerEventEnvelope>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            generation,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Returns false once the session is gone.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(PeerEventEnvelope {
                peer_id: self.peer_id.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("peer connection closed")]
    Closed,
    #[error("{op} not allowed in signaling state {state:?}")]
    InvalidState {
        op: &'static str,
        state: SignalingState,
    },
    #[error("remote description not set")]
    NoRemoteDescription,
    #[error("unknown sender {0}")]
    UnknownSender(SenderId),
    #[error("media backend error: {0}")]
    Backend(String),
}

/// The media transport to one remote participant.
///
/// Implementations are driven exclusively by the owning channel session;
/// state getters reflect the transport's own view and may change between
/// awaits.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn remote_peer(&self) -> &str;
    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> ConnectionState;
    fn ice_connection_state(&self) -> IceConnectionState;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, MediaError>;
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError>;
    /// Discards a pending local or remote offer and returns to stable.
    async fn rollback(&self) -> Result<(), MediaError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, MediaError>;
    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> Result<(), MediaError>;
    async fn remove_track(&self, sender: SenderId) -> Result<(), MediaError>;

    /// Inbound audio level in `0.0..=1.0` from RTP statistics, when the
    /// backend exposes it.
    async fn audio_level(&self) -> Option<f32>;

    async fn close(&self) -> Result<(), MediaError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        remote_peer: &str,
        ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, MediaError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncedTrack {
    pub track_id: String,
    pub kind: MediaKind,
}

/// Tracks the remote side is actively sending according to `sdp`.
///
/// Media sections that are rejected (port 0) or not sending (`recvonly`,
/// `inactive`) are skipped.
pub fn announced_tracks(sdp: &str) -> Vec<AnnouncedTrack> {
    let mut tracks = Vec::new();
    let mut seen = HashSet::new();
    let mut section: Option<SectionScan> = None;

    for line in sdp.lines().map(str::trim) {
        if let Some(media) = line.strip_prefix("m=") {
            if let Some(done) = section.take() {
                done.collect_into(&mut tracks, &mut seen);
            }
            section = SectionScan::start(media);
            continue;
        }
        let Some(current) = section.as_mut() else {
            continue;
        };
        match line {
            "a=recvonly" | "a=inactive" => current.sending = false,
            _ => {
                if let Some(msid) = line.strip_prefix("a=msid:") {
                    if let Some(track_id) = msid.split_whitespace().nth(1) {
                        current.track_ids.push(track_id.to_string());
                    }
                }
            }
        }
    }
    if let Some(done) = section.take() {
        done.collect_into(&mut tracks, &mut seen);
    }
    tracks
}

/// The remote track set last announced by a peer, diffed on every applied
/// remote description.
#[derive(Debug, Default)]
pub struct RemoteTracks {
    tracks: BTreeMap<String, MediaKind>,
}

impl RemoteTracks {
    /// Replaces the announced set with the one in `sdp` (none when `None`)
    /// and returns the add/remove events describing the change.
    pub fn sync(&mut self, sdp: Option<&str>) -> Vec<PeerEvent> {
        let next: BTreeMap<String, MediaKind> = sdp
            .map(announced_tracks)
            .unwrap_or_default()
            .into_iter()
            .map(|track| (track.track_id, track.kind))
            .collect();
        let mut events = Vec::new();
        for (track_id, kind) in &self.tracks {
            if !next.contains_key(track_id) {
                events.push(PeerEvent::RemoteTrackRemoved {
                    track_id: track_id.clone(),
                    kind: *kind,
                    role: TrackRole::from_track_id(track_id),
                });
            }
        }
        for (track_id, kind) in &next {
            if !self.tracks.contains_key(track_id) {
                events.push(PeerEvent::RemoteTrackAdded {
                    track_id: track_id.clone(),
                    kind: *kind,
                    role: TrackRole::from_track_id(track_id),
                });
            }
        }
        self.tracks = next;
        events
    }

    /// Forgets a track that stopped delivering media without a new remote
    /// description.
    pub fn end(&mut self, track_id: &str) -> Option<PeerEvent> {
        let kind = self.tracks.remove(track_id)?;
        Some(PeerEvent::RemoteTrackRemoved {
            track_id: track_id.to_string(),
            kind,
            role: TrackRole::from_track_id(track_id),
        })
    }

    pub fn ids_of(&self, kind: MediaKind) -> Vec<String> {
        self.tracks
            .iter()
            .filter(|(_, k)| **k == kind)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

struct SectionScan {
    kind: MediaKind,
    sending: bool,
    track_ids: Vec<String>,
}

impl SectionScan {
    fn start(media_line: &str) -> Option<Self> {
        let mut parts = media_line.split_whitespace();
        let kind = match parts.next()? {
            "audio" => MediaKind::Audio,
            "video" => MediaKind::Video,
            _ => return None,
        };
        let port = parts.next()?;
        Some(Self {
            kind,
            sending: port != "0",
            track_ids: Vec::new(),
        })
    }

    fn collect_into(self, tracks: &mut Vec<AnnouncedTrack>, seen: &mut HashSet<String>) {
        if !self.sending {
            return;
        }
        for track_id in self.track_ids {
            if seen.insert(track_id.clone()) {
                tracks.push(AnnouncedTrack {
                    track_id,
                    kind: self.kind,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_recovered_from_track_id() {
        let track = LocalTrack::new(TrackRole::ScreenAudio, "system audio");
        assert_eq!(TrackRole::from_track_id(track.id()), Some(TrackRole::ScreenAudio));
        let screen = LocalTrack::new(TrackRole::Screen, "display");
        assert_eq!(TrackRole::from_track_id(screen.id()), Some(TrackRole::Screen));
        assert_eq!(TrackRole::from_track_id("webcam-123"), None);
    }

    #[test]
    fn announced_tracks_skip_inactive_sections() {
        let sdp = "v=0\r\n\
                   m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
                   a=sendrecv\r\n\
                   a=msid:s1 microphone-aa\r\n\
                   m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
                   a=inactive\r\n\
                   a=msid:s1 camera-bb\r\n\
                   m=video 0 UDP/TLS/RTP/SAVPF 96\r\n\
                   a=msid:s1 screen-cc\r\n\
                   m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
                   a=sendonly\r\n\
                   a=msid:s1 screen-dd\r\n";
        let tracks = announced_tracks(sdp);
        assert_eq!(
            tracks,
            vec![
                AnnouncedTrack {
                    track_id: "microphone-aa".into(),
                    kind: MediaKind::Audio
                },
                AnnouncedTrack {
                    track_id: "screen-dd".into(),
                    kind: MediaKind::Video
                },
            ]
        );
    }

    #[test]
    fn remote_track_diff_reports_add_then_remove() {
        let mut remote = RemoteTracks::default();
        let with_camera = "m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=msid:b2 camera-1\r\n";
        let events = remote.sync(Some(with_camera));
        assert!(matches!(
            events.as_slice(),
            [PeerEvent::RemoteTrackAdded { role: Some(TrackRole::Camera), .. }]
        ));
        assert!(remote.sync(Some(with_camera)).is_empty());
        let events = remote.sync(Some("v=0\r\n"));
        assert!(matches!(
            events.as_slice(),
            [PeerEvent::RemoteTrackRemoved { role: Some(TrackRole::Camera), .. }]
        ));
        assert!(remote.is_empty());
    }

    #[test]
    fn ended_track_is_forgotten_once() {
        let mut remote = RemoteTracks::default();
        remote.sync(Some(
            "m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=msid:b2 microphone-1\r\n\
             m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=msid:b2 camera-1\r\n",
        ));
        assert_eq!(remote.ids_of(MediaKind::Audio), vec!["microphone-1".to_string()]);
        assert!(matches!(
            remote.end("microphone-1"),
            Some(PeerEvent::RemoteTrackRemoved { kind: MediaKind::Audio, role: Some(TrackRole::Microphone), .. })
        ));
        assert_eq!(remote.end("microphone-1"), None);
        assert_eq!(remote.len(), 1);
    }

    #[test]
    fn ice_candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let json = serde_json::to_value(&candidate).expect("serialize");
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
    }
}
