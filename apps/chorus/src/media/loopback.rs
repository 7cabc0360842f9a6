//! In-memory peer connections.
//!
//! A [`LoopbackNetwork`] links the connections of every local participant in
//! the process. A pair only reaches `connected` when both ends committed the
//! same offer/answer pair and exchanged at least one candidate each, so a
//! negotiation that leaves the two sides disagreeing never "connects". ICE
//! disruptions injected by tests only heal through an ICE restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;
use uuid::Uuid;

use super::{
    ConnectionState, IceCandidate, IceConnectionState, IceServer, LocalTrack, MediaError,
    MediaKind, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink, RemoteTracks,
    SdpKind, SenderId, SessionDescription, SignalingState, TrackRole,
};
use crate::PeerId;

type PairKey = (PeerId, PeerId);

#[derive(Default)]
struct NetworkState {
    peers: HashMap<PairKey, Arc<LoopbackPeer>>,
    next_sender: u64,
}

/// Shared registry of loopback connections keyed by `(local, remote)`.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self, local_peer: impl Into<PeerId>) -> LoopbackFactory {
        LoopbackFactory {
            local_peer: local_peer.into(),
            network: self.clone(),
        }
    }

    /// The live connection `local` holds towards `remote`.
    pub fn peer(&self, local: &str, remote: &str) -> Option<Arc<LoopbackPeer>> {
        self.inner
            .lock()
            .peers
            .get(&(local.to_string(), remote.to_string()))
            .cloned()
    }

    /// Drops media reachability between `a` and `b` until one of them
    /// renegotiates with fresh ICE credentials.
    pub fn disrupt(&self, a: &str, b: &str) {
        for (local, remote) in [(a, b), (b, a)] {
            if let Some(peer) = self.peer(local, remote) {
                peer.mark_disrupted();
            }
        }
    }

    /// Moves both ends of the pair into the terminal `failed` state.
    pub fn fail(&self, a: &str, b: &str) {
        for (local, remote) in [(a, b), (b, a)] {
            if let Some(peer) = self.peer(local, remote) {
                peer.mark_failed();
            }
        }
    }

    pub fn set_audio_level(&self, local: &str, remote: &str, level: Option<f32>) {
        if let Some(peer) = self.peer(local, remote) {
            peer.state.lock().audio_level = level;
        }
    }

    /// Ends every remote track of `kind` that `local` receives from
    /// `remote`, as if the sender's device went away.
    pub fn end_remote_tracks(&self, local: &str, remote: &str, kind: MediaKind) {
        let Some(peer) = self.peer(local, remote) else {
            return;
        };
        let ended: Vec<PeerEvent> = {
            let mut state = peer.state.lock();
            let ids = state.remote_tracks.ids_of(kind);
            ids.iter()
                .filter_map(|id| state.remote_tracks.end(id))
                .collect()
        };
        for event in ended {
            peer.events.emit(event);
        }
    }

    fn register(&self, peer: Arc<LoopbackPeer>) {
        let key = (peer.local_peer.clone(), peer.remote_peer.clone());
        self.inner.lock().peers.insert(key, peer);
    }

    fn unregister(&self, peer: &LoopbackPeer) {
        let key = (peer.local_peer.clone(), peer.remote_peer.clone());
        let mut guard = self.inner.lock();
        if guard
            .peers
            .get(&key)
            .is_some_and(|current| std::ptr::eq(current.as_ref(), peer))
        {
            guard.peers.remove(&key);
        }
    }

    fn next_sender_id(&self) -> SenderId {
        let mut guard = self.inner.lock();
        guard.next_sender += 1;
        SenderId(guard.next_sender)
    }

    /// Promotes both ends to `connected` once their committed descriptions
    /// mirror each other.
    fn try_connect(&self, local: &str, remote: &str) {
        // Serialize pair evaluation on the network lock; peer locks are only
        // taken one at a time underneath it.
        let guard = self.inner.lock();
        let near = guard.peers.get(&(local.to_string(), remote.to_string())).cloned();
        let far = guard.peers.get(&(remote.to_string(), local.to_string())).cloned();
        let (Some(near), Some(far)) = (near, far) else {
            return;
        };
        let near_view = near.link_view();
        let far_view = far.link_view();
        if !near_view.mirrors(&far_view) {
            return;
        }
        near.mark_connected();
        far.mark_connected();
        drop(guard);
    }
}

pub struct LoopbackFactory {
    local_peer: PeerId,
    network: LoopbackNetwork,
}

impl LoopbackFactory {
    pub fn network(&self) -> &LoopbackNetwork {
        &self.network
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackFactory {
    async fn create(
        &self,
        remote_peer: &str,
        ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, MediaError> {
        trace!(
            target = "chorus::media::loopback",
            local = %self.local_peer,
            remote = %remote_peer,
            ice_servers = ice_servers.len(),
            "creating loopback connection"
        );
        let peer = Arc::new(LoopbackPeer {
            local_peer: self.local_peer.clone(),
            remote_peer: remote_peer.to_string(),
            network: self.network.clone(),
            events,
            ice_servers: ice_servers.to_vec(),
            state: Mutex::new(PeerState::new()),
        });
        self.network.register(Arc::clone(&peer));
        Ok(peer)
    }
}

struct PeerState {
    signaling: SignalingState,
    connection: ConnectionState,
    ice: IceConnectionState,
    current_local: Option<String>,
    current_remote: Option<String>,
    pending_local: Option<String>,
    pending_remote: Option<String>,
    ufrag: String,
    disrupted_ufrag: Option<String>,
    version: u64,
    senders: BTreeMap<SenderId, (TrackRole, String)>,
    remote_tracks: RemoteTracks,
    applied_candidates: Vec<String>,
    offers_created: usize,
    audio_level: Option<f32>,
}

impl PeerState {
    fn new() -> Self {
        Self {
            signaling: SignalingState::Stable,
            connection: ConnectionState::New,
            ice: IceConnectionState::New,
            current_local: None,
            current_remote: None,
            pending_local: None,
            pending_remote: None,
            ufrag: fresh_ufrag(),
            disrupted_ufrag: None,
            version: 0,
            senders: BTreeMap::new(),
            remote_tracks: RemoteTracks::default(),
            applied_candidates: Vec::new(),
            offers_created: 0,
            audio_level: None,
        }
    }

    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.signaling == SignalingState::Closed {
            Err(MediaError::Closed)
        } else {
            Ok(())
        }
    }

    fn has_remote_description(&self) -> bool {
        self.current_remote.is_some() || self.pending_remote.is_some()
    }

    fn begin_connecting(&mut self, events: &mut Vec<PeerEvent>) {
        if self.connection == ConnectionState::New {
            self.connection = ConnectionState::Connecting;
            self.ice = IceConnectionState::Checking;
            events.push(PeerEvent::ConnectionStateChanged(ConnectionState::Connecting));
            events.push(PeerEvent::IceConnectionStateChanged(IceConnectionState::Checking));
        }
    }
}

struct LinkView {
    stable: bool,
    usable: bool,
    local: Option<String>,
    remote: Option<String>,
    candidates: usize,
    restarted: bool,
}

impl LinkView {
    fn mirrors(&self, other: &LinkView) -> bool {
        self.stable
            && other.stable
            && self.usable
            && other.usable
            && self.local.is_some()
            && self.remote.is_some()
            && self.local == other.remote
            && self.remote == other.local
            && self.candidates > 0
            && other.candidates > 0
            && self.restarted
            && other.restarted
    }
}

pub struct LoopbackPeer {
    local_peer: PeerId,
    remote_peer: PeerId,
    network: LoopbackNetwork,
    events: PeerEventSink,
    ice_servers: Vec<IceServer>,
    state: Mutex<PeerState>,
}

impl LoopbackPeer {
    pub fn local_peer(&self) -> &str {
        &self.local_peer
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    /// Roles of the senders currently attached, in attach order.
    pub fn sender_roles(&self) -> Vec<TrackRole> {
        self.state
            .lock()
            .senders
            .values()
            .map(|(role, _)| *role)
            .collect()
    }

    pub fn sender_count(&self) -> usize {
        self.state.lock().senders.len()
    }

    /// Remote candidates in the order they were applied.
    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().applied_candidates.clone()
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().offers_created
    }

    /// Committed `(local, remote)` descriptions.
    pub fn committed_descriptions(&self) -> (Option<String>, Option<String>) {
        let state = self.state.lock();
        (state.current_local.clone(), state.current_remote.clone())
    }

    fn emit_all(&self, events: Vec<PeerEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }

    fn link_view(&self) -> LinkView {
        let state = self.state.lock();
        LinkView {
            stable: state.signaling == SignalingState::Stable,
            usable: !state.connection.is_terminal(),
            local: state.current_local.clone(),
            remote: state.current_remote.clone(),
            candidates: state.applied_candidates.len(),
            restarted: state
                .disrupted_ufrag
                .as_ref()
                .is_none_or(|ufrag| *ufrag != state.ufrag),
        }
    }

    fn mark_connected(&self) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            state.disrupted_ufrag = None;
            if state.ice != IceConnectionState::Connected {
                state.ice = IceConnectionState::Connected;
                events.push(PeerEvent::IceConnectionStateChanged(IceConnectionState::Connected));
            }
            if state.connection != ConnectionState::Connected {
                state.connection = ConnectionState::Connected;
                events.push(PeerEvent::ConnectionStateChanged(ConnectionState::Connected));
            }
        }
        self.emit_all(events);
    }

    fn mark_disrupted(&self) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if state.connection.is_terminal() {
                return;
            }
            state.disrupted_ufrag = Some(state.ufrag.clone());
            state.ice = IceConnectionState::Disconnected;
            state.connection = ConnectionState::Disconnected;
            events.push(PeerEvent::IceConnectionStateChanged(IceConnectionState::Disconnected));
            events.push(PeerEvent::ConnectionStateChanged(ConnectionState::Disconnected));
        }
        self.emit_all(events);
    }

    fn mark_failed(&self) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if state.connection.is_terminal() {
                return;
            }
            state.ice = IceConnectionState::Failed;
            state.connection = ConnectionState::Failed;
            events.push(PeerEvent::IceConnectionStateChanged(IceConnectionState::Failed));
            events.push(PeerEvent::ConnectionStateChanged(ConnectionState::Failed));
        }
        self.emit_all(events);
    }

    fn render_sdp(&self, state: &PeerState) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=chorus-peer:{}\r\na=ice-ufrag:{}\r\n",
            self.local_peer.len(),
            state.version,
            self.local_peer,
            state.ufrag
        );
        for (index, (role, track_id)) in state.senders.values().enumerate() {
            let (media, payload) = match role.kind() {
                MediaKind::Audio => ("audio", 111),
                MediaKind::Video => ("video", 96),
            };
            sdp.push_str(&format!(
                "m={media} 9 UDP/TLS/RTP/SAVPF {payload}\r\na=mid:{index}\r\na=sendrecv\r\na=msid:{} {track_id}\r\n",
                self.local_peer
            ));
        }
        sdp
    }

    fn local_candidate(&self, state: &PeerState) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host ufrag {}",
                state.version,
                40000 + state.version,
                state.ufrag
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    fn remote_peer(&self) -> &str {
        &self.remote_peer
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, MediaError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        if !matches!(
            state.signaling,
            SignalingState::Stable | SignalingState::HaveLocalOffer
        ) {
            return Err(MediaError::InvalidState {
                op: "create_offer",
                state: state.signaling,
            });
        }
        if ice_restart {
            state.ufrag = fresh_ufrag();
        }
        state.version += 1;
        state.offers_created += 1;
        Ok(SessionDescription::offer(self.render_sdp(&state)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(MediaError::InvalidState {
                op: "create_answer",
                state: state.signaling,
            });
        }
        // Answering an ICE restart offer rotates our credentials as well.
        let restart = state
            .pending_remote
            .as_deref()
            .zip(state.current_remote.as_deref())
            .is_some_and(|(pending, current)| remote_ufrag(pending) != remote_ufrag(current));
        if restart || state.disrupted_ufrag.as_ref() == Some(&state.ufrag) {
            state.ufrag = fresh_ufrag();
        }
        state.version += 1;
        Ok(SessionDescription::answer(self.render_sdp(&state)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let mut events = Vec::new();
        let settled = {
            let mut state = self.state.lock();
            state.ensure_open()?;
            let settled = match desc.kind {
                SdpKind::Offer => {
                    if !matches!(
                        state.signaling,
                        SignalingState::Stable | SignalingState::HaveLocalOffer
                    ) {
                        return Err(MediaError::InvalidState {
                            op: "set_local_offer",
                            state: state.signaling,
                        });
                    }
                    state.pending_local = Some(desc.sdp);
                    state.signaling = SignalingState::HaveLocalOffer;
                    false
                }
                SdpKind::Answer => {
                    if state.signaling != SignalingState::HaveRemoteOffer {
                        return Err(MediaError::InvalidState {
                            op: "set_local_answer",
                            state: state.signaling,
                        });
                    }
                    state.current_local = Some(desc.sdp);
                    state.current_remote = state.pending_remote.take();
                    state.signaling = SignalingState::Stable;
                    true
                }
            };
            state.begin_connecting(&mut events);
            events.push(PeerEvent::IceCandidate(self.local_candidate(&state)));
            settled
        };
        self.emit_all(events);
        if settled {
            self.network.try_connect(&self.local_peer, &self.remote_peer);
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let (events, settled) = {
            let mut state = self.state.lock();
            state.ensure_open()?;
            match desc.kind {
                SdpKind::Offer => {
                    if !matches!(
                        state.signaling,
                        SignalingState::Stable | SignalingState::HaveRemoteOffer
                    ) {
                        return Err(MediaError::InvalidState {
                            op: "set_remote_offer",
                            state: state.signaling,
                        });
                    }
                    let events = state.remote_tracks.sync(Some(&desc.sdp));
                    state.pending_remote = Some(desc.sdp);
                    state.signaling = SignalingState::HaveRemoteOffer;
                    (events, false)
                }
                SdpKind::Answer => {
                    if state.signaling != SignalingState::HaveLocalOffer {
                        return Err(MediaError::InvalidState {
                            op: "set_remote_answer",
                            state: state.signaling,
                        });
                    }
                    let events = state.remote_tracks.sync(Some(&desc.sdp));
                    state.current_remote = Some(desc.sdp);
                    state.current_local = state.pending_local.take();
                    state.signaling = SignalingState::Stable;
                    (events, true)
                }
            }
        };
        self.emit_all(events);
        if settled {
            self.network.try_connect(&self.local_peer, &self.remote_peer);
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), MediaError> {
        let events = {
            let mut state = self.state.lock();
            state.ensure_open()?;
            match state.signaling {
                SignalingState::HaveLocalOffer => {
                    state.pending_local = None;
                    state.signaling = SignalingState::Stable;
                    Vec::new()
                }
                SignalingState::HaveRemoteOffer => {
                    state.pending_remote = None;
                    state.signaling = SignalingState::Stable;
                    let committed = state.current_remote.clone();
                    state.remote_tracks.sync(committed.as_deref())
                }
                other => {
                    return Err(MediaError::InvalidState {
                        op: "rollback",
                        state: other,
                    });
                }
            }
        };
        self.emit_all(events);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        {
            let mut state = self.state.lock();
            state.ensure_open()?;
            if !state.has_remote_description() {
                return Err(MediaError::NoRemoteDescription);
            }
            if candidate.candidate.is_empty() {
                return Ok(());
            }
            if !candidate.candidate.starts_with("candidate:") {
                return Err(MediaError::Backend(format!(
                    "malformed candidate {:?}",
                    candidate.candidate
                )));
            }
            state.applied_candidates.push(candidate.candidate);
        }
        self.network.try_connect(&self.local_peer, &self.remote_peer);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, MediaError> {
        self.state.lock().ensure_open()?;
        let sender = self.network.next_sender_id();
        self.state
            .lock()
            .senders
            .insert(sender, (track.role(), track.id().to_string()));
        Ok(sender)
    }

    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        let slot = state
            .senders
            .get_mut(&sender)
            .ok_or(MediaError::UnknownSender(sender))?;
        *slot = (track.role(), track.id().to_string());
        Ok(())
    }

    async fn remove_track(&self, sender: SenderId) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state
            .senders
            .remove(&sender)
            .map(|_| ())
            .ok_or(MediaError::UnknownSender(sender))
    }

    async fn audio_level(&self) -> Option<f32> {
        self.state.lock().audio_level
    }

    async fn close(&self) -> Result<(), MediaError> {
        {
            let mut state = self.state.lock();
            if state.signaling == SignalingState::Closed {
                return Ok(());
            }
            state.signaling = SignalingState::Closed;
            state.connection = ConnectionState::Closed;
            state.ice = IceConnectionState::Closed;
        }
        self.network.unregister(self);
        self.events
            .emit(PeerEvent::ConnectionStateChanged(ConnectionState::Closed));
        if let Some(far) = self.network.peer(&self.remote_peer, &self.local_peer) {
            far.mark_disrupted();
        }
        Ok(())
    }
}

fn fresh_ufrag() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn remote_ufrag(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix("a=ice-ufrag:"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::PeerEventEnvelope;
    use tokio::sync::mpsc;

    fn sink(peer: &str) -> (PeerEventSink, mpsc::UnboundedReceiver<PeerEventEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerEventSink::new(peer, 1, tx), rx)
    }

    fn candidate_of(events: &mut mpsc::UnboundedReceiver<PeerEventEnvelope>) -> IceCandidate {
        while let Ok(envelope) = events.try_recv() {
            if let PeerEvent::IceCandidate(candidate) = envelope.event {
                return candidate;
            }
        }
        panic!("no local candidate emitted");
    }

    #[tokio::test]
    async fn offer_answer_pair_connects() {
        let network = LoopbackNetwork::new();
        let (a_sink, mut a_events) = sink("b2");
        let (b_sink, mut b_events) = sink("a1");
        let a = network.factory("a1").create("b2", &[], a_sink).await.unwrap();
        let b = network.factory("b2").create("a1", &[], b_sink).await.unwrap();

        let offer = a.create_offer(false).await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        let a_candidate = candidate_of(&mut a_events);
        let b_candidate = candidate_of(&mut b_events);
        a.add_ice_candidate(b_candidate).await.unwrap();
        assert_eq!(a.connection_state(), ConnectionState::Connecting);
        b.add_ice_candidate(a_candidate).await.unwrap();

        assert_eq!(a.connection_state(), ConnectionState::Connected);
        assert_eq!(b.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn glare_is_rejected_until_rollback() {
        let network = LoopbackNetwork::new();
        let (a_sink, _a_events) = sink("b2");
        let (b_sink, _b_events) = sink("a1");
        let a = network.factory("a1").create("b2", &[], a_sink).await.unwrap();
        let b = network.factory("b2").create("a1", &[], b_sink).await.unwrap();

        let a_offer = a.create_offer(false).await.unwrap();
        a.set_local_description(a_offer).await.unwrap();
        let b_offer = b.create_offer(false).await.unwrap();
        b.set_local_description(b_offer.clone()).await.unwrap();

        let err = a.set_remote_description(b_offer.clone()).await.unwrap_err();
        assert!(matches!(err, MediaError::InvalidState { .. }));
        a.rollback().await.unwrap();
        a.set_remote_description(b_offer).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveRemoteOffer);
    }

    #[tokio::test]
    async fn candidates_need_a_remote_description() {
        let network = LoopbackNetwork::new();
        let (a_sink, _events) = sink("b2");
        let a = network.factory("a1").create("b2", &[], a_sink).await.unwrap();
        let err = a
            .add_ice_candidate(IceCandidate {
                candidate: "candidate:1 1 udp 1 127.0.0.1 1 typ host".into(),
                sdp_mid: None,
                sdp_mline_index: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::NoRemoteDescription));
    }

    #[tokio::test]
    async fn senders_keep_attach_order_across_replace_and_remove() {
        let network = LoopbackNetwork::new();
        let (a_sink, _events) = sink("b2");
        let a = network.factory("a1").create("b2", &[], a_sink).await.unwrap();
        let mic = a.add_track(&LocalTrack::new(TrackRole::Microphone, "mic")).await.unwrap();
        let camera = a.add_track(&LocalTrack::new(TrackRole::Camera, "cam")).await.unwrap();
        let screen = a.add_track(&LocalTrack::new(TrackRole::Screen, "screen")).await.unwrap();
        assert!(mic < camera && camera < screen);

        a.replace_track(mic, &LocalTrack::new(TrackRole::Microphone, "headset"))
            .await
            .unwrap();
        a.remove_track(camera).await.unwrap();

        let peer = network.peer("a1", "b2").expect("registered");
        assert_eq!(peer.sender_roles(), vec![TrackRole::Microphone, TrackRole::Screen]);
        assert!(matches!(
            a.remove_track(camera).await,
            Err(MediaError::UnknownSender(id)) if id == camera
        ));
    }
}
