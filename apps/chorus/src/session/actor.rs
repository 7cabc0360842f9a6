//! The per-channel event loop.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::peer::{AnswerOutcome, Outbox, PeerSession};
use super::timer::{TaskScheduler, TimerFired};
use super::{
    ChannelSnapshot, PeerSnapshot, SessionCommand, SessionDeps, SessionError, SessionEvent,
    SessionTiming,
};
use crate::PeerId;
use crate::av_sync::{AvSyncCorrector, PlaybackClocks, SyncOutcome, SyncState};
use crate::health::{ChannelStatus, HealthAction, HealthMonitor, aggregate_status};
use crate::ice_buffer::IceCandidateBuffer;
use crate::media::devices::{
    CaptureDevices, CaptureError, DeviceKind, DevicePreferences, acquire_camera,
    acquire_microphone,
};
use crate::media::{
    ConnectionState, IceCandidate, IceServer, LocalTrack, MediaKind, PeerConnectionFactory,
    PeerEvent, PeerEventEnvelope, PeerEventSink, SessionDescription, SignalingState, TrackRole,
};
use crate::negotiation::{AnswerIntake, NegotiationState, OfferGate, OfferIntake, Reconsideration, Role};
use crate::scheduler::{ConnectionScheduler, Tier, plan_batches};
use crate::signaling::{Participant, ReconnectTarget, SignalMessage, SignalSink};
use crate::speaking::{SpeakingDetector, rms};
use crate::tracks::TrackBindings;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TimerKey {
    /// A held remote offer is due for another look.
    Reconsider(PeerId),
    Renegotiate(PeerId),
    OfferRetry(PeerId),
    SchedulerWake,
    HealthCheck,
    Heartbeat,
    LocalSpeaking,
    RemoteSpeaking,
    AvSync,
}

impl TimerKey {
    fn peer(&self) -> Option<&str> {
        match self {
            TimerKey::Reconsider(peer) | TimerKey::Renegotiate(peer) | TimerKey::OfferRetry(peer) => {
                Some(peer)
            }
            _ => None,
        }
    }
}

pub(super) struct ChannelActor {
    channel_id: String,
    local_id: PeerId,
    display_name: Option<String>,
    timing: SessionTiming,
    factory: Arc<dyn PeerConnectionFactory>,
    devices: Arc<dyn CaptureDevices>,
    preferences: Arc<dyn DevicePreferences>,
    out: Outbox,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,

    peer_tx: mpsc::UnboundedSender<PeerEventEnvelope>,
    peer_rx: mpsc::UnboundedReceiver<PeerEventEnvelope>,
    timer_rx: mpsc::UnboundedReceiver<TimerFired<TimerKey>>,
    timers: TaskScheduler<TimerKey>,

    peers: HashMap<PeerId, PeerSession>,
    next_generation: u64,
    /// Candidates from peers we have no session with yet.
    orphans: HashMap<PeerId, IceCandidateBuffer>,
    participants: BTreeMap<PeerId, Participant>,
    ice_servers: Vec<IceServer>,

    scheduler: ConnectionScheduler,
    monitor: HealthMonitor,
    corrector: AvSyncCorrector,
    bindings: TrackBindings,
    local_speaking: SpeakingDetector,
    clocks: HashMap<PeerId, Arc<dyn PlaybackClocks>>,
    force_reconnects: HashMap<String, Instant>,
    muted: bool,
    status: ChannelStatus,
    signaling_lost: bool,
    rng: StdRng,
}

impl ChannelActor {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        deps: &SessionDeps,
        channel_id: &str,
        local_id: &str,
        display_name: Option<String>,
        microphone: LocalTrack,
        sink: Arc<dyn SignalSink>,
        events: broadcast::Sender<SessionEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let timing = deps.timing.clone();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let mut bindings = TrackBindings::new();
        bindings.bind(microphone);
        Self {
            channel_id: channel_id.to_string(),
            local_id: local_id.to_string(),
            display_name,
            factory: Arc::clone(&deps.factory),
            devices: Arc::clone(&deps.devices),
            preferences: Arc::clone(&deps.preferences),
            out: Outbox::new(sink, channel_id, local_id),
            events,
            cancel,
            peer_tx,
            peer_rx,
            timer_rx,
            timers: TaskScheduler::new(timer_tx),
            peers: HashMap::new(),
            next_generation: 0,
            orphans: HashMap::new(),
            participants: BTreeMap::new(),
            ice_servers: deps.fallback_ice_servers.clone(),
            scheduler: ConnectionScheduler::new(timing.scheduler.clone()),
            monitor: HealthMonitor::new(timing.health.clone()),
            corrector: AvSyncCorrector::new(timing.sync.clone()),
            bindings,
            local_speaking: SpeakingDetector::new(&timing.speaking),
            clocks: HashMap::new(),
            force_reconnects: HashMap::new(),
            muted: false,
            status: ChannelStatus::Connecting,
            signaling_lost: false,
            rng: StdRng::from_entropy(),
            timing,
        }
    }

    pub(super) async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<SignalMessage>,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) {
        self.start();
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        debug!(target = "chorus::session", channel_id = %self.channel_id, "all handles dropped");
                        break;
                    }
                },
                message = inbound.recv(), if !self.signaling_lost => match message {
                    Some(message) => self.on_signal(message).await,
                    None => self.on_signaling_lost(),
                },
                Some(envelope) = self.peer_rx.recv() => self.on_peer_event(envelope).await,
                Some(fired) = self.timer_rx.recv() => self.on_timer(fired).await,
            }
        }
        self.shutdown().await;
    }

    fn start(&mut self) {
        self.out.join(self.display_name.clone());
        self.timers.every(TimerKey::HealthCheck, self.monitor.interval());
        self.timers.every(TimerKey::Heartbeat, self.timing.heartbeat_interval);
        self.timers
            .every(TimerKey::LocalSpeaking, self.timing.speaking.local_interval);
        self.timers
            .every(TimerKey::RemoteSpeaking, self.timing.speaking.remote_interval);
        self.timers.every(TimerKey::AvSync, self.corrector.interval());
        self.emit(SessionEvent::Status {
            status: self.status,
        });
    }

    async fn shutdown(&mut self) {
        info!(
            target = "chorus::session",
            channel_id = %self.channel_id,
            peers = self.peers.len(),
            "leaving channel"
        );
        self.timers.shutdown();
        if !self.signaling_lost {
            self.out.leave();
        }
        let peers: Vec<PeerId> = self.peers.keys().cloned().collect();
        for peer in peers {
            if let Some(mut session) = self.peers.remove(&peer) {
                session.close().await;
            }
        }
        self.emit(SessionEvent::Closed);
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn refresh_status(&mut self) {
        let status = aggregate_status(
            self.peers.values().map(|session| session.health.lifecycle()),
            self.signaling_lost,
        );
        if status != self.status {
            info!(
                target = "chorus::session",
                channel_id = %self.channel_id,
                from = ?self.status,
                to = ?status,
                "channel status changed"
            );
            self.status = status;
            self.emit(SessionEvent::Status { status });
        }
    }

    fn on_signaling_lost(&mut self) {
        warn!(
            target = "chorus::session",
            channel_id = %self.channel_id,
            "signaling connection lost"
        );
        self.signaling_lost = true;
        self.emit(SessionEvent::Error {
            message: "signaling connection lost".to_string(),
        });
        self.refresh_status();
    }

    // Signaling

    async fn on_signal(&mut self, message: SignalMessage) {
        if message.channel_id() != self.channel_id {
            debug!(
                target = "chorus::session",
                channel_id = %self.channel_id,
                %message,
                "message for another channel ignored"
            );
            return;
        }
        trace!(target = "chorus::session", %message, "signal");
        match message {
            SignalMessage::Participants {
                participants,
                ice_servers,
                ..
            } => self.on_participants(participants, ice_servers),
            SignalMessage::UserJoined { participant, .. } => self.on_user_joined(participant),
            SignalMessage::UserLeft { peer_id, .. } => self.on_user_left(&peer_id).await,
            SignalMessage::UserReconnected { peer_id, .. } => {
                self.on_user_reconnected(&peer_id).await
            }
            SignalMessage::UserUpdated { participant, .. } => {
                if participant.peer_id != self.local_id {
                    self.participants
                        .insert(participant.peer_id.clone(), participant.clone());
                    self.emit(SessionEvent::ParticipantUpdated { participant });
                }
            }
            SignalMessage::Offer {
                from,
                to,
                description,
                ..
            } if to == self.local_id => self.on_offer(&from, description).await,
            SignalMessage::Answer {
                from,
                to,
                description,
                ..
            } if to == self.local_id => self.on_answer(&from, description).await,
            SignalMessage::IceCandidate {
                from, to, candidate, ..
            } if to == self.local_id => self.on_remote_candidate(&from, candidate).await,
            SignalMessage::TrackState {
                peer_id,
                role,
                enabled,
                ..
            } => self.on_track_state(peer_id, role, enabled),
            SignalMessage::ForceReconnect { target, reason, .. } => {
                self.on_force_reconnect(target, reason).await
            }
            SignalMessage::ResyncRequest { from, to, .. } if to == self.local_id => {
                self.on_resync_request(&from)
            }
            other => {
                trace!(target = "chorus::session", kind = other.kind(), "message ignored");
            }
        }
    }

    fn on_participants(
        &mut self,
        participants: Vec<Participant>,
        ice_servers: Option<Vec<IceServer>>,
    ) {
        if let Some(servers) = ice_servers.filter(|servers| !servers.is_empty()) {
            info!(
                target = "chorus::session",
                channel_id = %self.channel_id,
                servers = servers.len(),
                "using server-provided ice servers"
            );
            self.ice_servers = servers;
        }
        let mut fresh = Vec::new();
        for participant in participants {
            if participant.peer_id == self.local_id {
                continue;
            }
            let peer = participant.peer_id.clone();
            if self
                .participants
                .insert(peer.clone(), participant.clone())
                .is_none()
            {
                self.emit(SessionEvent::ParticipantJoined { participant });
            }
            if !self.peers.contains_key(&peer) {
                fresh.push(peer);
            }
        }

        let now = Instant::now();
        let load = self.load() + fresh.len();
        let tier = Tier::for_load(load);
        let plan = plan_batches(
            &fresh,
            &tier.config(),
            self.scheduler.timing().batch_spacing,
            self.timing.join_initiate_delay,
            &mut self.rng,
        );
        info!(
            target = "chorus::session",
            channel_id = %self.channel_id,
            peers = plan.len(),
            ?tier,
            "planning initial connections"
        );
        for (peer, delay) in plan {
            self.enqueue(&peer, now, delay, false);
        }
        self.arm_scheduler(now);
        self.refresh_status();
    }

    fn on_user_joined(&mut self, participant: Participant) {
        if participant.peer_id == self.local_id {
            return;
        }
        let peer = participant.peer_id.clone();
        info!(target = "chorus::session", peer_id = %peer, "participant joined");
        self.participants.insert(peer.clone(), participant.clone());
        self.emit(SessionEvent::ParticipantJoined { participant });
        // Members already present offer first; the newcomer holds back.
        let now = Instant::now();
        let delay = self.member_initiate_delay();
        if self.enqueue(&peer, now, delay, false) {
            self.arm_scheduler(now);
        }
    }

    fn member_initiate_delay(&self) -> Duration {
        Tier::for_load(self.load() + 1).config().base_stagger + self.timing.user_joined_delay
    }

    async fn on_user_left(&mut self, peer: &str) {
        info!(target = "chorus::session", peer_id = %peer, "participant left");
        self.participants.remove(peer);
        self.scheduler.remove(peer);
        self.orphans.remove(peer);
        self.clocks.remove(peer);
        self.teardown(peer, "participant left").await;
        self.emit(SessionEvent::ParticipantLeft {
            peer_id: peer.to_string(),
        });
        self.arm_scheduler(Instant::now());
    }

    async fn on_user_reconnected(&mut self, peer: &str) {
        info!(target = "chorus::session", peer_id = %peer, "participant reconnected");
        self.participants
            .entry(peer.to_string())
            .or_insert_with(|| Participant::new(peer));
        self.teardown(peer, "participant reconnected").await;
        self.scheduler.remove(peer);
        let now = Instant::now();
        let delay = self.member_initiate_delay();
        if self.enqueue(peer, now, delay, true) {
            self.arm_scheduler(now);
        }
    }

    fn on_track_state(&mut self, peer: PeerId, role: TrackRole, enabled: bool) {
        if peer == self.local_id {
            return;
        }
        if role == TrackRole::Camera && !enabled {
            if let Some(session) = self.peers.get_mut(&peer) {
                if session.sync.take().is_some() {
                    debug!(target = "chorus::session", peer_id = %peer, "camera off; sync state discarded");
                }
            }
        }
        self.emit(SessionEvent::TrackState {
            peer_id: peer,
            role,
            enabled,
        });
    }

    async fn on_force_reconnect(&mut self, target: ReconnectTarget, reason: Option<String>) {
        let now = Instant::now();
        let dedupe = self.timing.force_reconnect_dedupe;
        self.force_reconnects
            .retain(|_, at| now.duration_since(*at) < dedupe);
        let key = String::from(target.clone());
        if self.force_reconnects.contains_key(&key) {
            debug!(target = "chorus::session", reconnect_target = %key, "duplicate force-reconnect ignored");
            return;
        }
        self.force_reconnects.insert(key.clone(), now);
        warn!(
            target = "chorus::session",
            channel_id = %self.channel_id,
            reconnect_target = %key,
            reason = reason.as_deref().unwrap_or("unspecified"),
            "server requested reconnect"
        );

        let peers: Vec<PeerId> = match target {
            ReconnectTarget::All => self.participants.keys().cloned().collect(),
            ReconnectTarget::Peer(peer) if peer == self.local_id => {
                self.participants.keys().cloned().collect()
            }
            ReconnectTarget::Peer(peer) if self.participants.contains_key(&peer) => vec![peer],
            ReconnectTarget::Peer(_) => Vec::new(),
        };
        for peer in peers {
            self.rebuild(&peer).await;
        }
        self.arm_scheduler(Instant::now());
    }

    /// Replaces the connection to `peer` with a fresh one. Both ends rebuild,
    /// so only the polite side offers promptly.
    async fn rebuild(&mut self, peer: &str) {
        self.teardown(peer, "force-reconnect").await;
        self.scheduler.remove(peer);
        let delay = if Role::for_pair(&self.local_id, peer).is_polite() {
            Tier::for_load(self.load() + 1).config().base_stagger
        } else {
            self.timing.rebuild_fallback
        };
        self.enqueue(peer, Instant::now(), delay, true);
    }

    fn on_resync_request(&mut self, peer: &str) {
        debug!(target = "chorus::session", peer_id = %peer, "resync requested");
        if let Some(session) = self.peers.get_mut(peer) {
            if session.sync.is_some() {
                session.sync = Some(SyncState::default());
            }
        }
        if let Some(clocks) = self.clocks.get(peer) {
            clocks.set_video_rate(1.0);
        }
        self.emit(SessionEvent::Resync {
            peer_id: peer.to_string(),
        });
    }

    // Negotiation

    async fn on_offer(&mut self, from: &str, description: SessionDescription) {
        if !self.participants.contains_key(from) {
            let participant = Participant::new(from);
            self.participants.insert(from.to_string(), participant.clone());
            self.emit(SessionEvent::ParticipantJoined { participant });
        }
        if self
            .peers
            .get(from)
            .is_some_and(|session| session.health.lifecycle().is_terminal())
        {
            self.teardown(from, "offer for a dead connection").await;
        }
        if !self.ensure_session(from).await {
            return;
        }
        let now = Instant::now();
        let Some(session) = self.peers.get_mut(from) else {
            return;
        };
        let stable = session.pc.signaling_state() == SignalingState::Stable;
        match session.negotiator.receive_offer(description, now, stable) {
            OfferIntake::Apply(description) => self.answer_offer(from, description).await,
            OfferIntake::Defer(wait) => {
                debug!(
                    target = "chorus::session",
                    peer_id = %from,
                    wait_ms = wait.as_millis() as u64,
                    "holding remote offer"
                );
                self.timers
                    .schedule(TimerKey::Reconsider(from.to_string()), wait);
            }
            OfferIntake::Drop => {
                debug!(target = "chorus::session", peer_id = %from, "offer dropped")
            }
        }
    }

    async fn answer_offer(&mut self, peer: &str, description: SessionDescription) {
        let Some(session) = self.peers.get_mut(peer) else {
            return;
        };
        match session.accept_offer(description, &self.out).await {
            Ok(AnswerOutcome::Sent) => {}
            Ok(AnswerOutcome::Stale) => {
                debug!(target = "chorus::session", peer_id = %peer, "answer discarded; state moved on")
            }
            // Already logged with context; collisions are never surfaced.
            Err(_) => {}
        }
        self.settle(peer);
    }

    async fn on_answer(&mut self, from: &str, description: SessionDescription) {
        if !self.peers.contains_key(from) {
            debug!(target = "chorus::session", peer_id = %from, "answer from unknown peer");
            if !self.ensure_session(from).await {
                return;
            }
        }
        let Some(session) = self.peers.get_mut(from) else {
            return;
        };
        match session.negotiator.receive_answer(session.pc.signaling_state()) {
            AnswerIntake::Apply => {
                let _ = session.accept_answer(description).await;
            }
            AnswerIntake::Reoffer => {
                debug!(target = "chorus::session", peer_id = %from, "answers crossed; offering again");
                self.negotiate(from, false).await;
            }
            AnswerIntake::Ignore => {
                trace!(target = "chorus::session", peer_id = %from, "answer ignored")
            }
        }
        self.settle(from);
    }

    async fn on_remote_candidate(&mut self, from: &str, candidate: IceCandidate) {
        match self.peers.get_mut(from) {
            Some(session) => session.add_remote_candidate(candidate).await,
            None => {
                trace!(target = "chorus::session", peer_id = %from, "buffering candidate for unknown peer");
                self.orphans
                    .entry(from.to_string())
                    .or_insert_with(IceCandidateBuffer::new)
                    .push(candidate);
            }
        }
    }

    async fn reconsider(&mut self, peer: &str) {
        let now = Instant::now();
        let Some(session) = self.peers.get_mut(peer) else {
            return;
        };
        match session.negotiator.reconsider(now) {
            Reconsideration::Apply(description) => self.answer_offer(peer, description).await,
            Reconsideration::Defer(wait) => {
                self.timers
                    .schedule(TimerKey::Reconsider(peer.to_string()), wait);
            }
            Reconsideration::Superseded => {
                debug!(target = "chorus::session", peer_id = %peer, "held offer withdrawn by sender")
            }
            Reconsideration::Idle => {}
        }
    }

    /// Starts a local offer to `peer` if the negotiator allows it now.
    async fn negotiate(&mut self, peer: &str, ice_restart: bool) {
        let now = Instant::now();
        let Some(session) = self.peers.get_mut(peer) else {
            return;
        };
        let stable = session.pc.signaling_state() == SignalingState::Stable;
        match session.negotiator.request_offer(ice_restart, now, stable) {
            OfferGate::Proceed { ice_restart } => {
                let _ = session.send_offer(ice_restart, &self.out).await;
            }
            OfferGate::Skip {
                retry_in: Some(wait),
            } => {
                self.timers
                    .schedule(TimerKey::OfferRetry(peer.to_string()), wait);
            }
            OfferGate::Skip { retry_in: None } => {
                trace!(target = "chorus::session", peer_id = %peer, "offer owed until negotiation settles")
            }
        }
    }

    /// Fires an owed renegotiation once the pair is back to stable.
    fn settle(&mut self, peer: &str) {
        let owed = self.peers.get(peer).is_some_and(|session| {
            session.negotiator.owes_offer()
                && session.negotiator.state() == NegotiationState::Stable
        });
        if owed {
            self.timers
                .schedule_if_idle(TimerKey::OfferRetry(peer.to_string()), Duration::ZERO);
        }
    }

    // Peer sessions

    async fn ensure_session(&mut self, peer: &str) -> bool {
        if self.peers.contains_key(peer) {
            return true;
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        let sink = PeerEventSink::new(peer, generation, self.peer_tx.clone());
        let pc = match self.factory.create(peer, &self.ice_servers, sink).await {
            Ok(pc) => pc,
            Err(err) => {
                warn!(target = "chorus::session", peer_id = %peer, error = %err, "peer connection setup failed");
                self.emit(SessionEvent::Error {
                    message: format!("connection to {peer} failed: {err}"),
                });
                return false;
            }
        };
        let mut session = PeerSession::new(
            &self.local_id,
            peer,
            generation,
            pc,
            &self.timing.negotiation,
            &self.timing.speaking,
            Instant::now(),
        );
        if let Some(orphans) = self.orphans.remove(peer) {
            debug!(
                target = "chorus::session",
                peer_id = %peer,
                count = orphans.len(),
                "adopting early candidates"
            );
            session.candidates.absorb(orphans);
        }
        if let Err(err) = session
            .senders
            .reconcile(session.pc.as_ref(), &self.bindings)
            .await
        {
            warn!(target = "chorus::session", peer_id = %peer, error = %err, "attaching local tracks failed");
            session.needs_reconcile = true;
        }
        info!(
            target = "chorus::session",
            peer_id = %peer,
            generation,
            role = ?session.negotiator.role(),
            senders = session.senders.len(),
            "peer session created"
        );
        self.peers.insert(peer.to_string(), session);
        self.refresh_status();
        true
    }

    async fn teardown(&mut self, peer: &str, reason: &str) {
        self.timers.cancel_where(|key| key.peer() == Some(peer));
        let Some(mut session) = self.peers.remove(peer) else {
            return;
        };
        info!(target = "chorus::session", peer_id = %peer, reason, "tearing down peer session");
        let last = session.health.lifecycle();
        session.close().await;
        if !last.is_terminal() {
            self.out
                .connection_report(peer, ConnectionState::Closed, Some(last));
        }
        if session.speaking.is_speaking() {
            self.emit(SessionEvent::Speaking {
                peer_id: peer.to_string(),
                speaking: false,
            });
        }
        for track_id in session.remote_tracks.into_keys() {
            self.emit(SessionEvent::RemoteTrackRemoved {
                peer_id: peer.to_string(),
                track_id,
            });
        }
        self.emit(SessionEvent::PeerState {
            peer_id: peer.to_string(),
            state: ConnectionState::Closed,
        });
        self.refresh_status();
    }

    async fn on_peer_event(&mut self, envelope: PeerEventEnvelope) {
        let PeerEventEnvelope {
            peer_id,
            generation,
            event,
        } = envelope;
        let Some(session) = self
            .peers
            .get_mut(&peer_id)
            .filter(|session| session.generation == generation)
        else {
            trace!(target = "chorus::session", %peer_id, generation, "event from retired connection");
            return;
        };
        match event {
            PeerEvent::IceCandidate(candidate) => self.out.candidate(&peer_id, candidate),
            PeerEvent::IceConnectionStateChanged(state) => {
                session.health.observe_ice(state, Instant::now())
            }
            PeerEvent::ConnectionStateChanged(state) => {
                let Some(transition) = session.health.observe_connection(state) else {
                    return;
                };
                let reconcile = state == ConnectionState::Connected && session.needs_reconcile;
                info!(
                    target = "chorus::session",
                    %peer_id,
                    from = ?transition.from,
                    to = ?transition.to,
                    "peer connection state"
                );
                self.out
                    .connection_report(&peer_id, transition.to, Some(transition.from));
                self.emit(SessionEvent::PeerState {
                    peer_id: peer_id.clone(),
                    state,
                });
                if reconcile {
                    self.reconcile_peer(&peer_id).await;
                }
                self.refresh_status();
            }
            PeerEvent::RemoteTrackAdded {
                track_id,
                kind,
                role,
            } => {
                session.remote_tracks.insert(track_id.clone(), (kind, role));
                if session.sync.is_none()
                    && session.has_remote(MediaKind::Audio)
                    && session.has_remote(MediaKind::Video)
                {
                    session.sync = Some(SyncState::default());
                }
                self.emit(SessionEvent::RemoteTrackAdded {
                    peer_id,
                    track_id,
                    kind,
                    role,
                });
            }
            PeerEvent::RemoteTrackRemoved { track_id, .. } => {
                session.remote_tracks.remove(&track_id);
                if !session.has_remote(MediaKind::Audio) || !session.has_remote(MediaKind::Video) {
                    session.sync = None;
                }
                let went_quiet =
                    !session.has_remote(MediaKind::Audio) && session.speaking.silence().is_some();
                if went_quiet {
                    self.emit(SessionEvent::Speaking {
                        peer_id: peer_id.clone(),
                        speaking: false,
                    });
                }
                self.emit(SessionEvent::RemoteTrackRemoved { peer_id, track_id });
            }
        }
    }

    /// Applies the current bindings to a peer that missed track changes.
    async fn reconcile_peer(&mut self, peer: &str) {
        let Some(session) = self.peers.get_mut(peer) else {
            return;
        };
        match session
            .senders
            .reconcile(session.pc.as_ref(), &self.bindings)
            .await
        {
            Ok(changed) => {
                session.needs_reconcile = false;
                debug!(target = "chorus::session", peer_id = %peer, changed, "senders reconciled");
                if changed {
                    self.timers.schedule(
                        TimerKey::Renegotiate(peer.to_string()),
                        self.timing.renegotiate_debounce,
                    );
                }
            }
            Err(err) => {
                warn!(target = "chorus::session", peer_id = %peer, error = %err, "sender reconciliation failed")
            }
        }
    }

    // Connection scheduling

    fn load(&self) -> usize {
        self.peers.len() + self.scheduler.queued_len()
    }

    fn enqueue(&mut self, peer: &str, now: Instant, delay: Duration, bypass_cooldown: bool) -> bool {
        match self.scheduler.enqueue(peer, now, delay, bypass_cooldown) {
            Ok(()) => true,
            Err(refused) => {
                debug!(target = "chorus::session", peer_id = %peer, %refused, "connection request refused");
                false
            }
        }
    }

    fn arm_scheduler(&mut self, now: Instant) {
        match self.scheduler.next_wakeup(now, self.load()) {
            Some(at) => self
                .timers
                .schedule(TimerKey::SchedulerWake, at.saturating_duration_since(now)),
            None => {
                self.timers.cancel(&TimerKey::SchedulerWake);
            }
        }
    }

    async fn pump_scheduler(&mut self) {
        let launched = self.scheduler.poll(Instant::now(), self.load());
        for request in launched {
            self.launch(&request.peer_id).await;
        }
        self.arm_scheduler(Instant::now());
    }

    async fn launch(&mut self, peer: &str) {
        if !self.participants.contains_key(peer) {
            debug!(target = "chorus::session", peer_id = %peer, "peer left before launch");
            self.scheduler.remove(peer);
            return;
        }
        if self
            .peers
            .get(peer)
            .is_some_and(|session| session.negotiator.has_started())
        {
            debug!(target = "chorus::session", peer_id = %peer, "peer already negotiating; launch skipped");
            self.scheduler.remove(peer);
            return;
        }
        if self.ensure_session(peer).await {
            self.negotiate(peer, false).await;
        }
    }

    // Timers

    async fn on_timer(&mut self, fired: TimerFired<TimerKey>) {
        if !self.timers.accept(&fired) {
            return;
        }
        match fired.key {
            TimerKey::Reconsider(peer) => self.reconsider(&peer).await,
            TimerKey::Renegotiate(peer) | TimerKey::OfferRetry(peer) => {
                self.negotiate(&peer, false).await
            }
            TimerKey::SchedulerWake => self.pump_scheduler().await,
            TimerKey::HealthCheck => self.health_check().await,
            TimerKey::Heartbeat => self.out.heartbeat(),
            TimerKey::LocalSpeaking => self.sample_local_speaking(),
            TimerKey::RemoteSpeaking => self.sample_remote_speaking().await,
            TimerKey::AvSync => self.check_av_sync(),
        }
    }

    async fn health_check(&mut self) {
        let now = Instant::now();
        let mut dead = Vec::new();
        let mut restart = Vec::new();
        for (peer, session) in self.peers.iter_mut() {
            match self.monitor.evaluate(&mut session.health, now) {
                Some(HealthAction::TearDown) => dead.push(peer.clone()),
                Some(HealthAction::RestartIce) => restart.push(peer.clone()),
                None => {}
            }
        }
        for peer in dead {
            self.teardown(&peer, "connection terminated").await;
        }
        for peer in restart {
            info!(target = "chorus::session", peer_id = %peer, "restarting ice");
            self.negotiate(&peer, true).await;
        }
        self.refresh_status();
    }

    fn sample_local_speaking(&mut self) {
        if self.muted {
            return;
        }
        let level = self
            .bindings
            .get(TrackRole::Microphone)
            .and_then(|track| self.devices.sample_window(track))
            .map(|window| rms(&window))
            .unwrap_or(0.0);
        if let Some(speaking) = self.local_speaking.observe(level, Instant::now()) {
            self.emit(SessionEvent::Speaking {
                peer_id: self.local_id.clone(),
                speaking,
            });
        }
    }

    async fn sample_remote_speaking(&mut self) {
        let now = Instant::now();
        let mut edges = Vec::new();
        for (peer, session) in self.peers.iter_mut() {
            if !session.has_remote(MediaKind::Audio) {
                continue;
            }
            let Some(level) = session.pc.audio_level().await else {
                continue;
            };
            if let Some(speaking) = session.speaking.observe(level, now) {
                edges.push((peer.clone(), speaking));
            }
        }
        for (peer_id, speaking) in edges {
            self.emit(SessionEvent::Speaking { peer_id, speaking });
        }
    }

    fn check_av_sync(&mut self) {
        let now = Instant::now();
        let mut resync = Vec::new();
        for (peer, session) in self.peers.iter_mut() {
            let Some(state) = session.sync.as_mut() else {
                continue;
            };
            let Some(clocks) = self.clocks.get(peer) else {
                continue;
            };
            let (Some(audio), Some(video)) = (clocks.audio_time(), clocks.video_time()) else {
                continue;
            };
            match self.corrector.check(state, audio, video, now) {
                SyncOutcome::Skipped => {}
                SyncOutcome::InBand { rate, .. } => clocks.set_video_rate(rate),
                SyncOutcome::Corrected { drift, rate } => {
                    debug!(target = "chorus::session", peer_id = %peer, drift, rate, "video rate corrected");
                    clocks.set_video_rate(rate);
                }
                SyncOutcome::ResyncNeeded { drift, rate } => {
                    warn!(target = "chorus::session", peer_id = %peer, drift, rate, "drift too large; requesting resync");
                    clocks.set_video_rate(rate);
                    resync.push(peer.clone());
                }
            }
        }
        for peer in resync {
            self.out.resync_request(&peer);
        }
    }

    // Local tracks

    async fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SetCamera { enabled, reply } => {
                let result = if enabled {
                    self.enable_camera().await
                } else {
                    self.unpublish(&[TrackRole::Camera]).await;
                    Ok(())
                };
                let _ = reply.send(result);
            }
            SessionCommand::SetScreenShare {
                enabled,
                with_audio,
                reply,
            } => {
                let result = if enabled {
                    self.enable_screen_share(with_audio).await
                } else {
                    self.unpublish(&[TrackRole::Screen, TrackRole::ScreenAudio])
                        .await;
                    Ok(())
                };
                let _ = reply.send(result);
            }
            SessionCommand::SwitchMicrophone { device_id, reply } => {
                let result = self.switch_microphone(device_id).await;
                let _ = reply.send(result);
            }
            SessionCommand::SetMuted(muted) => self.set_muted(muted),
            SessionCommand::RequestConnection(peer) => self.request_connection(peer),
            SessionCommand::AttachPlayback { peer_id, clocks } => {
                self.clocks.insert(peer_id, clocks);
            }
            SessionCommand::DetachPlayback(peer_id) => {
                self.clocks.remove(&peer_id);
            }
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn capture_failed(&self, kind: DeviceKind, err: CaptureError) -> SessionError {
        warn!(target = "chorus::session", %kind, error = %err, "capture failed");
        self.emit(SessionEvent::Error {
            message: format!("{kind} unavailable: {err}"),
        });
        SessionError::Capture(err)
    }

    async fn enable_camera(&mut self) -> Result<(), SessionError> {
        if self.bindings.get(TrackRole::Camera).is_some() {
            return Ok(());
        }
        let track = match acquire_camera(
            self.devices.as_ref(),
            self.preferences.as_ref(),
            &self.cancel,
        )
        .await
        {
            Ok(track) => track,
            Err(err) => return Err(self.capture_failed(DeviceKind::Camera, err)),
        };
        self.publish(track).await;
        Ok(())
    }

    async fn enable_screen_share(&mut self, with_audio: bool) -> Result<(), SessionError> {
        if self.bindings.get(TrackRole::Screen).is_some() {
            return Ok(());
        }
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CaptureError::Cancelled),
            opened = self.devices.open_display(with_audio) => opened,
        };
        let (video, audio) = match opened {
            Ok(tracks) => tracks,
            Err(err) => return Err(self.capture_failed(DeviceKind::Display, err)),
        };
        self.publish(video).await;
        if let Some(audio) = audio {
            self.publish(audio).await;
        }
        Ok(())
    }

    async fn switch_microphone(&mut self, device_id: Option<String>) -> Result<(), SessionError> {
        self.preferences
            .set_preferred(DeviceKind::Microphone, device_id);
        let track = match acquire_microphone(
            self.devices.as_ref(),
            self.preferences.as_ref(),
            &self.cancel,
        )
        .await
        {
            Ok(track) => track,
            // The previous microphone stays bound.
            Err(err) => return Err(self.capture_failed(DeviceKind::Microphone, err)),
        };
        self.publish(track).await;
        Ok(())
    }

    /// Binds `track` and attaches it to every usable peer.
    async fn publish(&mut self, track: LocalTrack) {
        let role = track.role();
        if role == TrackRole::Microphone && self.muted {
            track.set_enabled(false);
        }
        self.bindings.bind(track.clone());
        for (peer, session) in self.peers.iter_mut() {
            if !session.health.is_usable() {
                session.needs_reconcile = true;
                continue;
            }
            match session.senders.attach(session.pc.as_ref(), &track).await {
                Ok(change) if change.needs_renegotiation() => self.timers.schedule(
                    TimerKey::Renegotiate(peer.clone()),
                    self.timing.renegotiate_debounce,
                ),
                Ok(_) => {}
                Err(err) => {
                    warn!(target = "chorus::session", peer_id = %peer, %role, error = %err, "attach failed");
                    session.needs_reconcile = true;
                }
            }
        }
        info!(target = "chorus::session", %role, track_id = track.id(), "local track published");
        self.out.track_state(role, true);
    }

    async fn unpublish(&mut self, roles: &[TrackRole]) {
        for role in roles.iter().copied() {
            if self.bindings.unbind(role).is_none() {
                continue;
            }
            for (peer, session) in self.peers.iter_mut() {
                if !session.health.is_usable() {
                    session.needs_reconcile = true;
                    continue;
                }
                match session.senders.detach(session.pc.as_ref(), role).await {
                    Ok(change) if change.needs_renegotiation() => self.timers.schedule(
                        TimerKey::Renegotiate(peer.clone()),
                        self.timing.renegotiate_debounce,
                    ),
                    Ok(_) => {}
                    Err(err) => {
                        warn!(target = "chorus::session", peer_id = %peer, %role, error = %err, "detach failed");
                        session.needs_reconcile = true;
                    }
                }
            }
            info!(target = "chorus::session", %role, "local track unpublished");
            self.out.track_state(role, false);
        }
    }

    fn set_muted(&mut self, muted: bool) {
        if self.muted == muted {
            return;
        }
        self.muted = muted;
        if let Some(microphone) = self.bindings.get(TrackRole::Microphone) {
            microphone.set_enabled(!muted);
        }
        if muted && self.local_speaking.silence().is_some() {
            self.emit(SessionEvent::Speaking {
                peer_id: self.local_id.clone(),
                speaking: false,
            });
        }
        self.out.participant_update(Participant {
            peer_id: self.local_id.clone(),
            display_name: self.display_name.clone(),
            muted,
        });
    }

    fn request_connection(&mut self, peer: PeerId) {
        if peer == self.local_id {
            return;
        }
        self.participants
            .entry(peer.clone())
            .or_insert_with(|| Participant::new(peer.as_str()));
        // An explicit request jumps ahead of a slower automatic one.
        if self.scheduler.is_queued(&peer) {
            self.scheduler.remove(&peer);
        }
        let now = Instant::now();
        if self.enqueue(&peer, now, Duration::ZERO, false) {
            self.arm_scheduler(now);
        }
    }

    fn snapshot(&self) -> ChannelSnapshot {
        let mut peers: Vec<PeerSnapshot> = self
            .peers
            .values()
            .map(|session| PeerSnapshot {
                peer_id: session.peer_id.clone(),
                connection: session.health.lifecycle(),
                ice: session.health.ice(),
                negotiation: session.negotiator.state(),
                senders: TrackRole::ALL
                    .into_iter()
                    .filter(|role| session.senders.sender(*role).is_some())
                    .collect(),
                remote_tracks: session.remote_tracks.len(),
                speaking: session.speaking.is_speaking(),
                syncing: session.sync.is_some(),
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        ChannelSnapshot {
            channel_id: self.channel_id.clone(),
            local_id: self.local_id.clone(),
            status: self.status,
            muted: self.muted,
            local_tracks: self.bindings.roles(),
            participants: self.participants.values().cloned().collect(),
            peers,
            queued: self.scheduler.queued_len(),
            active: self.scheduler.active_len(),
            ice_servers: self.ice_servers.clone(),
        }
    }
}
