//! One remote participant: its connection, negotiation record and the
//! per-peer media state.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::PeerId;
use crate::av_sync::SyncState;
use crate::health::PeerHealth;
use crate::ice_buffer::IceCandidateBuffer;
use crate::media::{
    ConnectionState, IceCandidate, MediaError, MediaKind, PeerConnection, SessionDescription,
    SignalingState, TrackRole,
};
use crate::negotiation::{IllegalTransition, NegotiationTiming, Negotiator, Role};
use crate::signaling::{Participant, SignalMessage, SignalSink};
use crate::speaking::{SpeakingDetector, SpeakingTiming};
use crate::tracks::PeerSenders;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Illegal(#[from] IllegalTransition),
}

/// Outbound signaling for one channel membership.
pub(crate) struct Outbox {
    sink: Arc<dyn SignalSink>,
    channel_id: String,
    local_id: PeerId,
}

impl Outbox {
    pub(crate) fn new(sink: Arc<dyn SignalSink>, channel_id: &str, local_id: &str) -> Self {
        Self {
            sink,
            channel_id: channel_id.to_string(),
            local_id: local_id.to_string(),
        }
    }

    pub(crate) fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub(crate) fn local_id(&self) -> &str {
        &self.local_id
    }

    fn send(&self, message: SignalMessage) {
        let kind = message.kind();
        if let Err(err) = self.sink.send(message) {
            warn!(
                target = "chorus::session",
                channel_id = %self.channel_id,
                kind,
                error = %err,
                "signaling send failed"
            );
        }
    }

    pub(crate) fn join(&self, display_name: Option<String>) {
        self.send(SignalMessage::Join {
            channel_id: self.channel_id.clone(),
            peer_id: self.local_id.clone(),
            display_name,
        });
    }

    pub(crate) fn leave(&self) {
        self.send(SignalMessage::Leave {
            channel_id: self.channel_id.clone(),
            peer_id: self.local_id.clone(),
        });
    }

    pub(crate) fn offer(&self, to: &str, description: SessionDescription) {
        self.send(SignalMessage::Offer {
            channel_id: self.channel_id.clone(),
            from: self.local_id.clone(),
            to: to.to_string(),
            description,
        });
    }

    pub(crate) fn answer(&self, to: &str, description: SessionDescription) {
        self.send(SignalMessage::Answer {
            channel_id: self.channel_id.clone(),
            from: self.local_id.clone(),
            to: to.to_string(),
            description,
        });
    }

    pub(crate) fn candidate(&self, to: &str, candidate: IceCandidate) {
        self.send(SignalMessage::IceCandidate {
            channel_id: self.channel_id.clone(),
            from: self.local_id.clone(),
            to: to.to_string(),
            candidate,
        });
    }

    pub(crate) fn heartbeat(&self) {
        self.send(SignalMessage::Heartbeat {
            channel_id: self.channel_id.clone(),
            peer_id: self.local_id.clone(),
        });
    }

    pub(crate) fn track_state(&self, role: TrackRole, enabled: bool) {
        self.send(SignalMessage::TrackState {
            channel_id: self.channel_id.clone(),
            peer_id: self.local_id.clone(),
            role,
            enabled,
        });
    }

    pub(crate) fn participant_update(&self, participant: Participant) {
        self.send(SignalMessage::UserUpdated {
            channel_id: self.channel_id.clone(),
            participant,
        });
    }

    pub(crate) fn resync_request(&self, to: &str) {
        self.send(SignalMessage::ResyncRequest {
            channel_id: self.channel_id.clone(),
            from: self.local_id.clone(),
            to: to.to_string(),
        });
    }

    pub(crate) fn connection_report(
        &self,
        remote_peer: &str,
        state: ConnectionState,
        previous: Option<ConnectionState>,
    ) {
        self.send(SignalMessage::ConnectionReport {
            channel_id: self.channel_id.clone(),
            peer_id: self.local_id.clone(),
            remote_peer: remote_peer.to_string(),
            state,
            previous,
        });
    }
}

/// How an offer we answered ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AnswerOutcome {
    Sent,
    /// The connection moved on while we were producing the answer.
    Stale,
}

pub(crate) struct PeerSession {
    pub peer_id: PeerId,
    pub generation: u64,
    pub pc: Arc<dyn PeerConnection>,
    pub negotiator: Negotiator,
    pub candidates: IceCandidateBuffer,
    pub senders: PeerSenders,
    pub health: PeerHealth,
    pub speaking: SpeakingDetector,
    /// Live remote tracks by id.
    pub remote_tracks: BTreeMap<String, (MediaKind, Option<TrackRole>)>,
    pub sync: Option<SyncState>,
    /// Local track changes arrived while the connection was unusable.
    pub needs_reconcile: bool,
}

impl PeerSession {
    pub(crate) fn new(
        local_id: &str,
        peer_id: &str,
        generation: u64,
        pc: Arc<dyn PeerConnection>,
        negotiation: &NegotiationTiming,
        speaking: &SpeakingTiming,
        now: Instant,
    ) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            generation,
            pc,
            negotiator: Negotiator::new(Role::for_pair(local_id, peer_id), negotiation.clone()),
            candidates: IceCandidateBuffer::new(),
            senders: PeerSenders::new(),
            health: PeerHealth::new(now),
            speaking: SpeakingDetector::new(speaking),
            remote_tracks: BTreeMap::new(),
            sync: None,
            needs_reconcile: false,
        }
    }

    pub(crate) fn has_remote(&self, kind: MediaKind) -> bool {
        self.remote_tracks.values().any(|(k, _)| *k == kind)
    }

    fn transport_state(&self) -> SignalingState {
        self.pc.signaling_state()
    }

    /// Brings the negotiator back in line after a failed media call.
    fn recover(&mut self, err: NegotiationError) -> NegotiationError {
        let transport = self.transport_state();
        warn!(
            target = "chorus::session::peer",
            peer_id = %self.peer_id,
            error = %err,
            ?transport,
            "negotiation step failed"
        );
        self.negotiator.resync(transport);
        err
    }

    /// Applies a remote offer and answers it.
    pub(crate) async fn accept_offer(
        &mut self,
        description: SessionDescription,
        out: &Outbox,
    ) -> Result<AnswerOutcome, NegotiationError> {
        match self.accept_offer_inner(description, out).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => Err(self.recover(err)),
        }
    }

    async fn accept_offer_inner(
        &mut self,
        description: SessionDescription,
        out: &Outbox,
    ) -> Result<AnswerOutcome, NegotiationError> {
        if self.transport_state() != SignalingState::Stable {
            debug!(
                target = "chorus::session::peer",
                peer_id = %self.peer_id,
                state = ?self.transport_state(),
                "rolling back before applying remote offer"
            );
            self.pc.rollback().await?;
            self.negotiator.rolled_back()?;
        }
        self.pc.set_remote_description(description).await?;
        self.negotiator.remote_offer_set()?;
        self.flush_candidates().await;

        let answer = self.pc.create_answer().await?;
        if self.transport_state() != SignalingState::HaveRemoteOffer {
            self.negotiator.resync(self.transport_state());
            return Ok(AnswerOutcome::Stale);
        }
        self.pc.set_local_description(answer.clone()).await?;
        self.negotiator.answer_sent(Instant::now())?;
        out.answer(&self.peer_id, answer);
        trace!(target = "chorus::session::peer", peer_id = %self.peer_id, "answer sent");
        Ok(AnswerOutcome::Sent)
    }

    pub(crate) async fn accept_answer(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let result = async {
            self.pc.set_remote_description(description).await?;
            self.negotiator.remote_answer_set()?;
            Ok::<_, NegotiationError>(())
        }
        .await;
        match result {
            Ok(()) => {
                self.flush_candidates().await;
                Ok(())
            }
            Err(err) => Err(self.recover(err)),
        }
    }

    /// Creates and sends a local offer once the negotiator allowed it.
    /// Returns false when the attempt was abandoned.
    pub(crate) async fn send_offer(
        &mut self,
        ice_restart: bool,
        out: &Outbox,
    ) -> Result<bool, NegotiationError> {
        let offer = match self.pc.create_offer(ice_restart).await {
            Ok(offer) => offer,
            Err(err) => {
                self.negotiator.offer_abandoned();
                return Err(self.recover(err.into()));
            }
        };
        if self.transport_state() != SignalingState::Stable {
            debug!(
                target = "chorus::session::peer",
                peer_id = %self.peer_id,
                state = ?self.transport_state(),
                "connection left stable while offering; abandoning"
            );
            self.negotiator.offer_abandoned();
            return Ok(false);
        }
        if let Err(err) = self.pc.set_local_description(offer.clone()).await {
            self.negotiator.offer_abandoned();
            return Err(self.recover(err.into()));
        }
        if let Err(err) = self.negotiator.local_offer_set() {
            return Err(self.recover(err.into()));
        }
        out.offer(&self.peer_id, offer);
        debug!(
            target = "chorus::session::peer",
            peer_id = %self.peer_id,
            ice_restart,
            "offer sent"
        );
        Ok(true)
    }

    /// Applies a remote candidate, or buffers it until a remote description
    /// is in place.
    pub(crate) async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if !self.negotiator.remote_description_applied() {
            self.candidates.push(candidate);
            return;
        }
        if let Err(err) = self.pc.add_ice_candidate(candidate).await {
            warn!(
                target = "chorus::session::peer",
                peer_id = %self.peer_id,
                error = %err,
                "remote candidate rejected"
            );
        }
    }

    async fn flush_candidates(&mut self) {
        let pending = self.candidates.drain();
        if pending.is_empty() {
            return;
        }
        debug!(
            target = "chorus::session::peer",
            peer_id = %self.peer_id,
            count = pending.len(),
            "applying buffered candidates"
        );
        for candidate in pending {
            if let Err(err) = self.pc.add_ice_candidate(candidate).await {
                warn!(
                    target = "chorus::session::peer",
                    peer_id = %self.peer_id,
                    error = %err,
                    "buffered candidate rejected"
                );
            }
        }
    }

    pub(crate) async fn close(&mut self) {
        self.negotiator.close();
        self.candidates.clear();
        self.senders.clear();
        if let Err(err) = self.pc.close().await {
            debug!(
                target = "chorus::session::peer",
                peer_id = %self.peer_id,
                error = %err,
                "close failed"
            );
        }
    }
}
