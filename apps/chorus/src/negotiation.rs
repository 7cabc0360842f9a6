//! Per-peer offer/answer bookkeeping for symmetric negotiation.
//!
//! [`Negotiator`] decides what to do with offers, answers and local
//! renegotiation needs; the channel session performs the media calls and
//! reports each completed step back. Both sides may offer at any time.
//! Collisions always end with the incoming offer being accepted, the
//! impolite side waiting a short grace window first so the polite side's
//! rollback usually wins the race.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::media::{SessionDescription, SignalingState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Polite,
    Impolite,
}

impl Role {
    /// The participant with the smaller id is polite.
    pub fn for_pair(local: &str, remote: &str) -> Self {
        if local < remote {
            Role::Polite
        } else {
            Role::Impolite
        }
    }

    pub fn is_polite(self) -> bool {
        self == Role::Polite
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStep {
    LocalOffer,
    RemoteOffer,
    LocalAnswer,
    RemoteAnswer,
    Rollback,
    Close,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("illegal negotiation step {step:?} in state {state:?}")]
pub struct IllegalTransition {
    pub state: NegotiationState,
    pub step: NegotiationStep,
}

impl NegotiationState {
    pub fn apply(self, step: NegotiationStep) -> Result<Self, IllegalTransition> {
        use NegotiationState::*;
        use NegotiationStep::*;
        match (self, step) {
            (Closing, Close) => Ok(Closing),
            (_, Close) => Ok(Closing),
            (Stable | HaveLocalOffer, LocalOffer) => Ok(HaveLocalOffer),
            (Stable | HaveRemoteOffer, RemoteOffer) => Ok(HaveRemoteOffer),
            (HaveRemoteOffer, LocalAnswer) => Ok(Stable),
            (HaveLocalOffer, RemoteAnswer) => Ok(Stable),
            (HaveLocalOffer | HaveRemoteOffer, Rollback) => Ok(Stable),
            (state, step) => Err(IllegalTransition { state, step }),
        }
    }

    fn mirror(transport: SignalingState) -> Self {
        match transport {
            SignalingState::Stable => NegotiationState::Stable,
            SignalingState::HaveLocalOffer => NegotiationState::HaveLocalOffer,
            SignalingState::HaveRemoteOffer => NegotiationState::HaveRemoteOffer,
            SignalingState::Closed => NegotiationState::Closing,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NegotiationTiming {
    /// Offers from one peer closer together than this are dropped.
    pub offer_debounce: Duration,
    /// How long incoming offers wait after we answered one.
    pub answer_lock: Duration,
    /// Added to lock expiry before a deferred offer is looked at again.
    pub lock_slack: Duration,
    /// How long the impolite side holds a colliding offer.
    pub impolite_grace: Duration,
}

impl Default for NegotiationTiming {
    fn default() -> Self {
        Self {
            offer_debounce: Duration::from_millis(300),
            answer_lock: Duration::from_secs(1),
            lock_slack: Duration::from_millis(50),
            impolite_grace: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferIntake {
    Apply(SessionDescription),
    /// Held; call [`Negotiator::reconsider`] after the delay.
    Defer(Duration),
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconsideration {
    Apply(SessionDescription),
    Defer(Duration),
    /// The held offer was withdrawn by its sender.
    Superseded,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerIntake {
    Apply,
    /// Both sides rolled back; send a fresh offer.
    Reoffer,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferGate {
    Proceed { ice_restart: bool },
    /// Not now. The need is remembered; with `retry_in` the caller should
    /// ask again after that delay, otherwise once negotiation settles.
    Skip { retry_in: Option<Duration> },
}

#[derive(Debug)]
struct HeldOffer {
    description: SessionDescription,
    received_at: Instant,
}

#[derive(Debug)]
pub struct Negotiator {
    role: Role,
    timing: NegotiationTiming,
    state: NegotiationState,
    making_offer: bool,
    ignore_offer: bool,
    remote_description_applied: bool,
    rolled_back_local_offer: bool,
    last_offer_at: Option<Instant>,
    locked_until: Option<Instant>,
    held: Option<HeldOffer>,
    owed: Option<bool>,
}

impl Negotiator {
    pub fn new(role: Role, timing: NegotiationTiming) -> Self {
        Self {
            role,
            timing,
            state: NegotiationState::Stable,
            making_offer: false,
            ignore_offer: false,
            remote_description_applied: false,
            rolled_back_local_offer: false,
            last_offer_at: None,
            locked_until: None,
            held: None,
            owed: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn making_offer(&self) -> bool {
        self.making_offer
    }

    pub fn ignore_offer(&self) -> bool {
        self.ignore_offer
    }

    pub fn remote_description_applied(&self) -> bool {
        self.remote_description_applied
    }

    pub fn has_held_offer(&self) -> bool {
        self.held.is_some()
    }

    pub fn is_locked(&self, now: Instant) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    /// True once either side has moved this pair past the initial state.
    pub fn has_started(&self) -> bool {
        self.state != NegotiationState::Stable
            || self.making_offer
            || self.remote_description_applied
            || self.last_offer_at.is_some()
            || self.held.is_some()
    }

    fn lock_remaining(&self, now: Instant) -> Option<Duration> {
        self.locked_until
            .filter(|until| *until > now)
            .map(|until| until - now + self.timing.lock_slack)
    }

    fn step(&mut self, step: NegotiationStep) -> Result<(), IllegalTransition> {
        self.state = self.state.apply(step)?;
        Ok(())
    }

    /// Intake of a fresh offer from the remote peer.
    pub fn receive_offer(
        &mut self,
        description: SessionDescription,
        now: Instant,
        transport_stable: bool,
    ) -> OfferIntake {
        if self.state == NegotiationState::Closing {
            return OfferIntake::Drop;
        }
        if let Some(wait) = self.lock_remaining(now) {
            self.held = Some(HeldOffer {
                description,
                received_at: now,
            });
            return OfferIntake::Defer(wait);
        }
        if self
            .last_offer_at
            .is_some_and(|last| now.duration_since(last) < self.timing.offer_debounce)
        {
            return OfferIntake::Drop;
        }
        self.last_offer_at = Some(now);
        self.ignore_offer = false;

        let collision = self.making_offer || !transport_stable;
        if collision && !self.role.is_polite() {
            self.held = Some(HeldOffer {
                description,
                received_at: now,
            });
            return OfferIntake::Defer(self.timing.impolite_grace);
        }
        self.held = None;
        OfferIntake::Apply(description)
    }

    /// Looks at the held offer again once its deferral elapsed.
    pub fn reconsider(&mut self, now: Instant) -> Reconsideration {
        let Some(held) = self.held.take() else {
            return Reconsideration::Idle;
        };
        if self.state == NegotiationState::Closing {
            return Reconsideration::Idle;
        }
        if self.ignore_offer {
            self.ignore_offer = false;
            return Reconsideration::Superseded;
        }
        if let Some(wait) = self.lock_remaining(now) {
            self.held = Some(held);
            return Reconsideration::Defer(wait);
        }
        tracing::trace!(
            target = "chorus::negotiation",
            held_for_ms = now.duration_since(held.received_at).as_millis() as u64,
            "releasing held offer"
        );
        self.last_offer_at = Some(now);
        Reconsideration::Apply(held.description)
    }

    pub fn receive_answer(&mut self, transport: SignalingState) -> AnswerIntake {
        match transport {
            SignalingState::HaveLocalOffer => AnswerIntake::Apply,
            SignalingState::Stable if self.rolled_back_local_offer => {
                self.rolled_back_local_offer = false;
                if self.role.is_polite() {
                    AnswerIntake::Ignore
                } else {
                    AnswerIntake::Reoffer
                }
            }
            _ => AnswerIntake::Ignore,
        }
    }

    /// Asks to start a local offer.
    pub fn request_offer(
        &mut self,
        ice_restart: bool,
        now: Instant,
        transport_stable: bool,
    ) -> OfferGate {
        if self.state == NegotiationState::Closing {
            return OfferGate::Skip { retry_in: None };
        }
        let restart = ice_restart || self.owed == Some(true);
        if self.making_offer || self.state != NegotiationState::Stable || !transport_stable {
            self.owed = Some(restart);
            return OfferGate::Skip { retry_in: None };
        }
        if let Some(wait) = self.lock_remaining(now) {
            self.owed = Some(restart);
            return OfferGate::Skip {
                retry_in: Some(wait),
            };
        }
        self.owed = None;
        self.making_offer = true;
        OfferGate::Proceed {
            ice_restart: restart,
        }
    }

    /// A renegotiation was skipped and is still owed.
    pub fn owes_offer(&self) -> bool {
        self.owed.is_some()
    }

    pub fn local_offer_set(&mut self) -> Result<(), IllegalTransition> {
        self.making_offer = false;
        self.step(NegotiationStep::LocalOffer)
    }

    /// The offer attempt ended without a local description being set.
    pub fn offer_abandoned(&mut self) {
        self.making_offer = false;
    }

    pub fn rolled_back(&mut self) -> Result<(), IllegalTransition> {
        if self.state == NegotiationState::HaveLocalOffer {
            self.rolled_back_local_offer = true;
        }
        self.making_offer = false;
        self.step(NegotiationStep::Rollback)
    }

    pub fn remote_offer_set(&mut self) -> Result<(), IllegalTransition> {
        self.step(NegotiationStep::RemoteOffer)?;
        self.remote_description_applied = true;
        Ok(())
    }

    pub fn answer_sent(&mut self, now: Instant) -> Result<(), IllegalTransition> {
        self.step(NegotiationStep::LocalAnswer)?;
        self.locked_until = Some(now + self.timing.answer_lock);
        Ok(())
    }

    pub fn remote_answer_set(&mut self) -> Result<(), IllegalTransition> {
        self.step(NegotiationStep::RemoteAnswer)?;
        self.remote_description_applied = true;
        self.rolled_back_local_offer = false;
        // An offer still held from this peer was sent before it accepted
        // ours; it has been rolled back on its side.
        if self.held.is_some() {
            self.ignore_offer = true;
        }
        Ok(())
    }

    /// Realigns with the transport after a failed media call.
    pub fn resync(&mut self, transport: SignalingState) {
        self.making_offer = false;
        self.state = NegotiationState::mirror(transport);
    }

    pub fn close(&mut self) {
        self.making_offer = false;
        self.held = None;
        self.owed = None;
        self.state = NegotiationState::Closing;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiator(role: Role) -> Negotiator {
        Negotiator::new(role, NegotiationTiming::default())
    }

    fn offer(tag: &str) -> SessionDescription {
        SessionDescription::offer(format!("v=0\r\ns={tag}\r\n"))
    }

    #[test]
    fn role_follows_id_order() {
        assert_eq!(Role::for_pair("a1", "b2"), Role::Polite);
        assert_eq!(Role::for_pair("b2", "a1"), Role::Impolite);
    }

    #[test]
    fn transition_table_rejects_illegal_steps() {
        let state = NegotiationState::Stable;
        assert_eq!(
            state.apply(NegotiationStep::LocalAnswer),
            Err(IllegalTransition {
                state,
                step: NegotiationStep::LocalAnswer
            })
        );
        assert_eq!(
            NegotiationState::HaveLocalOffer.apply(NegotiationStep::RemoteAnswer),
            Ok(NegotiationState::Stable)
        );
        assert!(
            NegotiationState::Closing
                .apply(NegotiationStep::RemoteOffer)
                .is_err()
        );
    }

    #[test]
    fn second_offer_inside_debounce_is_dropped() {
        let mut n = negotiator(Role::Polite);
        let start = Instant::now();
        assert!(matches!(n.receive_offer(offer("1"), start, true), OfferIntake::Apply(_)));
        assert_eq!(
            n.receive_offer(offer("2"), start + Duration::from_millis(100), true),
            OfferIntake::Drop
        );
        assert!(matches!(
            n.receive_offer(offer("3"), start + Duration::from_millis(400), true),
            OfferIntake::Apply(_)
        ));
    }

    #[test]
    fn lock_defers_before_debounce_applies() {
        let mut n = negotiator(Role::Polite);
        let start = Instant::now();
        let OfferIntake::Apply(_) = n.receive_offer(offer("1"), start, true) else {
            panic!("first offer applies");
        };
        n.remote_offer_set().unwrap();
        n.answer_sent(start).unwrap();

        let intake = n.receive_offer(offer("2"), start + Duration::from_millis(100), true);
        assert_eq!(intake, OfferIntake::Defer(Duration::from_millis(950)));
        assert_eq!(
            n.reconsider(start + Duration::from_millis(1050)),
            Reconsideration::Apply(offer("2"))
        );
    }

    #[test]
    fn impolite_side_holds_colliding_offer() {
        let mut n = negotiator(Role::Impolite);
        let now = Instant::now();
        assert_eq!(
            n.request_offer(false, now, true),
            OfferGate::Proceed { ice_restart: false }
        );
        n.local_offer_set().unwrap();

        let intake = n.receive_offer(offer("remote"), now, false);
        assert_eq!(intake, OfferIntake::Defer(Duration::from_millis(200)));

        // Nothing settled during the grace window: accept it anyway.
        assert_eq!(
            n.reconsider(now + Duration::from_millis(200)),
            Reconsideration::Apply(offer("remote"))
        );
    }

    #[test]
    fn polite_side_accepts_colliding_offer_at_once() {
        let mut n = negotiator(Role::Polite);
        let now = Instant::now();
        n.request_offer(false, now, true);
        n.local_offer_set().unwrap();
        assert!(matches!(
            n.receive_offer(offer("remote"), now, false),
            OfferIntake::Apply(_)
        ));
        n.rolled_back().unwrap();
        n.remote_offer_set().unwrap();
        n.answer_sent(now).unwrap();

        // Our own rolled-back offer is answered later: crossed answer.
        assert_eq!(n.receive_answer(SignalingState::Stable), AnswerIntake::Ignore);
    }

    #[test]
    fn held_offer_is_superseded_when_our_offer_is_answered() {
        let mut n = negotiator(Role::Impolite);
        let now = Instant::now();
        n.request_offer(false, now, true);
        n.local_offer_set().unwrap();
        n.receive_offer(offer("remote"), now, false);

        assert_eq!(
            n.receive_answer(SignalingState::HaveLocalOffer),
            AnswerIntake::Apply
        );
        n.remote_answer_set().unwrap();
        assert!(n.ignore_offer());
        assert_eq!(
            n.reconsider(now + Duration::from_millis(200)),
            Reconsideration::Superseded
        );
        assert!(!n.ignore_offer());
    }

    #[test]
    fn impolite_side_reoffers_after_crossed_rollbacks() {
        let mut n = negotiator(Role::Impolite);
        let now = Instant::now();
        n.request_offer(false, now, true);
        n.local_offer_set().unwrap();
        n.receive_offer(offer("remote"), now, false);
        let Reconsideration::Apply(_) = n.reconsider(now + Duration::from_millis(200)) else {
            panic!("held offer applies");
        };
        n.rolled_back().unwrap();
        n.remote_offer_set().unwrap();
        n.answer_sent(now).unwrap();

        assert_eq!(n.receive_answer(SignalingState::Stable), AnswerIntake::Reoffer);
        // Only once.
        assert_eq!(n.receive_answer(SignalingState::Stable), AnswerIntake::Ignore);
    }

    #[test]
    fn skipped_offer_is_owed_until_stable() {
        let mut n = negotiator(Role::Polite);
        let now = Instant::now();
        assert!(matches!(n.receive_offer(offer("1"), now, true), OfferIntake::Apply(_)));
        n.remote_offer_set().unwrap();

        assert_eq!(
            n.request_offer(true, now, false),
            OfferGate::Skip { retry_in: None }
        );
        assert!(n.owes_offer());
        n.answer_sent(now).unwrap();
        assert!(n.owes_offer());

        // The answer lock still gates the retried offer.
        assert_eq!(
            n.request_offer(true, now + Duration::from_millis(500), true),
            OfferGate::Skip {
                retry_in: Some(Duration::from_millis(550))
            }
        );
        assert_eq!(
            n.request_offer(false, now + Duration::from_millis(1100), true),
            OfferGate::Proceed { ice_restart: true }
        );
        assert!(!n.owes_offer());
    }
}
