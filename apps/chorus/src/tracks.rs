//! Outbound track bindings and their senders on each peer connection.

use std::collections::{BTreeMap, HashMap};

use crate::media::{LocalTrack, MediaError, PeerConnection, SenderId, TrackRole};

/// The local tracks currently published, one per role.
#[derive(Debug, Default)]
pub struct TrackBindings {
    bindings: BTreeMap<TrackRole, LocalTrack>,
}

impl TrackBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `track` to its role, returning the track it replaced.
    pub fn bind(&mut self, track: LocalTrack) -> Option<LocalTrack> {
        self.bindings.insert(track.role(), track)
    }

    pub fn unbind(&mut self, role: TrackRole) -> Option<LocalTrack> {
        self.bindings.remove(&role)
    }

    pub fn get(&self, role: TrackRole) -> Option<&LocalTrack> {
        self.bindings.get(&role)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalTrack> {
        self.bindings.values()
    }

    pub fn roles(&self) -> Vec<TrackRole> {
        self.bindings.keys().copied().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BoundSender {
    sender: SenderId,
    track_id: String,
}

/// What a sender update did to one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderChange {
    Added,
    Replaced,
    Removed,
    Unchanged,
}

impl SenderChange {
    /// Added and removed senders change the negotiated media sections.
    pub fn needs_renegotiation(self) -> bool {
        matches!(self, SenderChange::Added | SenderChange::Removed)
    }
}

/// Senders attached to one peer connection, keyed by role.
#[derive(Debug, Default)]
pub struct PeerSenders {
    senders: HashMap<TrackRole, BoundSender>,
}

impl PeerSenders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(&self, role: TrackRole) -> Option<SenderId> {
        self.senders.get(&role).map(|bound| bound.sender)
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Publishes `track` on `pc`, reusing the role's sender when present.
    pub async fn attach(
        &mut self,
        pc: &dyn PeerConnection,
        track: &LocalTrack,
    ) -> Result<SenderChange, MediaError> {
        let role = track.role();
        if let Some(bound) = self.senders.get_mut(&role) {
            if bound.track_id == track.id() {
                return Ok(SenderChange::Unchanged);
            }
            pc.replace_track(bound.sender, track).await?;
            bound.track_id = track.id().to_string();
            return Ok(SenderChange::Replaced);
        }
        let sender = pc.add_track(track).await?;
        self.senders.insert(
            role,
            BoundSender {
                sender,
                track_id: track.id().to_string(),
            },
        );
        Ok(SenderChange::Added)
    }

    /// Removes the role's sender from `pc` entirely.
    pub async fn detach(
        &mut self,
        pc: &dyn PeerConnection,
        role: TrackRole,
    ) -> Result<SenderChange, MediaError> {
        let Some(bound) = self.senders.remove(&role) else {
            return Ok(SenderChange::Unchanged);
        };
        match pc.remove_track(bound.sender).await {
            Ok(()) | Err(MediaError::UnknownSender(_)) => Ok(SenderChange::Removed),
            Err(err) => Err(err),
        }
    }

    /// Brings `pc` in line with `bindings`: missing roles are attached,
    /// stale tracks replaced and unbound roles removed. Returns whether a
    /// renegotiation is needed.
    pub async fn reconcile(
        &mut self,
        pc: &dyn PeerConnection,
        bindings: &TrackBindings,
    ) -> Result<bool, MediaError> {
        let mut renegotiate = false;
        let stale: Vec<TrackRole> = self
            .senders
            .keys()
            .copied()
            .filter(|role| bindings.get(*role).is_none())
            .collect();
        for role in stale {
            renegotiate |= self.detach(pc, role).await?.needs_renegotiation();
        }
        for track in bindings.iter() {
            renegotiate |= self.attach(pc, track).await?.needs_renegotiation();
        }
        Ok(renegotiate)
    }

    /// Forgets every sender without touching the connection.
    pub fn clear(&mut self) {
        self.senders.clear();
    }
}
