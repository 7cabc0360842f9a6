use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::PeerId;
use crate::media::{ConnectionState, IceCandidate, IceServer, SessionDescription, TrackRole};

pub mod local;
pub mod websocket;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub peer_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub muted: bool,
}

impl Participant {
    pub fn new(peer_id: impl Into<PeerId>) -> Self {
        Self {
            peer_id: peer_id.into(),
            display_name: None,
            muted: false,
        }
    }
}

/// Who a `force-reconnect` instruction applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReconnectTarget {
    All,
    Peer(PeerId),
}

impl From<String> for ReconnectTarget {
    fn from(value: String) -> Self {
        if value == "all" {
            ReconnectTarget::All
        } else {
            ReconnectTarget::Peer(value)
        }
    }
}

impl From<ReconnectTarget> for String {
    fn from(value: ReconnectTarget) -> Self {
        match value {
            ReconnectTarget::All => "all".to_string(),
            ReconnectTarget::Peer(peer) => peer,
        }
    }
}

/// Channel-scoped signaling message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    #[serde(rename_all = "camelCase")]
    Join {
        channel_id: String,
        peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    #[serde(alias = "participant-list", rename_all = "camelCase")]
    Participants {
        channel_id: String,
        participants: Vec<Participant>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ice_servers: Option<Vec<IceServer>>,
    },
    #[serde(rename_all = "camelCase")]
    Offer {
        channel_id: String,
        from: PeerId,
        to: PeerId,
        description: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        channel_id: String,
        from: PeerId,
        to: PeerId,
        description: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        channel_id: String,
        from: PeerId,
        to: PeerId,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    Leave { channel_id: String, peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    UserJoined {
        channel_id: String,
        participant: Participant,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft { channel_id: String, peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    UserReconnected { channel_id: String, peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    UserUpdated {
        channel_id: String,
        participant: Participant,
    },
    #[serde(rename_all = "camelCase")]
    TrackState {
        channel_id: String,
        peer_id: PeerId,
        role: TrackRole,
        enabled: bool,
    },
    #[serde(rename_all = "camelCase")]
    Heartbeat { channel_id: String, peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    ForceReconnect {
        channel_id: String,
        target: ReconnectTarget,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ResyncRequest {
        channel_id: String,
        from: PeerId,
        to: PeerId,
    },
    #[serde(rename_all = "camelCase")]
    ConnectionReport {
        channel_id: String,
        peer_id: PeerId,
        remote_peer: PeerId,
        state: ConnectionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous: Option<ConnectionState>,
    },
}

impl SignalMessage {
    pub fn channel_id(&self) -> &str {
        match self {
            SignalMessage::Join { channel_id, .. }
            | SignalMessage::Participants { channel_id, .. }
            | SignalMessage::Offer { channel_id, .. }
            | SignalMessage::Answer { channel_id, .. }
            | SignalMessage::IceCandidate { channel_id, .. }
            | SignalMessage::Leave { channel_id, .. }
            | SignalMessage::UserJoined { channel_id, .. }
            | SignalMessage::UserLeft { channel_id, .. }
            | SignalMessage::UserReconnected { channel_id, .. }
            | SignalMessage::UserUpdated { channel_id, .. }
            | SignalMessage::TrackState { channel_id, .. }
            | SignalMessage::Heartbeat { channel_id, .. }
            | SignalMessage::ForceReconnect { channel_id, .. }
            | SignalMessage::ResyncRequest { channel_id, .. }
            | SignalMessage::ConnectionReport { channel_id, .. } => channel_id,
        }
    }

    /// Addressee of a peer-to-peer message; `None` for server and broadcast
    /// traffic.
    pub fn recipient(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer { to, .. }
            | SignalMessage::Answer { to, .. }
            | SignalMessage::IceCandidate { to, .. }
            | SignalMessage::ResyncRequest { to, .. } => Some(to),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Join { .. } => "join",
            SignalMessage::Participants { .. } => "participants",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
            SignalMessage::Leave { .. } => "leave",
            SignalMessage::UserJoined { .. } => "user-joined",
            SignalMessage::UserLeft { .. } => "user-left",
            SignalMessage::UserReconnected { .. } => "user-reconnected",
            SignalMessage::UserUpdated { .. } => "user-updated",
            SignalMessage::TrackState { .. } => "track-state",
            SignalMessage::Heartbeat { .. } => "heartbeat",
            SignalMessage::ForceReconnect { .. } => "force-reconnect",
            SignalMessage::ResyncRequest { .. } => "resync-request",
            SignalMessage::ConnectionReport { .. } => "connection-report",
        }
    }
}

impl fmt::Display for SignalMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind(), self.channel_id())
    }
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling connection closed")]
    Closed,
    #[error("invalid signaling url: {0}")]
    Url(#[from] url::ParseError),
    #[error("signaling transport error: {0}")]
    Transport(String),
    #[error("failed to encode signaling message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outbound half of a signaling connection. Sends are queued, never block.
pub trait SignalSink: Send + Sync {
    fn send(&self, message: SignalMessage) -> Result<(), SignalingError>;
}

/// A joined signaling connection: the outbound sink and the ordered stream
/// of inbound messages for this participant.
pub struct SignalingConnection {
    pub sink: std::sync::Arc<dyn SignalSink>,
    pub inbound: mpsc::UnboundedReceiver<SignalMessage>,
}

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn connect(
        &self,
        channel_id: &str,
        peer_id: &str,
    ) -> Result<SignalingConnection, SignalingError>;
}
