//! Channel membership: one actor task per joined channel owns every peer
//! connection, timer and local track of that membership.
//!
//! Signaling messages, media callbacks, timers and handle commands all land
//! in the actor's loop and are processed one at a time, media calls awaited
//! inline. [`MeshClient`] keeps at most one live channel per user.

mod actor;
mod peer;
mod timer;

pub use peer::NegotiationError;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::PeerId;
use crate::av_sync::{PlaybackClocks, SyncTiming};
use crate::health::{ChannelStatus, HealthTiming};
use crate::media::devices::{CaptureDevices, CaptureError, DevicePreferences, acquire_microphone};
use crate::media::{
    ConnectionState, IceConnectionState, IceServer, MediaError, MediaKind, PeerConnectionFactory,
    TrackRole,
};
use crate::negotiation::{NegotiationState, NegotiationTiming};
use crate::scheduler::SchedulerTiming;
use crate::signaling::{Participant, SignalingError, SignalingTransport};
use crate::speaking::SpeakingTiming;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionTiming {
    pub negotiation: NegotiationTiming,
    pub scheduler: SchedulerTiming,
    pub health: HealthTiming,
    pub speaking: SpeakingTiming,
    pub sync: SyncTiming,
    /// Quiet period after a local track change before renegotiating.
    pub renegotiate_debounce: Duration,
    /// Extra wait before a newcomer offers to the members already present,
    /// leaving them the first move.
    pub join_initiate_delay: Duration,
    /// Added to the tier's base stagger before an existing member offers to
    /// a newcomer.
    pub user_joined_delay: Duration,
    /// After a forced rebuild the impolite side offers only if the polite
    /// side stayed silent this long.
    pub rebuild_fallback: Duration,
    pub heartbeat_interval: Duration,
    pub force_reconnect_dedupe: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            negotiation: NegotiationTiming::default(),
            scheduler: SchedulerTiming::default(),
            health: HealthTiming::default(),
            speaking: SpeakingTiming::default(),
            sync: SyncTiming::default(),
            renegotiate_debounce: Duration::from_millis(500),
            join_initiate_delay: Duration::from_secs(2),
            user_joined_delay: Duration::ZERO,
            rebuild_fallback: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(20),
            force_reconnect_dedupe: Duration::from_secs(5),
        }
    }
}

/// Observable changes of a channel membership.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SessionEvent {
    Status {
        status: ChannelStatus,
    },
    PeerState {
        peer_id: PeerId,
        state: ConnectionState,
    },
    RemoteTrackAdded {
        peer_id: PeerId,
        track_id: String,
        kind: MediaKind,
        role: Option<TrackRole>,
    },
    RemoteTrackRemoved {
        peer_id: PeerId,
        track_id: String,
    },
    /// Speaking edge; `peer_id` is the local id for the local microphone.
    Speaking {
        peer_id: PeerId,
        speaking: bool,
    },
    ParticipantJoined {
        participant: Participant,
    },
    ParticipantUpdated {
        participant: Participant,
    },
    ParticipantLeft {
        peer_id: PeerId,
    },
    TrackState {
        peer_id: PeerId,
        role: TrackRole,
        enabled: bool,
    },
    /// A remote peer asked us to resynchronise its playback.
    Resync {
        peer_id: PeerId,
    },
    Error {
        message: String,
    },
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("channel session closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub connection: ConnectionState,
    pub ice: IceConnectionState,
    pub negotiation: NegotiationState,
    pub senders: Vec<TrackRole>,
    pub remote_tracks: usize,
    pub speaking: bool,
    pub syncing: bool,
}

#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    pub channel_id: String,
    pub local_id: PeerId,
    pub status: ChannelStatus,
    pub muted: bool,
    pub local_tracks: Vec<TrackRole>,
    pub participants: Vec<Participant>,
    pub peers: Vec<PeerSnapshot>,
    pub queued: usize,
    pub active: usize,
    pub ice_servers: Vec<IceServer>,
}

impl ChannelSnapshot {
    pub fn peer(&self, peer_id: &str) -> Option<&PeerSnapshot> {
        self.peers.iter().find(|peer| peer.peer_id == peer_id)
    }
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

pub(crate) enum SessionCommand {
    SetCamera {
        enabled: bool,
        reply: Reply<()>,
    },
    SetScreenShare {
        enabled: bool,
        with_audio: bool,
        reply: Reply<()>,
    },
    SwitchMicrophone {
        device_id: Option<String>,
        reply: Reply<()>,
    },
    SetMuted(bool),
    RequestConnection(PeerId),
    AttachPlayback {
        peer_id: PeerId,
        clocks: Arc<dyn PlaybackClocks>,
    },
    DetachPlayback(PeerId),
    Snapshot(oneshot::Sender<ChannelSnapshot>),
}

/// Everything a channel session talks to.
#[derive(Clone)]
pub struct SessionDeps {
    pub signaling: Arc<dyn SignalingTransport>,
    pub factory: Arc<dyn PeerConnectionFactory>,
    pub devices: Arc<dyn CaptureDevices>,
    pub preferences: Arc<dyn DevicePreferences>,
    /// Used until the server hands out its own list.
    pub fallback_ice_servers: Vec<IceServer>,
    pub timing: SessionTiming,
}

/// Cheap handle on a running channel session.
#[derive(Clone)]
pub struct ChannelHandle {
    channel_id: String,
    local_id: PeerId,
    commands: mpsc::UnboundedSender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ChannelHandle {
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.commands.is_closed()
    }

    fn command(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Closed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(build(reply))?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn set_camera(&self, enabled: bool) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::SetCamera { enabled, reply })
            .await
    }

    pub async fn set_screen_share(&self, enabled: bool, with_audio: bool) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::SetScreenShare {
            enabled,
            with_audio,
            reply,
        })
        .await
    }

    /// Swaps the microphone in place; `None` selects the system default.
    pub async fn switch_microphone(&self, device_id: Option<String>) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::SwitchMicrophone { device_id, reply })
            .await
    }

    pub fn set_muted(&self, muted: bool) -> Result<(), SessionError> {
        self.command(SessionCommand::SetMuted(muted))
    }

    /// Queues a connection attempt to `peer_id` through the scheduler.
    pub fn request_connection(&self, peer_id: impl Into<PeerId>) -> Result<(), SessionError> {
        self.command(SessionCommand::RequestConnection(peer_id.into()))
    }

    /// Hands over the playback clocks used for A/V sync with `peer_id`.
    pub fn attach_playback(
        &self,
        peer_id: impl Into<PeerId>,
        clocks: Arc<dyn PlaybackClocks>,
    ) -> Result<(), SessionError> {
        self.command(SessionCommand::AttachPlayback {
            peer_id: peer_id.into(),
            clocks,
        })
    }

    pub fn detach_playback(&self, peer_id: impl Into<PeerId>) -> Result<(), SessionError> {
        self.command(SessionCommand::DetachPlayback(peer_id.into()))
    }

    pub async fn snapshot(&self) -> Result<ChannelSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::Snapshot(reply))?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Leaves the channel and waits for the session to wind down.
    pub async fn leave(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                debug!(target = "chorus::session", error = %err, "session task ended abnormally");
            }
        }
    }
}

/// Joins `channel_id`: opens the microphone, connects signaling, announces
/// ourselves and starts the channel actor.
///
/// A microphone failure aborts the join; nothing is left running.
pub async fn join_channel(
    deps: &SessionDeps,
    channel_id: &str,
    local_id: &str,
    display_name: Option<String>,
    cancel: CancellationToken,
) -> Result<ChannelHandle, SessionError> {
    let microphone =
        acquire_microphone(deps.devices.as_ref(), deps.preferences.as_ref(), &cancel).await?;
    if cancel.is_cancelled() {
        return Err(SessionError::Capture(CaptureError::Cancelled));
    }
    let connection = deps.signaling.connect(channel_id, local_id).await?;

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
    let actor = actor::ChannelActor::new(
        deps,
        channel_id,
        local_id,
        display_name,
        microphone,
        connection.sink,
        events_tx.clone(),
        cancel.clone(),
    );
    info!(
        target = "chorus::session",
        channel_id,
        peer_id = local_id,
        "joining channel"
    );
    let task = tokio::spawn(actor.run(connection.inbound, commands_rx));
    Ok(ChannelHandle {
        channel_id: channel_id.to_string(),
        local_id: local_id.to_string(),
        commands: commands_tx,
        events: events_tx,
        cancel,
        task: Arc::new(Mutex::new(Some(task))),
    })
}

/// One user's voice client: at most one joined channel at a time.
pub struct MeshClient {
    deps: SessionDeps,
    local_id: PeerId,
    display_name: Option<String>,
    attempts: AtomicU64,
    pending: Mutex<Option<(u64, CancellationToken)>>,
    current: tokio::sync::Mutex<Option<ChannelHandle>>,
}

impl MeshClient {
    pub fn new(deps: SessionDeps, local_id: impl Into<PeerId>, display_name: Option<String>) -> Self {
        Self {
            deps,
            local_id: local_id.into(),
            display_name,
            attempts: AtomicU64::new(0),
            pending: Mutex::new(None),
            current: tokio::sync::Mutex::new(None),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Joins `channel_id`, tearing down the current channel first. A join
    /// still acquiring devices is cancelled.
    pub async fn join(&self, channel_id: &str) -> Result<ChannelHandle, SessionError> {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        if let Some((_, previous)) = self.pending.lock().replace((attempt, cancel.clone())) {
            previous.cancel();
        }
        let mut current = self.current.lock().await;
        if let Some(handle) = current.take() {
            info!(
                target = "chorus::session",
                channel_id = handle.channel_id(),
                "leaving channel before joining another"
            );
            handle.leave().await;
        }
        let joined = join_channel(
            &self.deps,
            channel_id,
            &self.local_id,
            self.display_name.clone(),
            cancel.clone(),
        )
        .await;
        {
            let mut pending = self.pending.lock();
            if pending.as_ref().is_some_and(|(id, _)| *id == attempt) {
                *pending = None;
            }
        }
        let handle = joined?;
        *current = Some(handle.clone());
        Ok(handle)
    }

    pub async fn leave(&self) {
        if let Some((_, pending)) = self.pending.lock().take() {
            pending.cancel();
        }
        if let Some(handle) = self.current.lock().await.take() {
            handle.leave().await;
        }
    }

    pub async fn current(&self) -> Option<ChannelHandle> {
        self.current
            .lock()
            .await
            .clone()
            .filter(|handle| !handle.is_closed())
    }
}
