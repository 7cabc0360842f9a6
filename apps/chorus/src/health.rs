//! Connection watchdog and channel status aggregation.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::media::{ConnectionState, IceConnectionState};

#[derive(Debug, Clone)]
pub struct HealthTiming {
    pub interval: Duration,
    /// ICE may stay `disconnected` this long before a restart.
    pub ice_disconnect_grace: Duration,
    /// A connection still `new` after this long is restarted.
    pub stuck_new: Duration,
}

impl Default for HealthTiming {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            ice_disconnect_grace: Duration::from_secs(4),
            stuck_new: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    TearDown,
    RestartIce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Connection lifecycle of one peer as the watchdog sees it.
#[derive(Debug, Clone)]
pub struct PeerHealth {
    lifecycle: ConnectionState,
    ice: IceConnectionState,
    created_at: Instant,
    ice_disconnected_since: Option<Instant>,
}

impl PeerHealth {
    pub fn new(now: Instant) -> Self {
        Self {
            lifecycle: ConnectionState::New,
            ice: IceConnectionState::New,
            created_at: now,
            ice_disconnected_since: None,
        }
    }

    pub fn lifecycle(&self) -> ConnectionState {
        self.lifecycle
    }

    pub fn ice(&self) -> IceConnectionState {
        self.ice
    }

    /// Records a transport state change; terminal states are final.
    pub fn observe_connection(&mut self, state: ConnectionState) -> Option<Transition> {
        if self.lifecycle.is_terminal() || self.lifecycle == state {
            return None;
        }
        let transition = Transition {
            from: self.lifecycle,
            to: state,
        };
        self.lifecycle = state;
        Some(transition)
    }

    pub fn observe_ice(&mut self, state: IceConnectionState, now: Instant) {
        match state {
            IceConnectionState::Disconnected => {
                self.ice_disconnected_since.get_or_insert(now);
            }
            _ => self.ice_disconnected_since = None,
        }
        self.ice = state;
    }

    /// Usable for sending media right now.
    pub fn is_usable(&self) -> bool {
        !self.lifecycle.is_terminal() && self.ice != IceConnectionState::Disconnected
    }
}

#[derive(Debug, Clone, Default)]
pub struct HealthMonitor {
    timing: HealthTiming,
}

impl HealthMonitor {
    pub fn new(timing: HealthTiming) -> Self {
        Self { timing }
    }

    pub fn interval(&self) -> Duration {
        self.timing.interval
    }

    /// One watchdog pass over a peer.
    pub fn evaluate(&self, peer: &mut PeerHealth, now: Instant) -> Option<HealthAction> {
        if peer.lifecycle.is_terminal() {
            return Some(HealthAction::TearDown);
        }
        if let Some(since) = peer.ice_disconnected_since {
            if now.duration_since(since) > self.timing.ice_disconnect_grace {
                // Restart the clock so one outage triggers one restart per grace period.
                peer.ice_disconnected_since = Some(now);
                return Some(HealthAction::RestartIce);
            }
        }
        if peer.lifecycle == ConnectionState::New
            && now.duration_since(peer.created_at) >= self.timing.stuck_new
        {
            peer.created_at = now;
            return Some(HealthAction::RestartIce);
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelStatus {
    Connecting,
    Connected,
    Degraded,
    Error,
}

/// Channel-wide label over every peer's lifecycle. `fatal` marks a
/// membership that can no longer work, e.g. a lost signaling connection.
/// With every peer failed or closed nothing is reachable, which is an error
/// as well.
pub fn aggregate_status<I>(states: I, fatal: bool) -> ChannelStatus
where
    I: IntoIterator<Item = ConnectionState>,
{
    if fatal {
        return ChannelStatus::Error;
    }
    let mut peers = 0usize;
    let mut terminal = 0usize;
    let mut all_connected = true;
    let mut troubled = false;
    for state in states {
        peers += 1;
        match state {
            ConnectionState::Connected => {}
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed => {
                all_connected = false;
                troubled = true;
                if state.is_terminal() {
                    terminal += 1;
                }
            }
            _ => all_connected = false,
        }
    }
    if peers > 0 && terminal == peers {
        ChannelStatus::Error
    } else if all_connected {
        ChannelStatus::Connected
    } else if troubled {
        ChannelStatus::Degraded
    } else {
        ChannelStatus::Connecting
    }
}
