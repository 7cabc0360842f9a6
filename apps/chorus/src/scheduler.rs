//! Admission control for connection attempts.
//!
//! Attempts are queued per peer and launched in FIFO order once their
//! stagger delay elapsed and a concurrency slot is free. All limits come
//! from the tier matching the current channel load.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Small,
    Medium,
    Large,
    Huge,
    Massive,
}

impl Tier {
    /// Tier for `load` = connected peers plus pending requests.
    pub fn for_load(load: usize) -> Self {
        match load {
            0..=10 => Tier::Small,
            11..=25 => Tier::Medium,
            26..=50 => Tier::Large,
            51..=100 => Tier::Huge,
            _ => Tier::Massive,
        }
    }

    pub fn config(self) -> TierConfig {
        match self {
            Tier::Small => TierConfig {
                max_concurrent: 2,
                cooldown: Duration::from_millis(1000),
                base_stagger: Duration::from_millis(50),
                per_peer_stagger: Duration::from_millis(100),
                batch_size: 10,
            },
            Tier::Medium => TierConfig {
                max_concurrent: 2,
                cooldown: Duration::from_millis(1500),
                base_stagger: Duration::from_millis(100),
                per_peer_stagger: Duration::from_millis(150),
                batch_size: 10,
            },
            Tier::Large => TierConfig {
                max_concurrent: 1,
                cooldown: Duration::from_millis(2000),
                base_stagger: Duration::from_millis(200),
                per_peer_stagger: Duration::from_millis(200),
                batch_size: 15,
            },
            Tier::Huge => TierConfig {
                max_concurrent: 1,
                cooldown: Duration::from_millis(2500),
                base_stagger: Duration::from_millis(300),
                per_peer_stagger: Duration::from_millis(250),
                batch_size: 20,
            },
            Tier::Massive => TierConfig {
                max_concurrent: 1,
                cooldown: Duration::from_millis(3000),
                base_stagger: Duration::from_millis(400),
                per_peer_stagger: Duration::from_millis(280),
                batch_size: 20,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierConfig {
    pub max_concurrent: usize,
    pub cooldown: Duration,
    pub base_stagger: Duration,
    pub per_peer_stagger: Duration,
    pub batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub peer_id: PeerId,
    pub enqueued_at: Instant,
    pub ready_at: Instant,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum EnqueueRefused {
    #[error("a request for this peer is already queued")]
    AlreadyQueued,
    #[error("peer is cooling down for another {remaining:?}")]
    CoolingDown { remaining: Duration },
}

#[derive(Debug, Clone)]
pub struct SchedulerTiming {
    /// How long a launched attempt occupies its slot.
    pub settle: Duration,
    /// Gap between consecutive batches of a mass join.
    pub batch_spacing: Duration,
}

impl Default for SchedulerTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(4),
            batch_spacing: Duration::from_secs(6),
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnectionScheduler {
    timing: SchedulerTiming,
    queue: VecDeque<ConnectionRequest>,
    queued: HashSet<PeerId>,
    active: HashMap<PeerId, Instant>,
    cooldowns: HashMap<PeerId, Instant>,
}

impl ConnectionScheduler {
    pub fn new(timing: SchedulerTiming) -> Self {
        Self {
            timing,
            ..Default::default()
        }
    }

    pub fn timing(&self) -> &SchedulerTiming {
        &self.timing
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn is_queued(&self, peer_id: &str) -> bool {
        self.queued.contains(peer_id)
    }

    /// Queues an attempt that becomes ready after `delay`. With
    /// `bypass_cooldown` a recently launched peer may be queued again.
    pub fn enqueue(
        &mut self,
        peer_id: &str,
        now: Instant,
        delay: Duration,
        bypass_cooldown: bool,
    ) -> Result<(), EnqueueRefused> {
        if self.queued.contains(peer_id) {
            return Err(EnqueueRefused::AlreadyQueued);
        }
        if !bypass_cooldown {
            if let Some(until) = self.cooldowns.get(peer_id).filter(|until| **until > now) {
                return Err(EnqueueRefused::CoolingDown {
                    remaining: *until - now,
                });
            }
        }
        self.queued.insert(peer_id.to_string());
        self.queue.push_back(ConnectionRequest {
            peer_id: peer_id.to_string(),
            enqueued_at: now,
            ready_at: now + delay,
        });
        Ok(())
    }

    /// Drops any queued request and frees the peer's slot.
    pub fn remove(&mut self, peer_id: &str) -> bool {
        let was_queued = self.queued.remove(peer_id);
        if was_queued {
            self.queue.retain(|request| request.peer_id != peer_id);
        }
        let was_active = self.active.remove(peer_id).is_some();
        was_queued || was_active
    }

    /// Launches every request that may start now under the tier for `load`.
    pub fn poll(&mut self, now: Instant, load: usize) -> Vec<ConnectionRequest> {
        self.active.retain(|_, release_at| *release_at > now);
        let tier = Tier::for_load(load);
        let config = tier.config();
        let mut launched = Vec::new();
        while self.active.len() < config.max_concurrent {
            let Some(index) = self.queue.iter().position(|request| request.ready_at <= now) else {
                break;
            };
            let Some(request) = self.queue.remove(index) else {
                break;
            };
            self.queued.remove(&request.peer_id);
            self.active
                .insert(request.peer_id.clone(), now + self.timing.settle);
            self.cooldowns
                .insert(request.peer_id.clone(), now + config.cooldown);
            debug!(
                target = "chorus::scheduler",
                peer_id = %request.peer_id,
                ?tier,
                active = self.active.len(),
                queued = self.queue.len(),
                waited_ms = now.duration_since(request.enqueued_at).as_millis() as u64,
                "launching connection attempt"
            );
            launched.push(request);
        }
        self.cooldowns.retain(|_, until| *until > now);
        launched
    }

    /// When [`poll`](Self::poll) may next have something to launch.
    pub fn next_wakeup(&self, now: Instant, load: usize) -> Option<Instant> {
        let earliest_ready = self.queue.iter().map(|request| request.ready_at).min()?;
        let busy: Vec<Instant> = self
            .active
            .values()
            .copied()
            .filter(|release_at| *release_at > now)
            .collect();
        if busy.len() < Tier::for_load(load).config().max_concurrent {
            return Some(earliest_ready.max(now));
        }
        let earliest_release = busy.into_iter().min().unwrap_or(now);
        Some(earliest_ready.max(earliest_release))
    }
}

/// Start offsets for connecting to `peers` after joining a channel.
///
/// Peers are split into batches of the tier's `batch_size`, consecutive
/// batches `batch_spacing` apart. Inside a batch the offset is
/// `base_stagger + index * per_peer_stagger` plus up to half a per-peer
/// step of jitter; the first peer of a batch gets none, so batch starts
/// stay exactly `batch_spacing` apart. `initial_delay` is added to every
/// offset.
pub fn plan_batches<R: Rng + ?Sized>(
    peers: &[PeerId],
    config: &TierConfig,
    batch_spacing: Duration,
    initial_delay: Duration,
    rng: &mut R,
) -> Vec<(PeerId, Duration)> {
    let batch_size = config.batch_size.max(1);
    let jitter_ceiling = (config.per_peer_stagger.as_millis() / 2) as u64;
    peers
        .iter()
        .enumerate()
        .map(|(position, peer)| {
            let batch = (position / batch_size) as u32;
            let index = (position % batch_size) as u32;
            let jitter = if index == 0 {
                Duration::ZERO
            } else {
                Duration::from_millis(rng.gen_range(0..=jitter_ceiling))
            };
            let offset = initial_delay
                + batch_spacing * batch
                + config.base_stagger
                + config.per_peer_stagger * index
                + jitter;
            (peer.clone(), offset)
        })
        .collect()
}
