use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::av_sync::SyncTiming;
use crate::health::HealthTiming;
use crate::media::IceServer;
use crate::negotiation::NegotiationTiming;
use crate::scheduler::SchedulerTiming;
use crate::session::SessionTiming;
use crate::speaking::SpeakingTiming;

const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChorusConfig {
    #[serde(default)]
    pub signaling_url: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub peer_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub log_path: Option<String>,
    /// Comma separated STUN/TURN urls used until the server sends its own.
    #[serde(default)]
    pub ice_fallback: Option<String>,
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Every timing knob, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub offer_debounce_ms: u64,
    pub answer_lock_ms: u64,
    pub impolite_grace_ms: u64,
    pub renegotiate_debounce_ms: u64,
    pub join_initiate_delay_ms: u64,
    pub user_joined_delay_ms: u64,
    pub rebuild_fallback_ms: u64,
    pub slot_settle_ms: u64,
    pub batch_spacing_ms: u64,
    pub health_interval_ms: u64,
    pub ice_disconnect_grace_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub force_reconnect_dedupe_ms: u64,
    pub local_speaking_ms: u64,
    pub remote_speaking_ms: u64,
    pub av_sync_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            offer_debounce_ms: 300,
            answer_lock_ms: 1_000,
            impolite_grace_ms: 200,
            renegotiate_debounce_ms: 500,
            join_initiate_delay_ms: 2_000,
            user_joined_delay_ms: 0,
            rebuild_fallback_ms: 5_000,
            slot_settle_ms: 4_000,
            batch_spacing_ms: 6_000,
            health_interval_ms: 10_000,
            ice_disconnect_grace_ms: 4_000,
            heartbeat_interval_ms: 20_000,
            force_reconnect_dedupe_ms: 5_000,
            local_speaking_ms: 100,
            remote_speaking_ms: 120,
            av_sync_interval_ms: 5_000,
        }
    }
}

impl ChorusConfig {
    /// Reads `CHORUS_*` variables; nested keys use `__`
    /// (`CHORUS_TIMING__ANSWER_LOCK_MS`).
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_environment(None)
    }

    fn from_environment(source: Option<HashMap<String, String>>) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("CHORUS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(source),
            )
            .build()
            .and_then(|c| c.try_deserialize::<ChorusConfig>())
            .map(ChorusConfig::normalize)
    }

    fn normalize(mut self) -> Self {
        self.signaling_url = Self::normalize_opt(self.signaling_url.take());
        self.channel_id = Self::normalize_opt(self.channel_id.take());
        self.peer_id = Self::normalize_opt(self.peer_id.take());
        self.display_name = Self::normalize_opt(self.display_name.take());
        self.log_path = Self::normalize_opt(self.log_path.take());
        self.ice_fallback = Self::normalize_opt(self.ice_fallback.take());
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    pub fn fallback_ice_servers(&self) -> Vec<IceServer> {
        let urls: Vec<String> = self
            .ice_fallback
            .as_deref()
            .unwrap_or(DEFAULT_STUN)
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .collect();
        if urls.is_empty() {
            return Vec::new();
        }
        vec![IceServer {
            urls,
            ..Default::default()
        }]
    }

    pub fn session_timing(&self) -> SessionTiming {
        let t = &self.timing;
        let ms = Duration::from_millis;
        SessionTiming {
            negotiation: NegotiationTiming {
                offer_debounce: ms(t.offer_debounce_ms),
                answer_lock: ms(t.answer_lock_ms),
                impolite_grace: ms(t.impolite_grace_ms),
                ..NegotiationTiming::default()
            },
            scheduler: SchedulerTiming {
                settle: ms(t.slot_settle_ms),
                batch_spacing: ms(t.batch_spacing_ms),
            },
            health: HealthTiming {
                interval: ms(t.health_interval_ms),
                ice_disconnect_grace: ms(t.ice_disconnect_grace_ms),
                stuck_new: ms(t.health_interval_ms),
            },
            speaking: SpeakingTiming {
                local_interval: ms(t.local_speaking_ms),
                remote_interval: ms(t.remote_speaking_ms),
                ..SpeakingTiming::default()
            },
            sync: SyncTiming {
                interval: ms(t.av_sync_interval_ms),
                ..SyncTiming::default()
            },
            renegotiate_debounce: ms(t.renegotiate_debounce_ms),
            join_initiate_delay: ms(t.join_initiate_delay_ms),
            user_joined_delay: ms(t.user_joined_delay_ms),
            rebuild_fallback: ms(t.rebuild_fallback_ms),
            heartbeat_interval: ms(t.heartbeat_interval_ms),
            force_reconnect_dedupe: ms(t.force_reconnect_dedupe_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> ChorusConfig {
        let source = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ChorusConfig::from_environment(Some(source)).expect("config")
    }

    #[test]
    fn defaults_without_environment() {
        let config = env(&[]);
        assert_eq!(config.timing.answer_lock_ms, 1_000);
        assert_eq!(config.session_timing().heartbeat_interval, Duration::from_secs(20));
        assert_eq!(config.fallback_ice_servers()[0].urls, vec![DEFAULT_STUN.to_string()]);
    }

    #[test]
    fn nested_timing_and_blank_strings() {
        let config = env(&[
            ("CHORUS_CHANNEL_ID", "  "),
            ("CHORUS_SIGNALING_URL", " wss://voice.example.org/ws "),
            ("CHORUS_TIMING__ANSWER_LOCK_MS", "1500"),
            ("CHORUS_ICE_FALLBACK", "stun:a.example, stun:b.example"),
        ]);
        assert_eq!(config.channel_id, None);
        assert_eq!(config.signaling_url.as_deref(), Some("wss://voice.example.org/ws"));
        assert_eq!(
            config.session_timing().negotiation.answer_lock,
            Duration::from_millis(1500)
        );
        assert_eq!(config.fallback_ice_servers()[0].urls.len(), 2);
    }
}
