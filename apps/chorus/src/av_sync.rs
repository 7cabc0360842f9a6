//! Audio/video drift correction for remote playback.

use std::time::Duration;

use tokio::time::Instant;

/// Playback position of a remote peer's audio and video, as rendered by the
/// embedding UI.
pub trait PlaybackClocks: Send + Sync {
    /// Seconds of audio played so far.
    fn audio_time(&self) -> Option<f64>;
    /// Seconds of video played so far.
    fn video_time(&self) -> Option<f64>;
    fn set_video_rate(&self, rate: f64);
}

#[derive(Debug, Clone)]
pub struct SyncTiming {
    pub interval: Duration,
    /// Both clocks must advance this much between checks.
    pub min_advance: f64,
    /// Drift tolerated without correction, in seconds.
    pub tolerance: f64,
    /// Rate change per check.
    pub step: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    /// Drift beyond this asks the sender to resync.
    pub resync_threshold: f64,
}

impl Default for SyncTiming {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            min_advance: 0.5,
            tolerance: 0.150,
            // 50 ms of correction over a 5 s check interval.
            step: 0.01,
            min_rate: 0.5,
            max_rate: 2.0,
            resync_threshold: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncState {
    pub last_audio: Option<f64>,
    pub last_video: Option<f64>,
    pub last_drift: Option<f64>,
    pub last_correction: Option<Instant>,
    pub rate: f64,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            last_audio: None,
            last_video: None,
            last_drift: None,
            last_correction: None,
            rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncOutcome {
    /// Not enough playback since the previous check.
    Skipped,
    InBand { drift: f64, rate: f64 },
    Corrected { drift: f64, rate: f64 },
    /// Too far apart to correct by rate alone.
    ResyncNeeded { drift: f64, rate: f64 },
}

#[derive(Debug, Clone, Default)]
pub struct AvSyncCorrector {
    timing: SyncTiming,
}

impl AvSyncCorrector {
    pub fn new(timing: SyncTiming) -> Self {
        Self { timing }
    }

    pub fn interval(&self) -> Duration {
        self.timing.interval
    }

    /// One check; `audio` and `video` are the current playback positions.
    /// Drift is `video - audio`, positive when video runs ahead.
    pub fn check(&self, state: &mut SyncState, audio: f64, video: f64, now: Instant) -> SyncOutcome {
        let advanced = match (state.last_audio, state.last_video) {
            (Some(last_audio), Some(last_video)) => {
                audio - last_audio >= self.timing.min_advance
                    && video - last_video >= self.timing.min_advance
            }
            _ => true,
        };
        if !advanced {
            return SyncOutcome::Skipped;
        }
        state.last_audio = Some(audio);
        state.last_video = Some(video);

        let drift = video - audio;
        state.last_drift = Some(drift);

        if drift.abs() <= self.timing.tolerance {
            state.rate = relax(state.rate, self.timing.step);
            return SyncOutcome::InBand {
                drift,
                rate: state.rate,
            };
        }

        let adjusted = if drift > 0.0 {
            state.rate - self.timing.step
        } else {
            state.rate + self.timing.step
        };
        state.rate = round_rate(adjusted.clamp(self.timing.min_rate, self.timing.max_rate));
        state.last_correction = Some(now);
        if drift.abs() > self.timing.resync_threshold {
            SyncOutcome::ResyncNeeded {
                drift,
                rate: state.rate,
            }
        } else {
            SyncOutcome::Corrected {
                drift,
                rate: state.rate,
            }
        }
    }
}

fn relax(rate: f64, step: f64) -> f64 {
    let relaxed = if (rate - 1.0).abs() <= step {
        1.0
    } else if rate > 1.0 {
        rate - step
    } else {
        rate + step
    };
    round_rate(relaxed)
}

fn round_rate(rate: f64) -> f64 {
    (rate * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_lead_is_corrected_towards_band() {
        let corrector = AvSyncCorrector::default();
        let mut state = SyncState::default();
        let now = Instant::now();

        let mut audio = 10.0;
        let mut video = 10.3;
        let mut drifts = Vec::new();
        for _ in 0..6 {
            let outcome = corrector.check(&mut state, audio, video, now);
            drifts.push(state.last_drift.unwrap());
            assert!(!matches!(outcome, SyncOutcome::Skipped));
            assert!((0.5..=2.0).contains(&state.rate));
            audio += 5.0;
            video += 5.0 * state.rate;
        }
        assert!((drifts[0] - 0.3).abs() < 1e-9);
        assert!(drifts[1] < drifts[0]);
        assert!(*drifts.last().unwrap() <= 0.150 + 1e-9);
        assert!(state.rate <= 1.0);
    }

    #[test]
    fn stalled_clocks_are_skipped() {
        let corrector = AvSyncCorrector::default();
        let mut state = SyncState::default();
        let now = Instant::now();
        corrector.check(&mut state, 1.0, 1.0, now);
        assert_eq!(corrector.check(&mut state, 1.2, 1.8, now), SyncOutcome::Skipped);
    }

    #[test]
    fn large_drift_requests_resync_and_rate_is_bounded() {
        let corrector = AvSyncCorrector::default();
        let mut state = SyncState {
            rate: 0.5,
            ..SyncState::default()
        };
        let outcome = corrector.check(&mut state, 0.0, 2.0, Instant::now());
        assert_eq!(
            outcome,
            SyncOutcome::ResyncNeeded {
                drift: 2.0,
                rate: 0.5
            }
        );
    }

    #[test]
    fn rate_relaxes_inside_band() {
        let corrector = AvSyncCorrector::default();
        let mut state = SyncState {
            rate: 0.97,
            ..SyncState::default()
        };
        corrector.check(&mut state, 0.0, 0.05, Instant::now());
        assert_eq!(state.rate, 0.98);
    }
}
