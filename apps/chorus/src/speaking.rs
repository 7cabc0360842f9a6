//! Speaking detection with hysteresis.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct SpeakingTiming {
    pub local_interval: Duration,
    pub remote_interval: Duration,
    /// Level must stay above the threshold this long to start speaking.
    pub rise: Duration,
    /// Level must stay below the threshold this long to stop speaking.
    pub fall: Duration,
    pub threshold: f32,
}

impl Default for SpeakingTiming {
    fn default() -> Self {
        Self {
            local_interval: Duration::from_millis(100),
            remote_interval: Duration::from_millis(120),
            rise: Duration::from_millis(150),
            fall: Duration::from_millis(300),
            threshold: 0.04,
        }
    }
}

/// Root mean square of a sample window, `0.0` for an empty window.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let energy: f32 = samples.iter().map(|sample| sample * sample).sum();
    (energy / samples.len() as f32).sqrt()
}

#[derive(Debug, Clone)]
pub struct SpeakingDetector {
    threshold: f32,
    rise: Duration,
    fall: Duration,
    speaking: bool,
    pending_since: Option<Instant>,
}

impl SpeakingDetector {
    pub fn new(timing: &SpeakingTiming) -> Self {
        Self {
            threshold: timing.threshold,
            rise: timing.rise,
            fall: timing.fall,
            speaking: false,
            pending_since: None,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Feeds one level sample; returns the new state on an edge.
    pub fn observe(&mut self, level: f32, now: Instant) -> Option<bool> {
        let loud = level >= self.threshold;
        if loud == self.speaking {
            self.pending_since = None;
            return None;
        }
        let since = *self.pending_since.get_or_insert(now);
        let hold = if loud { self.rise } else { self.fall };
        if now.duration_since(since) >= hold {
            self.speaking = loud;
            self.pending_since = None;
            Some(loud)
        } else {
            None
        }
    }

    /// Drops to silent immediately, e.g. on mute.
    pub fn silence(&mut self) -> Option<bool> {
        self.pending_since = None;
        if self.speaking {
            self.speaking = false;
            Some(false)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(detector: &mut SpeakingDetector, start: Instant, levels: &[(u64, f32)]) -> Vec<(u64, bool)> {
        levels
            .iter()
            .filter_map(|(ms, level)| {
                detector
                    .observe(*level, start + Duration::from_millis(*ms))
                    .map(|edge| (*ms, edge))
            })
            .collect()
    }

    #[test]
    fn short_blip_does_not_toggle() {
        let mut detector = SpeakingDetector::new(&SpeakingTiming::default());
        let start = Instant::now();
        let edges = feed(
            &mut detector,
            start,
            &[(0, 0.3), (100, 0.3), (200, 0.0), (300, 0.0)],
        );
        assert!(edges.is_empty());
        assert!(!detector.is_speaking());
    }

    #[test]
    fn sustained_speech_toggles_after_hysteresis() {
        let mut detector = SpeakingDetector::new(&SpeakingTiming::default());
        let start = Instant::now();
        let edges = feed(
            &mut detector,
            start,
            &[
                (0, 0.3),
                (100, 0.3),
                (200, 0.3),
                (300, 0.0),
                (400, 0.0),
                (500, 0.3),
                (600, 0.0),
                (700, 0.0),
                (800, 0.0),
                (900, 0.0),
            ],
        );
        assert_eq!(edges, vec![(200, true), (900, false)]);
    }

    #[test]
    fn rms_of_sine_window() {
        let window: Vec<f32> = (0..480)
            .map(|i| 0.5 * (std::f32::consts::TAU * i as f32 / 48.0).sin())
            .collect();
        let level = rms(&window);
        assert!((level - 0.5 / 2f32.sqrt()).abs() < 1e-3);
        assert_eq!(rms(&[]), 0.0);
    }
}
