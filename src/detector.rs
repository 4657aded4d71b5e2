/// Detection policy
///
/// Turns per-frame score maps into wake events: best label, confidence
/// threshold, and a cooldown window between accepted detections. Runs once
/// per scored frame, independent of the capture block size.

use crate::scorer::ScoreMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, trace};

/// Default confidence threshold
pub const DEFAULT_THRESHOLD: f32 = 0.73;

/// Default minimum gap between accepted detections
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(900);

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Invalid threshold: {0}")]
    InvalidThreshold(f32),
}

/// Wake-word detection result
#[derive(Debug, Clone, PartialEq)]
pub struct WakeEvent {
    pub label: String,
    pub score: f32,
    /// Wall-clock time of the detection, for the wire message only.
    ///
    /// Cooldown is measured on the monotonic `Instant` passed to
    /// [`DetectionPolicy::evaluate`], so clock steps never shift it.
    pub timestamp: SystemTime,
}

impl WakeEvent {
    pub fn new(label: impl Into<String>, score: f32) -> Self {
        Self {
            label: label.into(),
            score,
            timestamp: SystemTime::now(),
        }
    }

    /// Seconds since the Unix epoch, with sub-second precision
    pub fn unix_secs(&self) -> f64 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Cooldown bookkeeping, owned by one policy instance
#[derive(Debug, Clone, Default)]
pub struct DetectionState {
    last_detection: Option<Instant>,
}

impl DetectionState {
    pub fn last_detection(&self) -> Option<Instant> {
        self.last_detection
    }

    fn cooled_down(&self, now: Instant, cooldown: Duration) -> bool {
        match self.last_detection {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= cooldown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectionPolicy {
    threshold: f32,
    cooldown: Duration,
    /// Scan order for tie-breaks
    label_order: Vec<String>,
    state: DetectionState,
    detections: u64,
}

impl DetectionPolicy {
    pub fn new(threshold: f32, cooldown: Duration, label_order: Vec<String>) -> Result<Self, DetectorError> {
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(DetectorError::InvalidThreshold(threshold));
        }

        debug!(
            "Detection policy: threshold={:.2} cooldown={:?} labels={:?}",
            threshold, cooldown, label_order
        );

        Ok(Self {
            threshold,
            cooldown,
            label_order,
            state: DetectionState::default(),
            detections: 0,
        })
    }

    /// Decide whether this frame's scores are a new detection.
    pub fn evaluate(&mut self, scores: &ScoreMap, now: Instant) -> Option<WakeEvent> {
        let Some((best_label, best_score)) = select_best(&self.label_order, scores) else {
            trace!("No labels scored");
            return None;
        };
        trace!("Best label {} score {:.3}", best_label, best_score);

        if best_score < self.threshold || !self.state.cooled_down(now, self.cooldown) {
            return None;
        }

        self.state.last_detection = Some(now);
        self.detections += 1;
        info!("WAKE {} {:.3}", best_label, best_score);

        Some(WakeEvent::new(best_label, best_score))
    }

    pub fn state(&self) -> &DetectionState {
        &self.state
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn detections(&self) -> u64 {
        self.detections
    }
}

/// Scan `order` first, then unlisted labels by name; strict `>` keeps the
/// first label that reaches the maximum.
fn select_best<'a>(order: &'a [String], scores: &'a ScoreMap) -> Option<(&'a str, f32)> {
    let mut extra: Vec<&String> = scores.keys().filter(|k| !order.contains(*k)).collect();
    extra.sort();

    let mut best: Option<(&str, f32)> = None;
    for label in order.iter().chain(extra) {
        let Some(&score) = scores.get(label) else {
            continue;
        };
        match best {
            Some((_, current)) if score <= current => {}
            _ => best = Some((label.as_str(), score)),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(pairs: &[(&str, f32)]) -> ScoreMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn policy(labels: &[&str]) -> DetectionPolicy {
        DetectionPolicy::new(
            DEFAULT_THRESHOLD,
            DEFAULT_COOLDOWN,
            labels.iter().map(|s| s.to_string()).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_fires_above_threshold() {
        let mut policy = policy(&["hey_x"]);
        let event = policy.evaluate(&scores(&[("hey_x", 0.95)]), Instant::now()).unwrap();

        assert_eq!(event.label, "hey_x");
        assert_eq!(event.score, 0.95);
        assert_eq!(policy.detections(), 1);
        assert!(event.unix_secs() > 0.0);
    }

    #[test]
    fn test_wall_clock_stamp_independent_of_cooldown_clock() {
        let mut policy = policy(&["hey_x"]);
        // Monotonic time far ahead of the wall clock
        let now = Instant::now() + Duration::from_secs(3600);
        let before = SystemTime::now();
        let event = policy.evaluate(&scores(&[("hey_x", 0.95)]), now).unwrap();

        assert!(event.timestamp >= before);
        assert!(event.timestamp <= SystemTime::now());
        assert_eq!(policy.state().last_detection(), Some(now));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mut policy = policy(&["a"]);
        assert!(policy.evaluate(&scores(&[("a", DEFAULT_THRESHOLD)]), Instant::now()).is_some());
    }

    #[test]
    fn test_never_fires_below_threshold() {
        let mut policy = policy(&["a", "b"]);
        let low = scores(&[("a", 0.5), ("b", 0.72)]);
        let start = Instant::now();

        for i in 0..200 {
            let now = start + Duration::from_millis(32 * i);
            assert!(policy.evaluate(&low, now).is_none());
        }
        assert!(policy.state().last_detection().is_none());
    }

    #[test]
    fn test_empty_scores() {
        let mut policy = policy(&[]);
        assert!(policy.evaluate(&ScoreMap::new(), Instant::now()).is_none());
    }

    #[test]
    fn test_cooldown_window() {
        let mut policy = policy(&["hey_x"]);
        let hit = scores(&[("hey_x", 0.9)]);
        let t0 = Instant::now();

        assert!(policy.evaluate(&hit, t0).is_some());
        assert!(policy.evaluate(&hit, t0 + Duration::from_millis(500)).is_none());
        assert!(policy.evaluate(&hit, t0 + Duration::from_millis(899)).is_none());
        assert!(policy.evaluate(&hit, t0 + Duration::from_millis(900)).is_some());
        assert_eq!(policy.detections(), 2);
    }

    #[test]
    fn test_blocked_frame_does_not_extend_cooldown() {
        let mut policy = policy(&["hey_x"]);
        let hit = scores(&[("hey_x", 0.9)]);
        let t0 = Instant::now();

        policy.evaluate(&hit, t0);
        policy.evaluate(&hit, t0 + Duration::from_millis(600));

        assert_eq!(policy.state().last_detection(), Some(t0));
        assert!(policy.evaluate(&hit, t0 + Duration::from_millis(950)).is_some());
    }

    #[test]
    fn test_tie_break_follows_label_order() {
        let tied = scores(&[("a", 0.9), ("b", 0.9)]);

        for _ in 0..20 {
            let mut ab = policy(&["a", "b"]);
            assert_eq!(ab.evaluate(&tied, Instant::now()).unwrap().label, "a");
        }

        let mut ba = policy(&["b", "a"]);
        assert_eq!(ba.evaluate(&tied, Instant::now()).unwrap().label, "b");
    }

    #[test]
    fn test_unlisted_labels_scanned_by_name() {
        let mut policy = policy(&[]);
        let tied = scores(&[("zulu", 0.8), ("alpha", 0.8), ("mike", 0.8)]);
        assert_eq!(policy.evaluate(&tied, Instant::now()).unwrap().label, "alpha");
    }

    #[test]
    fn test_best_label_selected() {
        let mut policy = policy(&["a", "b", "c"]);
        let event = policy
            .evaluate(&scores(&[("a", 0.2), ("b", 0.81), ("c", 0.8)]), Instant::now())
            .unwrap();
        assert_eq!(event.label, "b");
    }

    #[test]
    fn test_independent_policies() {
        let mut first = policy(&["a"]);
        let mut second = policy(&["a"]);
        let hit = scores(&[("a", 0.99)]);
        let now = Instant::now();

        assert!(first.evaluate(&hit, now).is_some());
        assert!(second.evaluate(&hit, now).is_some());
        assert!(first.evaluate(&hit, now).is_none());
    }

    #[test]
    fn test_invalid_threshold() {
        assert!(DetectionPolicy::new(f32::NAN, DEFAULT_COOLDOWN, vec![]).is_err());
        assert!(DetectionPolicy::new(-0.1, DEFAULT_COOLDOWN, vec![]).is_err());
    }
}
