// =============================================================================
// POSITION TRACKER
// =============================================================================
//
// The player reports its position in status lines and in answers to
// position queries. Neither carries an id, so after a seek or a load the first
// readings may still describe the old playback. The tracker keeps the last
// trusted reading as an anchor, extrapolates from it with the playback speed
// and filters readings that arrive inside the distrust window.
//
// =============================================================================

use std::cell::Cell;
use std::time::{Duration, Instant};

use crate::core::{ControllerConfig, SeekError};
use crate::slave::command::SeekMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekDirection {
    Forward,
    Backward,
}

/// Raw readings taken from one line.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionCandidate {
    /// Every time marker on the line (audio clock, video clock, ...)
    pub markers: Vec<f64>,
    /// `A-V:` difference from a status line
    pub av_desync: Option<f64>,
    /// An answer to a position query we actually sent
    pub explicit: bool,
}

impl PositionCandidate {
    pub fn status(markers: Vec<f64>, av_desync: Option<f64>) -> Self {
        Self {
            markers,
            av_desync,
            explicit: false,
        }
    }

    pub fn answer(value: f64, explicit: bool) -> Self {
        Self {
            markers: vec![value],
            av_desync: None,
            explicit,
        }
    }

    pub fn value(&self) -> f64 {
        assert!(!self.markers.is_empty(), "position candidate without markers");
        self.markers.iter().sum::<f64>() / self.markers.len() as f64
    }

    fn min_marker(&self) -> f64 {
        self.markers.iter().copied().fold(f64::INFINITY, f64::min)
    }

    fn max_marker(&self) -> f64 {
        self.markers.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSample {
    pub value: f64,
    pub read_at: Option<Instant>,
    pub trust_until: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// Presumed stale, still describing playback from before a seek or load
    Discarded,
    Accepted {
        value: f64,
        /// Far enough from what observers already know to be worth telling
        notify: bool,
        /// Absolute target of a corrective seek for A-V desync
        correction: Option<f64>,
    },
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub distrust_window: Duration,
    pub closeness_tolerance: f64,
    pub min_notify_delta: f64,
    pub overflow_tolerance: f64,
    pub av_desync_threshold: f64,
}

impl TrackerSettings {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            distrust_window: config.distrust_window(),
            closeness_tolerance: config.closeness_tolerance,
            min_notify_delta: config.min_notify_delta,
            overflow_tolerance: config.length_overflow_tolerance,
            av_desync_threshold: config.av_desync_threshold,
        }
    }
}

#[derive(Debug)]
pub struct PositionTracker {
    settings: TrackerSettings,
    position: Option<f64>,
    read_at: Option<Instant>,
    speed: f64,
    distrust_until: Option<Instant>,
    seek_direction: Option<SeekDirection>,
    last_notified: Option<f64>,
    length: Option<f64>,
    overflow_reported: Cell<bool>,
}

impl PositionTracker {
    pub fn new(settings: TrackerSettings) -> Self {
        Self {
            settings,
            position: None,
            read_at: None,
            speed: 1.0,
            distrust_until: None,
            seek_direction: None,
            last_notified: None,
            length: None,
            overflow_reported: Cell::new(false),
        }
    }

    pub fn reset(&mut self) {
        self.position = None;
        self.read_at = None;
        self.speed = 1.0;
        self.distrust_until = None;
        self.seek_direction = None;
        self.last_notified = None;
        self.length = None;
        self.overflow_reported.set(false);
    }

    pub fn set_length(&mut self, length: Option<f64>) {
        self.length = length;
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn last_position(&self) -> Option<f64> {
        self.position
    }

    pub fn anchor(&self) -> Option<Instant> {
        self.read_at
    }

    pub fn seek_direction(&self) -> Option<SeekDirection> {
        self.seek_direction
    }

    pub fn sample(&self) -> Option<PositionSample> {
        self.position.map(|value| PositionSample {
            value,
            read_at: self.read_at,
            trust_until: self.distrust_until,
        })
    }

    pub fn in_distrust_window(&self, now: Instant) -> bool {
        self.distrust_until.is_some_and(|until| now < until)
    }

    /// Opens the grace period after a fresh load.
    pub fn distrust_from(&mut self, now: Instant) {
        self.distrust_until = Some(now + self.settings.distrust_window);
    }

    /// A new source starts at `start`; anything earlier is left over from the
    /// previous one.
    pub fn note_load(&mut self, start: f64, now: Instant) {
        self.reset();
        self.position = Some(start.max(0.0));
        self.seek_direction = Some(SeekDirection::Forward);
        self.distrust_from(now);
    }

    /// Forgets the read time so extrapolation restarts from the next reading.
    /// When leaving playback the extrapolated value is kept as the position.
    pub fn clear_anchor(&mut self, now: Instant, was_playing: bool) {
        if was_playing {
            self.position = self.expected_position(now, true);
        }
        self.read_at = None;
    }

    /// Where playback should be at `now`.
    pub fn expected_position(&self, now: Instant, playing: bool) -> Option<f64> {
        let position = self.position?;
        let value = match (playing, self.read_at) {
            (true, Some(read_at)) => {
                position + self.speed * now.saturating_duration_since(read_at).as_secs_f64()
            }
            _ => position,
        };
        Some(self.clamp_to_length(value))
    }

    fn clamp_to_length(&self, value: f64) -> f64 {
        let Some(length) = self.length else {
            return value;
        };
        let limit = length + self.settings.overflow_tolerance;
        if value > limit {
            if !self.overflow_reported.replace(true) {
                log::error!(
                    "Expected position {:.2}s is beyond media length {:.2}s; tracker is out of sync",
                    value,
                    length
                );
            }
            debug_assert!(
                value <= limit,
                "expected position {} is past media length {} plus tolerance",
                value,
                length
            );
            return limit;
        }
        value
    }

    /// Decides whether a reading can be trusted and, if so, makes it the new
    /// anchor.
    pub fn reconcile(&mut self, candidate: &PositionCandidate, read_at: Instant, playing: bool) -> Reconciled {
        let value = candidate.value();
        assert!(
            value.is_finite() && value >= 0.0,
            "invalid position reading {}",
            value
        );

        let expected = self.expected_position(read_at, playing);

        if self.in_distrust_window(read_at) && !candidate.explicit {
            let tolerance = self.settings.closeness_tolerance;
            let trusted = match (self.seek_direction, self.position) {
                (Some(SeekDirection::Forward), Some(last)) if value >= last => true,
                (Some(SeekDirection::Backward), Some(last)) if value <= last => true,
                _ => expected.is_some_and(|e| (value - e).abs() <= tolerance),
            };
            if !trusted {
                log::debug!(
                    "Discarding position {:.2}s inside distrust window (expected {:?})",
                    value,
                    expected
                );
                return Reconciled::Discarded;
            }
        }

        let delta = self.settings.min_notify_delta;
        let differs_from_expected = expected.map_or(true, |e| (value - e).abs() > delta);
        let differs_from_notified = self.last_notified.map_or(true, |n| (value - n).abs() > delta);
        let notify = differs_from_expected && differs_from_notified;

        self.position = Some(value);
        self.read_at = Some(read_at);
        self.overflow_reported.set(false);
        if notify {
            self.last_notified = Some(value);
        }

        Reconciled::Accepted {
            value,
            notify,
            correction: self.desync_correction(candidate),
        }
    }

    fn desync_correction(&self, candidate: &PositionCandidate) -> Option<f64> {
        let threshold = self.settings.av_desync_threshold;
        if candidate.explicit || threshold < 0.0 {
            return None;
        }
        let desync = candidate.av_desync?;
        if desync.abs() <= threshold * self.speed {
            return None;
        }
        let target = if self.speed == 1.0 {
            candidate.min_marker()
        } else {
            candidate.max_marker()
        };
        log::info!(
            "A-V desync {:.3}s exceeds {:.3}s, correcting to {:.2}s",
            desync,
            threshold * self.speed,
            target
        );
        Some(target)
    }

    /// Changes the playback speed without making the extrapolation jump.
    pub fn set_speed(&mut self, speed: f64, now: Instant, playing: bool) {
        if playing && self.read_at.is_some() {
            self.position = self.expected_position(now, true);
            self.read_at = Some(now);
        }
        self.speed = speed;
    }

    /// Anchors at the target of a seek that has just been sent.
    pub fn note_seek(&mut self, target: f64, now: Instant, playing: bool) {
        let previous = self.expected_position(now, playing).unwrap_or(0.0);
        self.seek_direction = Some(if target >= previous {
            SeekDirection::Forward
        } else {
            SeekDirection::Backward
        });
        self.position = Some(target);
        self.read_at = if playing { Some(now) } else { None };
        self.distrust_until = Some(now + self.settings.distrust_window);
        self.overflow_reported.set(false);
    }

    pub fn compute_seek_target(
        &self,
        offset: f64,
        mode: SeekMode,
        now: Instant,
        playing: bool,
    ) -> Result<f64, SeekError> {
        let raw = match mode {
            SeekMode::Relative => self.expected_position(now, playing).unwrap_or(0.0) + offset,
            SeekMode::Percentage => {
                let length = self.length.ok_or(SeekError::LengthUnknown)?;
                length * offset / 100.0
            }
            SeekMode::Absolute => offset,
        };
        let target = raw.round().max(0.0);
        if let Some(length) = self.length {
            if target > length {
                return Err(SeekError::PastEnd { target, length });
            }
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn settings() -> TrackerSettings {
        TrackerSettings {
            distrust_window: Duration::from_secs(2),
            closeness_tolerance: 1.0,
            min_notify_delta: 0.5,
            overflow_tolerance: 5.0,
            av_desync_threshold: 2.0,
        }
    }

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn test_extrapolation_uses_speed() {
        let t0 = Instant::now();
        let mut tracker = PositionTracker::new(settings());
        tracker.reconcile(&PositionCandidate::answer(10.0, true), t0, true);

        let expected = tracker.expected_position(t0 + secs(2.0), true).unwrap();
        assert!((expected - 12.0).abs() < 1e-9);

        tracker.set_speed(2.0, t0 + secs(2.0), true);
        let expected = tracker.expected_position(t0 + secs(3.0), true).unwrap();
        assert!((expected - 14.0).abs() < 1e-9);

        // Not playing: raw value
        assert_eq!(tracker.expected_position(t0 + secs(30.0), false), Some(12.0));
    }

    #[test]
    fn test_expected_position_may_run_past_length_within_tolerance() {
        let t0 = Instant::now();
        let mut tracker = PositionTracker::new(settings());
        tracker.set_length(Some(100.0));
        tracker.reconcile(&PositionCandidate::answer(99.0, true), t0, true);

        let expected = tracker.expected_position(t0 + secs(4.0), true).unwrap();
        assert!((expected - 103.0).abs() < 1e-9);
    }

    #[test]
    #[should_panic(expected = "past media length")]
    fn test_expected_position_far_past_length_is_fatal() {
        let t0 = Instant::now();
        let mut tracker = PositionTracker::new(settings());
        tracker.set_length(Some(100.0));
        tracker.reconcile(&PositionCandidate::answer(99.0, true), t0, true);

        tracker.expected_position(t0 + secs(60.0), true);
    }

    #[test]
    fn test_markers_are_averaged() {
        let t0 = Instant::now();
        let mut tracker = PositionTracker::new(settings());
        let result = tracker.reconcile(&PositionCandidate::status(vec![10.0, 11.0], Some(-1.0)), t0, true);
        match result {
            Reconciled::Accepted { value, correction, .. } => {
                assert_eq!(value, 10.5);
                assert_eq!(correction, None);
            }
            Reconciled::Discarded => panic!("reading should be accepted"),
        }
    }

    #[test]
    fn test_stale_reading_discarded_after_forward_seek() {
        let t0 = Instant::now();
        let mut tracker = PositionTracker::new(settings());
        tracker.reconcile(&PositionCandidate::answer(10.0, true), t0, true);
        tracker.note_seek(60.0, t0 + secs(0.1), true);

        assert_eq!(tracker.seek_direction(), Some(SeekDirection::Forward));
        // Still the pre-seek clock
        let stale = PositionCandidate::status(vec![10.3, 10.3], None);
        assert_eq!(tracker.reconcile(&stale, t0 + secs(0.3), true), Reconciled::Discarded);

        let fresh = PositionCandidate::status(vec![60.2, 60.2], None);
        assert!(matches!(tracker.reconcile(&fresh, t0 + secs(0.5), true), Reconciled::Accepted { .. }));
    }

    #[test]
    fn test_backward_seek_accepts_lower_readings() {
        let t0 = Instant::now();
        let mut tracker = PositionTracker::new(settings());
        tracker.reconcile(&PositionCandidate::answer(80.0, true), t0, true);
        tracker.note_seek(20.0, t0, true);

        assert_eq!(tracker.seek_direction(), Some(SeekDirection::Backward));
        let stale = PositionCandidate::status(vec![80.4], None);
        assert_eq!(tracker.reconcile(&stale, t0 + secs(0.2), true), Reconciled::Discarded);
        let landed = PositionCandidate::status(vec![19.0], None);
        assert!(matches!(tracker.reconcile(&landed, t0 + secs(0.4), true), Reconciled::Accepted { .. }));
    }

    #[test]
    fn test_explicit_answer_bypasses_distrust_window() {
        let t0 = Instant::now();
        let mut tracker = PositionTracker::new(settings());
        tracker.reconcile(&PositionCandidate::answer(50.0, true), t0, true);
        tracker.note_seek(100.0, t0, true);

        let answer = PositionCandidate::answer(42.0, true);
        assert!(matches!(tracker.reconcile(&answer, t0 + secs(0.2), true), Reconciled::Accepted { .. }));
        assert_eq!(tracker.last_position(), Some(42.0));
    }

    #[test]
    fn test_notification_needs_minimum_delta() {
        let t0 = Instant::now();
        let mut tracker = PositionTracker::new(settings());

        let first = tracker.reconcile(&PositionCandidate::answer(10.0, true), t0, true);
        assert!(matches!(first, Reconciled::Accepted { notify: true, .. }));

        // Matches the extrapolation: jitter, no notification
        let jitter = tracker.reconcile(&PositionCandidate::answer(11.1, true), t0 + secs(1.0), true);
        assert!(matches!(jitter, Reconciled::Accepted { notify: false, .. }));

        // A jump away from both
        let jump = tracker.reconcile(&PositionCandidate::answer(30.0, true), t0 + secs(2.0), true);
        assert!(matches!(jump, Reconciled::Accepted { notify: true, .. }));
    }

    #[test]
    fn test_desync_correction_threshold() {
        let t0 = Instant::now();
        let mut tracker = PositionTracker::new(settings());
        let line = PositionCandidate::status(vec![10.0, 10.0], Some(3.0));
        assert!(matches!(
            tracker.reconcile(&line, t0, true),
            Reconciled::Accepted { correction: Some(target), .. } if target == 10.0
        ));

        let mut disabled = PositionTracker::new(TrackerSettings {
            av_desync_threshold: -1.0,
            ..settings()
        });
        assert!(matches!(
            disabled.reconcile(&line, t0, true),
            Reconciled::Accepted { correction: None, .. }
        ));

        // Faster playback raises the threshold and corrects to the later clock
        let mut fast = PositionTracker::new(settings());
        fast.set_speed(2.0, t0, true);
        let small = PositionCandidate::status(vec![20.0, 23.0], Some(3.0));
        assert!(matches!(fast.reconcile(&small, t0, true), Reconciled::Accepted { correction: None, .. }));
        let large = PositionCandidate::status(vec![20.0, 25.0], Some(5.0));
        assert!(matches!(
            fast.reconcile(&large, t0 + secs(0.1), true),
            Reconciled::Accepted { correction: Some(target), .. } if target == 25.0
        ));
    }

    #[test]
    fn test_seek_target_modes() {
        let t0 = Instant::now();
        let mut tracker = PositionTracker::new(settings());
        tracker.set_length(Some(120.0));
        tracker.reconcile(&PositionCandidate::answer(30.0, true), t0, true);

        assert_eq!(tracker.compute_seek_target(50.0, SeekMode::Absolute, t0, true), Ok(50.0));
        assert_eq!(tracker.compute_seek_target(10.4, SeekMode::Relative, t0, true), Ok(40.0));
        assert_eq!(tracker.compute_seek_target(-100.0, SeekMode::Relative, t0, true), Ok(0.0));
        assert_eq!(tracker.compute_seek_target(25.0, SeekMode::Percentage, t0, true), Ok(30.0));
        assert_eq!(
            tracker.compute_seek_target(200.0, SeekMode::Absolute, t0, true),
            Err(SeekError::PastEnd { target: 200.0, length: 120.0 })
        );

        tracker.set_length(None);
        assert_eq!(
            tracker.compute_seek_target(25.0, SeekMode::Percentage, t0, true),
            Err(SeekError::LengthUnknown)
        );
    }

    #[test]
    fn test_clear_anchor_keeps_extrapolated_value() {
        let t0 = Instant::now();
        let mut tracker = PositionTracker::new(settings());
        tracker.reconcile(&PositionCandidate::answer(10.0, true), t0, true);

        tracker.clear_anchor(t0 + secs(4.0), true);
        assert!(tracker.anchor().is_none());
        assert_eq!(tracker.last_position(), Some(14.0));
    }

    #[test]
    fn test_load_filters_readings_before_start() {
        let t0 = Instant::now();
        let mut tracker = PositionTracker::new(settings());
        tracker.note_load(30.0, t0);

        assert!(tracker.in_distrust_window(t0 + secs(1.0)));
        let leftover = PositionCandidate::status(vec![12.0], None);
        assert_eq!(tracker.reconcile(&leftover, t0 + secs(0.5), false), Reconciled::Discarded);
        let started = PositionCandidate::status(vec![30.1], None);
        assert!(matches!(tracker.reconcile(&started, t0 + secs(0.6), false), Reconciled::Accepted { .. }));
    }

    #[test]
    #[should_panic(expected = "invalid position")]
    fn test_negative_reading_is_a_contract_violation() {
        let mut tracker = PositionTracker::new(settings());
        tracker.reconcile(&PositionCandidate::answer(-1.0, true), Instant::now(), true);
    }

    proptest! {
        #[test]
        fn extrapolation_never_moves_backward(
            start in 0.0f64..1000.0,
            steps in proptest::collection::vec((0u64..5000, 0.25f64..4.0, any::<bool>()), 1..50),
        ) {
            let t0 = Instant::now();
            let mut tracker = PositionTracker::new(settings());
            tracker.reconcile(&PositionCandidate::answer(start, true), t0, true);

            let mut now = t0;
            let mut last = tracker.expected_position(now, true).unwrap();
            for (advance_ms, speed, change_speed) in steps {
                now += Duration::from_millis(advance_ms);
                if change_speed {
                    tracker.set_speed(speed, now, true);
                }
                let expected = tracker.expected_position(now, true).unwrap();
                prop_assert!(expected + 1e-9 >= last);
                last = expected;
            }
        }

        #[test]
        fn distrust_window_follows_seek_direction(
            anchor in 0.0f64..500.0,
            seek_by in 5.0f64..500.0,
            ahead in 0.0f64..100.0,
            behind in 1.01f64..100.0,
            after_ms in 0u64..1900,
        ) {
            let t0 = Instant::now();
            let target = anchor + seek_by;

            let mut tracker = PositionTracker::new(settings());
            tracker.reconcile(&PositionCandidate::answer(anchor, true), t0, true);
            tracker.note_seek(target, t0, false);
            let read_at = t0 + Duration::from_millis(after_ms);

            let mut forward = PositionTracker::new(settings());
            forward.reconcile(&PositionCandidate::answer(anchor, true), t0, true);
            forward.note_seek(target, t0, false);
            let accepted = forward.reconcile(&PositionCandidate::status(vec![target + ahead], None), read_at, false);
            let forward_accepted = matches!(accepted, Reconciled::Accepted { .. });
            prop_assert!(forward_accepted);

            let below = (target - behind).max(0.0);
            prop_assume!(target - below > 1.0);
            let stale = tracker.reconcile(&PositionCandidate::status(vec![below], None), read_at, false);
            prop_assert_eq!(stale, Reconciled::Discarded);
        }
    }
}
