use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::core::{ControllerConfig, LatencyError, ReadIntervals};
use crate::slave::command::IoClock;
use crate::slave::state::ControllerState;

#[derive(Debug, Clone, PartialEq)]
pub enum WatchdogVerdict {
    Quiet,
    Warn(String),
    Escalate(LatencyError),
}

/// Periodic check that the player keeps answering.
#[derive(Debug)]
pub struct LatencyWatchdog {
    period: Duration,
    read_intervals: ReadIntervals,
    after_write: Duration,
    multiplier: f64,
    last_tick: Option<Instant>,
    max_latency: HashMap<&'static str, Duration>,
}

impl LatencyWatchdog {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            period: config.watchdog_period(),
            read_intervals: config.read_intervals.clone(),
            after_write: config.expected_read_after_write(),
            multiplier: config.escalation_multiplier,
            last_tick: None,
            max_latency: HashMap::new(),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Ticks run while the player should be talking or commands are waiting.
    pub fn is_active(state: &ControllerState, queue_len: usize) -> bool {
        state.is_active() || queue_len > 0
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.last_tick
            .map_or(true, |last| now.saturating_duration_since(last) >= self.period)
    }

    pub fn mark_tick(&mut self, now: Instant) {
        self.last_tick = Some(now);
    }

    pub fn max_latency(&self, state: &ControllerState) -> Option<Duration> {
        self.max_latency.get(state.name()).copied()
    }

    fn expected_read_interval(&self, state: &ControllerState) -> Option<Duration> {
        let ms = match state {
            ControllerState::Loading => self.read_intervals.loading_ms,
            ControllerState::Playing => self.read_intervals.playing_ms,
            ControllerState::Buffering => self.read_intervals.buffering_ms,
            ControllerState::Paused => self.read_intervals.paused_ms,
            _ => None,
        }?;
        Some(Duration::from_millis(ms))
    }

    fn record_latency(&mut self, state: &ControllerState, latency: Duration) {
        let max = self.max_latency.entry(state.name()).or_default();
        if latency > *max {
            *max = latency;
            log::debug!("New max read latency while {}: {:?}", state.name(), latency);
        }
    }

    pub fn check(&mut self, now: Instant, state: &ControllerState, io: &IoClock) -> WatchdogVerdict {
        let (Some(last_read), Some(last_write)) = (io.last_read(), io.last_write()) else {
            return WatchdogVerdict::Quiet;
        };

        let mut verdict = WatchdogVerdict::Quiet;

        if let Some(expected) = self.expected_read_interval(state) {
            let elapsed = now.saturating_duration_since(last_read);
            self.record_latency(state, elapsed);
            if elapsed.as_secs_f64() > expected.as_secs_f64() * self.multiplier {
                return WatchdogVerdict::Escalate(LatencyError::ReadSilence {
                    state: state.name(),
                    elapsed,
                    expected,
                });
            }
            if elapsed > expected {
                verdict = WatchdogVerdict::Warn(format!(
                    "no output for {:?} while {} (expected every {:?})",
                    elapsed,
                    state.name(),
                    expected
                ));
            }
        }

        if last_write > last_read {
            let elapsed = now.saturating_duration_since(last_write);
            let expected = self.after_write;
            if elapsed.as_secs_f64() > expected.as_secs_f64() * self.multiplier {
                return WatchdogVerdict::Escalate(LatencyError::NoReadAfterWrite { elapsed, expected });
            }
            if elapsed > expected && verdict == WatchdogVerdict::Quiet {
                verdict = WatchdogVerdict::Warn(format!(
                    "no answer {:?} after last write (expected within {:?})",
                    elapsed, expected
                ));
            }
        }

        verdict
    }
}
