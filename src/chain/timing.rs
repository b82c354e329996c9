//! Adaptive polling cadence
//!
//! `BlockTimeTracker` self-tunes the polling interval from poll outcomes so no
//! per-chain block-time constant is needed. Percentages are applied as integer
//! per-mille steps so results are exact.

use crate::config::TrackerTuning;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

struct TrackerState {
    interval_ms: u64,
    consecutive_hits: u32,
}

/// Polling interval with hit/miss feedback
pub struct BlockTimeTracker {
    state: Mutex<TrackerState>,
    floor_ms: u64,
    tuning: TrackerTuning,
}

impl BlockTimeTracker {
    pub fn new(initial: Duration, floor: Duration, tuning: TrackerTuning) -> Self {
        let floor_ms = floor.as_millis() as u64;
        Self {
            state: Mutex::new(TrackerState {
                interval_ms: (initial.as_millis() as u64).max(floor_ms),
                consecutive_hits: 0,
            }),
            floor_ms,
            tuning,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current polling interval
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.lock().interval_ms)
    }

    pub fn consecutive_hits(&self) -> u32 {
        self.lock().consecutive_hits
    }

    /// Block was there on the first try
    pub fn hit(&self) -> Duration {
        let mut state = self.lock();
        state.consecutive_hits = state.consecutive_hits.saturating_add(1);
        let drop = if state.consecutive_hits >= self.tuning.streak_len {
            self.tuning.streak_drop_permille
        } else {
            self.tuning.hit_drop_permille
        };
        let next = scale(state.interval_ms, 1000u64.saturating_sub(drop));
        state.interval_ms = next.max(self.floor_ms);
        Duration::from_millis(state.interval_ms)
    }

    /// Block was there, but only after waiting
    pub fn hit_with_minor_delay(&self) -> Duration {
        let mut state = self.lock();
        state.consecutive_hits = 0;
        let next = scale(state.interval_ms, 1000 + self.tuning.minor_delay_raise_permille);
        state.interval_ms = next.max(self.floor_ms);
        Duration::from_millis(state.interval_ms)
    }

    /// Block fetched. Counts as a hit unless it follows a miss and the tuning
    /// asks for `slow_down_after_miss`.
    pub fn found(&self, after_miss: bool) -> Duration {
        if after_miss && self.tuning.slow_down_after_miss {
            self.hit_with_minor_delay()
        } else {
            self.hit()
        }
    }

    /// Block not there yet, or the poll failed
    pub fn miss(&self) -> Duration {
        let mut state = self.lock();
        state.consecutive_hits = 0;
        let next = scale(state.interval_ms, 1000 + self.tuning.miss_raise_permille);
        state.interval_ms = next.max(self.floor_ms);
        Duration::from_millis(state.interval_ms)
    }
}

fn scale(value_ms: u64, permille: u64) -> u64 {
    ((value_ms as u128 * permille as u128) / 1000) as u64
}

/// Per-call RPC timeout that follows the polling cadence
#[derive(Clone)]
pub struct RpcDeadline {
    tracker: Arc<BlockTimeTracker>,
    factor: u32,
    minimum: Duration,
}

impl RpcDeadline {
    pub fn new(tracker: Arc<BlockTimeTracker>, factor: u32, minimum: Duration) -> Self {
        Self {
            tracker,
            factor: factor.max(1),
            minimum,
        }
    }

    pub fn get(&self) -> Duration {
        (self.tracker.interval() * self.factor).max(self.minimum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(initial_ms: u64, floor_ms: u64) -> BlockTimeTracker {
        BlockTimeTracker::new(
            Duration::from_millis(initial_ms),
            Duration::from_millis(floor_ms),
            TrackerTuning::default(),
        )
    }

    #[test]
    fn test_feedback_sequence() {
        let t = tracker(10_000, 500);

        assert_eq!(t.hit(), Duration::from_millis(9_500));
        assert_eq!(t.hit(), Duration::from_millis(9_025));
        assert_eq!(t.hit(), Duration::from_millis(5_415));
        assert_eq!(t.consecutive_hits(), 3);

        assert_eq!(t.hit_with_minor_delay(), Duration::from_millis(5_550));
        assert_eq!(t.consecutive_hits(), 0);

        assert_eq!(t.miss(), Duration::from_millis(6_105));
        assert_eq!(t.consecutive_hits(), 0);
    }

    #[test]
    fn test_found_after_miss() {
        let t = tracker(10_000, 500);
        t.miss();
        assert_eq!(t.found(true), Duration::from_millis(10_450));

        let slow = BlockTimeTracker::new(
            Duration::from_millis(10_000),
            Duration::from_millis(500),
            TrackerTuning {
                slow_down_after_miss: true,
                ..TrackerTuning::default()
            },
        );
        slow.miss();
        assert_eq!(slow.found(true), Duration::from_millis(11_275));
        assert_eq!(slow.found(false), Duration::from_millis(10_711));
    }

    #[test]
    fn test_interval_never_below_floor() {
        let t = tracker(2_000, 500);
        for _ in 0..100 {
            t.hit();
            assert!(t.interval() >= Duration::from_millis(500));
        }
        assert_eq!(t.interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_initial_interval_clamped() {
        let t = tracker(100, 500);
        assert_eq!(t.interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_deadline_tracks_interval() {
        let t = Arc::new(tracker(4_000, 500));
        let deadline = RpcDeadline::new(t.clone(), 2, Duration::from_secs(1));
        assert_eq!(deadline.get(), Duration::from_secs(8));

        for _ in 0..50 {
            t.hit();
        }
        assert_eq!(deadline.get(), Duration::from_secs(1));
    }
}
