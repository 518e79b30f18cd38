//! Receive-rate tracker that decides when a TCP transport should prefetch.
//!
//! Receive operations are counted per window. When a window rolls over its
//! count is mapped to a candidate level through the configured thresholds.
//! The active level only moves when the candidates of two consecutive windows
//! both lie on the same side of it, so one unusual window changes nothing.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Configuration of the receive-rate tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IopsConfig {
    /// Length of one counting window in milliseconds.
    pub window_ms: u64,
    /// Ascending receive counts per window; reaching the n-th one means level n.
    pub thresholds: Vec<u64>,
    /// Size of the prefetch buffer used when the level is above zero.
    pub prefetch_size: usize,
}

impl Default for IopsConfig {
    fn default() -> Self {
        Self {
            window_ms: 6000,
            thresholds: vec![6000, 60000],
            prefetch_size: 8 * 1024,
        }
    }
}

/// Tracks receive operations and reports level changes.
#[derive(Debug, Clone)]
pub struct IopsTracker {
    window: Duration,
    thresholds: Vec<u64>,
    window_start: Instant,
    count: u64,
    level: usize,
    previous_candidate: usize,
}

impl IopsTracker {
    /// Creates a tracker whose first window starts now.
    pub fn new(config: &IopsConfig) -> Self {
        Self::starting_at(config, Instant::now())
    }

    /// Creates a tracker whose first window starts at `start`.
    pub fn starting_at(config: &IopsConfig, start: Instant) -> Self {
        Self {
            window: Duration::from_millis(config.window_ms),
            thresholds: config.thresholds.clone(),
            window_start: start,
            count: 0,
            level: 0,
            previous_candidate: 0,
        }
    }

    /// Active level; zero means no extra buffering.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Records one receive operation. Returns true when the active level changed.
    pub fn track_one(&mut self) -> bool {
        self.track_at(Instant::now())
    }

    /// Records one receive operation observed at `now`.
    pub fn track_at(&mut self, now: Instant) -> bool {
        self.count += 1;
        if now.saturating_duration_since(self.window_start) < self.window {
            return false;
        }

        let candidate = self.level_for(self.count);
        self.count = 0;
        self.window_start = now;

        let previous = std::mem::replace(&mut self.previous_candidate, candidate);
        let active = self.level;
        if previous > active && candidate > active {
            self.level = previous.min(candidate);
        } else if previous < active && candidate < active {
            self.level = previous.max(candidate);
        }

        if self.level != active {
            tracing::debug!(from = active, to = self.level, "receive buffering level changed");
            true
        } else {
            false
        }
    }

    fn level_for(&self, count: u64) -> usize {
        self.thresholds.iter().filter(|t| count >= **t).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn small_config() -> IopsConfig {
        IopsConfig {
            window_ms: 1000,
            thresholds: vec![10, 100],
            prefetch_size: 8 * 1024,
        }
    }

    /// Feeds `ops` receive operations spread over one window and returns
    /// whether the rollover changed the level.
    fn run_window(tracker: &mut IopsTracker, start: &mut Instant, ops: u64) -> bool {
        let window = Duration::from_millis(1000);
        for i in 1..ops {
            let at = *start + window.mul_f64(i as f64 / ops as f64) / 2;
            assert!(!tracker.track_at(at));
        }
        *start += window;
        tracker.track_at(*start)
    }

    #[test]
    fn test_two_busy_windows_enable_buffering() {
        let mut start = Instant::now();
        let mut tracker = IopsTracker::starting_at(&small_config(), start);
        assert!(!run_window(&mut tracker, &mut start, 50));
        assert_eq!(tracker.level(), 0);
        assert!(run_window(&mut tracker, &mut start, 50));
        assert_eq!(tracker.level(), 1);
    }

    #[test]
    fn test_single_spike_is_ignored() {
        let mut start = Instant::now();
        let mut tracker = IopsTracker::starting_at(&small_config(), start);
        assert!(!run_window(&mut tracker, &mut start, 500));
        assert!(!run_window(&mut tracker, &mut start, 2));
        assert!(!run_window(&mut tracker, &mut start, 500));
        assert_eq!(tracker.level(), 0);
    }

    #[test]
    fn test_promotion_takes_lower_of_two_candidates() {
        let mut start = Instant::now();
        let mut tracker = IopsTracker::starting_at(&small_config(), start);
        run_window(&mut tracker, &mut start, 500);
        assert!(run_window(&mut tracker, &mut start, 50));
        assert_eq!(tracker.level(), 1);
        assert!(!run_window(&mut tracker, &mut start, 500));
        assert!(run_window(&mut tracker, &mut start, 500));
        assert_eq!(tracker.level(), 2);
    }

    #[test]
    fn test_two_quiet_windows_disable_buffering() {
        let mut start = Instant::now();
        let mut tracker = IopsTracker::starting_at(&small_config(), start);
        run_window(&mut tracker, &mut start, 50);
        run_window(&mut tracker, &mut start, 50);
        assert_eq!(tracker.level(), 1);
        assert!(!run_window(&mut tracker, &mut start, 2));
        assert_eq!(tracker.level(), 1);
        assert!(run_window(&mut tracker, &mut start, 2));
        assert_eq!(tracker.level(), 0);
    }

    #[test]
    fn test_demotion_keeps_higher_of_two_candidates() {
        let mut start = Instant::now();
        let mut tracker = IopsTracker::starting_at(&small_config(), start);
        run_window(&mut tracker, &mut start, 500);
        run_window(&mut tracker, &mut start, 500);
        assert_eq!(tracker.level(), 2);
        run_window(&mut tracker, &mut start, 50);
        assert!(run_window(&mut tracker, &mut start, 2));
        assert_eq!(tracker.level(), 1);
    }

    proptest! {
        #[test]
        fn prop_level_changes_need_two_agreeing_windows(rates in proptest::collection::vec(1u64..300, 1..12)) {
            let config = small_config();
            let mut start = Instant::now();
            let mut tracker = IopsTracker::starting_at(&config, start);
            let mut previous_candidate = 0usize;
            for ops in rates {
                let before = tracker.level();
                let candidate = config.thresholds.iter().filter(|t| ops >= **t).count();
                let changed = run_window(&mut tracker, &mut start, ops);
                prop_assert_eq!(changed, tracker.level() != before);
                if changed {
                    let up = tracker.level() > before;
                    prop_assert_eq!(candidate > before, up);
                    prop_assert_eq!(previous_candidate > before, up);
                }
                previous_candidate = candidate;
            }
        }
    }
}
