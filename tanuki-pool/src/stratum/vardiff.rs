//! Per-connection variable difficulty.
//!
//! A simple proportional controller: over each adjustment window the
//! accepted-share rate is compared to the target rate, and the assigned
//! difficulty scales by that ratio, clamped to the configured bounds and
//! snapped to the nearest power of two so repeated adjustments settle on
//! stable values. The controller owns only its own window; the status
//! counters a connection keeps for reporting are never touched here.

use std::time::{Duration, Instant};

use crate::config::{StratumConfig, VardiffConfig};
use crate::types::{nearest_power_of_two, ShareRate};

#[derive(Debug, Clone)]
pub struct Vardiff {
    window: Duration,
    target: ShareRate,
    min_diff: f64,
    max_diff: f64,
    window_start: Instant,
    accepted: u32,
    locked: bool,
}

impl Vardiff {
    pub fn new(vardiff: &VardiffConfig, stratum: &StratumConfig, now: Instant) -> Self {
        Self {
            window: Duration::from_secs(vardiff.adjustment_window_secs),
            target: ShareRate::per_minute(vardiff.target_shares_per_min),
            min_diff: stratum.min_diff,
            max_diff: stratum.max_diff,
            window_start: now,
            accepted: 0,
            locked: false,
        }
    }

    /// Clamp a difficulty into the configured bounds.
    pub fn clamp(&self, difficulty: f64) -> f64 {
        difficulty.clamp(self.min_diff, self.max_diff)
    }

    /// Stop adjusting; a locked controller still counts but never retargets.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Record one accepted share.
    pub fn record_accepted(&mut self) {
        self.accepted = self.accepted.saturating_add(1);
    }

    /// Close the window if it is due and compute the next difficulty.
    ///
    /// The window closes when the accepted count reaches the floor target
    /// for a full window, or when the window has fully elapsed. Returns the
    /// new difficulty only when it differs from `assigned`.
    pub fn maybe_adjust(&mut self, assigned: f64, now: Instant) -> Option<f64> {
        let elapsed = now.duration_since(self.window_start);
        let floor_target = self.target.shares_in(self.window).max(1);

        if self.accepted < floor_target && elapsed < self.window {
            return None;
        }

        let elapsed_secs = elapsed.as_secs_f64().max(1e-3);
        let observed_rate = self.accepted as f64 / elapsed_secs;

        self.window_start = now;
        self.accepted = 0;

        if self.locked {
            return None;
        }

        let scaled = assigned * (observed_rate / self.target.as_per_second());
        let next = self.clamp(nearest_power_of_two(self.clamp(scaled)));

        (next != assigned).then_some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(window_secs: u64, per_min: f64) -> Vardiff {
        let vardiff = VardiffConfig {
            adjustment_window_secs: window_secs,
            target_shares_per_min: per_min,
        };
        let stratum = StratumConfig {
            min_diff: 1.0,
            max_diff: 65536.0,
            ..StratumConfig::default()
        };
        Vardiff::new(&vardiff, &stratum, Instant::now())
    }

    #[test]
    fn quiet_window_stays_open() {
        let mut vardiff = controller(120, 20.0);
        let now = vardiff.window_start + Duration::from_secs(30);
        assert_eq!(vardiff.maybe_adjust(64.0, now), None);
    }

    #[test]
    fn fast_miner_scales_difficulty_up() {
        let mut vardiff = controller(120, 20.0);
        // 40 shares in 30 seconds = 80/min against a 20/min target.
        for _ in 0..40 {
            vardiff.record_accepted();
        }
        let now = vardiff.window_start + Duration::from_secs(30);
        let next = vardiff.maybe_adjust(64.0, now).expect("should adjust");
        // 64 x 4 = 256, already a power of two.
        assert_eq!(next, 256.0);
    }

    #[test]
    fn slow_miner_scales_difficulty_down() {
        let mut vardiff = controller(120, 20.0);
        // 10 shares over the full window = 5/min against 20/min.
        for _ in 0..10 {
            vardiff.record_accepted();
        }
        let now = vardiff.window_start + Duration::from_secs(120);
        let next = vardiff.maybe_adjust(64.0, now).expect("should adjust");
        assert_eq!(next, 16.0);
    }

    #[test]
    fn silent_window_clamps_to_minimum() {
        let mut vardiff = controller(120, 20.0);
        let now = vardiff.window_start + Duration::from_secs(120);
        assert_eq!(vardiff.maybe_adjust(64.0, now), Some(1.0));
    }

    #[test]
    fn result_clamps_to_maximum() {
        let mut vardiff = controller(120, 20.0);
        for _ in 0..4000 {
            vardiff.record_accepted();
        }
        let now = vardiff.window_start + Duration::from_secs(30);
        assert_eq!(vardiff.maybe_adjust(40000.0, now), Some(65536.0));
    }

    #[test]
    fn no_emission_when_target_unchanged() {
        let mut vardiff = controller(120, 20.0);
        // Exactly on target: 40 shares over 120 s at 20/min.
        for _ in 0..40 {
            vardiff.record_accepted();
        }
        let now = vardiff.window_start + Duration::from_secs(120);
        assert_eq!(vardiff.maybe_adjust(64.0, now), None);
    }

    #[test]
    fn window_resets_after_adjustment() {
        let mut vardiff = controller(120, 20.0);
        for _ in 0..40 {
            vardiff.record_accepted();
        }
        let mid = vardiff.window_start + Duration::from_secs(30);
        vardiff.maybe_adjust(64.0, mid).unwrap();

        // A fresh window right after: no immediate re-adjustment.
        assert_eq!(vardiff.accepted, 0);
        assert_eq!(
            vardiff.maybe_adjust(256.0, mid + Duration::from_secs(1)),
            None
        );
    }

    #[test]
    fn locked_controller_counts_but_never_adjusts() {
        let mut vardiff = controller(120, 20.0);
        vardiff.lock();
        for _ in 0..400 {
            vardiff.record_accepted();
        }
        let now = vardiff.window_start + Duration::from_secs(120);
        assert_eq!(vardiff.maybe_adjust(64.0, now), None);
        // The window still reset.
        assert_eq!(vardiff.accepted, 0);
    }
}
