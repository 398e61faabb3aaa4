//! Share rate type for expressing submission-rate targets.

use std::time::Duration;

/// Share submission rate (shares per unit time).
///
/// VarDiff steers every connection toward a configured target rate; this
/// type keeps the conversions between per-second, per-minute and interval
/// representations in one place. Internally stores the interval between
/// shares, which guarantees the rate is always positive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShareRate(Duration);

impl ShareRate {
    /// Create a rate of N shares per minute.
    ///
    /// # Panics
    /// Panics if `shares` is not positive.
    pub fn per_minute(shares: f64) -> Self {
        assert!(shares > 0.0, "share rate must be positive");
        Self(Duration::from_secs_f64(60.0 / shares))
    }

    /// Create a rate from the target average interval between shares.
    ///
    /// # Panics
    /// Panics if `interval` is zero.
    pub const fn from_interval(interval: Duration) -> Self {
        assert!(!interval.is_zero(), "interval must be non-zero");
        Self(interval)
    }

    pub fn as_per_second(&self) -> f64 {
        1.0 / self.0.as_secs_f64()
    }

    pub fn as_per_minute(&self) -> f64 {
        60.0 / self.0.as_secs_f64()
    }

    pub fn as_interval(&self) -> Duration {
        self.0
    }

    /// Expected whole number of shares inside `window` at this rate.
    ///
    /// VarDiff closes its adjustment window early once this many shares
    /// have arrived.
    pub fn shares_in(&self, window: Duration) -> u32 {
        (window.as_secs_f64() * self.as_per_second()).floor() as u32
    }
}

impl std::fmt::Display for ShareRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let per_min = self.as_per_minute();
        if per_min >= 1.0 {
            write!(f, "{:.1} shares/min", per_min)
        } else {
            write!(f, "{:.3} shares/sec", self.as_per_second())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_are_consistent() {
        let rate = ShareRate::per_minute(6.0);
        assert!((rate.as_per_second() - 0.1).abs() < 1e-9);
        assert!((rate.as_interval().as_secs_f64() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn from_interval_roundtrip() {
        let rate = ShareRate::from_interval(Duration::from_secs(15));
        assert!((rate.as_per_minute() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn shares_in_window_floors() {
        let rate = ShareRate::per_minute(20.0); // one share every 3 s
        assert_eq!(rate.shares_in(Duration::from_secs(120)), 40);
        assert_eq!(rate.shares_in(Duration::from_secs(10)), 3);
    }

    #[test]
    fn display() {
        assert_eq!(ShareRate::per_minute(6.0).to_string(), "6.0 shares/min");
        assert_eq!(
            ShareRate::from_interval(Duration::from_secs(120)).to_string(),
            "0.008 shares/sec"
        );
    }
}
