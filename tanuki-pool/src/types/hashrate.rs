//! Hashrate estimation from accepted shares.
//!
//! Each accepted share represents an expected `difficulty x 2^32` hashes.
//! [`HashrateEma`] turns the share stream into an exponentially-weighted
//! rate. Connections keep two of these: a slow one for display and a
//! faster one (~tau/6) feeding the VarDiff controller.

use std::fmt;
use std::time::{Duration, Instant};

/// Work expected per unit difficulty: 2^32 hashes.
const HASHES_PER_DIFF: f64 = 4_294_967_296.0;

/// A hashrate in hashes per second.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HashRate(pub f64);

impl HashRate {
    pub fn as_hs(&self) -> f64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 <= 0.0
    }
}

impl fmt::Display for HashRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        let (scaled, suffix) = if v >= 1e18 {
            (v / 1e18, "EH/s")
        } else if v >= 1e15 {
            (v / 1e15, "PH/s")
        } else if v >= 1e12 {
            (v / 1e12, "TH/s")
        } else if v >= 1e9 {
            (v / 1e9, "GH/s")
        } else if v >= 1e6 {
            (v / 1e6, "MH/s")
        } else if v >= 1e3 {
            (v / 1e3, "kH/s")
        } else {
            (v, "H/s")
        };
        if scaled >= 100.0 {
            write!(f, "{:.0} {}", scaled, suffix)
        } else {
            write!(f, "{:.2} {}", scaled, suffix)
        }
    }
}

/// Exponentially-weighted hashrate average with a bootstrap phase.
///
/// Until `tau` has elapsed since the first recorded share, samples only
/// accumulate and [`HashrateEma::value`] reports nothing; a single share
/// carries too little information for a meaningful rate. Once the bootstrap
/// window closes the average of the accumulated work seeds the EMA, and
/// later samples fold in with decay `alpha = 1 - exp(-dt/tau)`.
#[derive(Debug, Clone)]
pub struct HashrateEma {
    tau: Duration,
    first_share_at: Option<Instant>,
    boot_work: f64,
    value: Option<f64>,
    last_update: Option<Instant>,
}

impl HashrateEma {
    pub fn new(tau: Duration) -> Self {
        Self {
            tau,
            first_share_at: None,
            boot_work: 0.0,
            value: None,
            last_update: None,
        }
    }

    /// Record an accepted share of the given difficulty.
    pub fn record(&mut self, difficulty: f64, now: Instant) {
        let work = difficulty * HASHES_PER_DIFF;

        let Some(first) = self.first_share_at else {
            self.first_share_at = Some(now);
            self.boot_work = work;
            self.last_update = Some(now);
            return;
        };

        let since_first = now.duration_since(first);
        if self.value.is_none() {
            self.boot_work += work;
            if since_first >= self.tau {
                // Seed from the accumulated average over the bootstrap span.
                self.value = Some(self.boot_work / since_first.as_secs_f64());
            }
            self.last_update = Some(now);
            return;
        }

        let dt = now
            .duration_since(self.last_update.unwrap_or(now))
            .as_secs_f64()
            .max(1e-3);
        let sample = work / dt;
        let alpha = 1.0 - (-dt / self.tau.as_secs_f64()).exp();
        let prev = self.value.unwrap();
        self.value = Some(prev + alpha * (sample - prev));
        self.last_update = Some(now);
    }

    /// The current estimate, if the bootstrap window has closed.
    pub fn value(&self) -> Option<HashRate> {
        self.value.map(HashRate)
    }

    /// The estimate decayed by idle time since the last share.
    ///
    /// A connection that stops submitting sees its reported rate fall off
    /// exponentially instead of freezing at the last sample.
    pub fn decayed(&self, now: Instant) -> Option<HashRate> {
        let value = self.value?;
        let idle = now
            .duration_since(self.last_update.unwrap_or(now))
            .as_secs_f64();
        Some(HashRate(value * (-idle / self.tau.as_secs_f64()).exp()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAU: Duration = Duration::from_secs(60);

    #[test]
    fn bootstrap_emits_nothing_before_tau() {
        let mut ema = HashrateEma::new(TAU);
        let start = Instant::now();
        ema.record(100.0, start);
        ema.record(100.0, start + Duration::from_secs(10));
        ema.record(100.0, start + Duration::from_secs(30));
        assert!(ema.value().is_none());
    }

    #[test]
    fn bootstrap_seeds_from_accumulated_average() {
        let mut ema = HashrateEma::new(TAU);
        let start = Instant::now();
        // One share of difficulty 100 every 10 seconds for 60 seconds.
        for i in 0..7 {
            ema.record(100.0, start + Duration::from_secs(i * 10));
        }
        let rate = ema.value().expect("bootstrap closed").as_hs();
        // 7 x 100 x 2^32 hashes over 60 seconds; the first share opened the
        // window, so expect roughly that average.
        let expected = 7.0 * 100.0 * HASHES_PER_DIFF / 60.0;
        let rel = (rate - expected).abs() / expected;
        assert!(rel < 0.01, "rate {rate}, expected {expected}");
    }

    #[test]
    fn steady_stream_converges_to_true_rate() {
        let mut ema = HashrateEma::new(TAU);
        let start = Instant::now();
        // Difficulty 64 every 4 seconds: true rate = 64 x 2^32 / 4.
        for i in 0..200u64 {
            ema.record(64.0, start + Duration::from_secs(i * 4));
        }
        let rate = ema.value().unwrap().as_hs();
        let expected = 64.0 * HASHES_PER_DIFF / 4.0;
        let rel = (rate - expected).abs() / expected;
        assert!(rel < 0.05, "rate {rate}, expected {expected}");
    }

    #[test]
    fn idle_decay_reduces_estimate() {
        let mut ema = HashrateEma::new(TAU);
        let start = Instant::now();
        for i in 0..20u64 {
            ema.record(64.0, start + Duration::from_secs(i * 10));
        }
        let settled = ema.value().unwrap().as_hs();
        let last = start + Duration::from_secs(190);

        let after_tau = ema.decayed(last + TAU).unwrap().as_hs();
        assert!(after_tau < settled * 0.5, "decayed {after_tau} vs {settled}");
        // Still strictly positive, never clamped to zero.
        assert!(after_tau > 0.0);
    }

    #[test]
    fn control_tau_decays_faster_than_display() {
        let start = Instant::now();
        let mut display = HashrateEma::new(Duration::from_secs(600));
        let mut control = HashrateEma::new(Duration::from_secs(100));
        for i in 0..200u64 {
            let t = start + Duration::from_secs(i * 5);
            display.record(32.0, t);
            control.record(32.0, t);
        }
        let last = start + Duration::from_secs(995);
        let idle = last + Duration::from_secs(300);
        let d = display.decayed(idle).unwrap().as_hs();
        let c = control.decayed(idle).unwrap().as_hs();
        assert!(c < d, "control {c} should decay below display {d}");
    }

    #[test]
    fn display_formatting() {
        assert_eq!(HashRate(512.0e9).to_string(), "512 GH/s");
        assert_eq!(HashRate(1.5e12).to_string(), "1.50 TH/s");
        assert_eq!(HashRate(0.0).to_string(), "0.00 H/s");
    }
}
