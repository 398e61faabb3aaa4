//! Accept-rate limiting.
//!
//! A token bucket with two regimes. Right after startup the whole miner
//! fleet reconnects at once, so the bucket starts with a large burst
//! capacity and a generous refill rate; once the steady-state window
//! passes, the refill drops to a trickle sized for routine churn. With
//! auto mode on, both regimes derive from `max_conns` so operators only
//! tune fleet size.

use std::time::{Duration, Instant};

use crate::config::AcceptConfig;

#[derive(Debug)]
pub struct AcceptLimiter {
    started: Instant,
    steady_after: Duration,
    startup_rate: f64,
    steady_rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl AcceptLimiter {
    /// Build from config; `max_conns` feeds the auto derivation.
    pub fn new(config: &AcceptConfig, max_conns: usize, now: Instant) -> Self {
        let (startup_rate, capacity, steady_rate) = if config.auto_accept_rate_limits {
            let fleet = max_conns.max(1) as f64;
            let burst = (fleet * config.accept_burst_percent / 100.0).max(1.0);
            // Startup must both admit the burst within its window and let
            // the whole fleet back in within the reconnect window.
            let startup = (burst / config.accept_burst_window_secs.max(1) as f64)
                .max(fleet / config.accept_reconnect_window_secs.max(1) as f64)
                .max(1.0);
            let steady = (fleet * config.accept_steady_state_reconnect_percent / 100.0
                / config.accept_steady_state_reconnect_window_secs.max(1) as f64)
                .max(0.1);
            (startup, burst, steady)
        } else {
            (
                config.max_accepts_per_second,
                config.max_accept_burst,
                config.accept_steady_state_rate,
            )
        };

        Self {
            started: now,
            steady_after: Duration::from_secs(config.accept_steady_state_window_secs),
            startup_rate,
            steady_rate,
            capacity,
            tokens: capacity,
            last_refill: now,
        }
    }

    fn rate_at(&self, now: Instant) -> f64 {
        if now.duration_since(self.started) < self.steady_after {
            self.startup_rate
        } else {
            self.steady_rate
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_at(now)).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
