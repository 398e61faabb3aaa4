//! Difficulty type with lossless 256-bit target representation.

use std::cmp::Ordering;
use std::fmt;

use bitcoin::pow::Target;
use ruint::aliases::U256;

/// Share difficulty.
///
/// Internally stores the corresponding target for lossless 256-bit
/// precision. Difficulty and target have an inverse relationship:
///
/// ```text
/// target = diff1_target / difficulty
/// difficulty = diff1_target / target
/// ```
///
/// Used for Stratum (`mining.set_difficulty` carries a number), share
/// validation (via [`Difficulty::to_target`]) and display. Sub-1.0
/// difficulties are supported for low-hashrate test rigs; their targets
/// exceed the difficulty-1 target.
#[derive(Debug, Clone, Copy)]
pub struct Difficulty(Target);

impl Difficulty {
    fn diff1() -> U256 {
        U256::from_le_bytes(Target::MAX.to_le_bytes())
    }

    /// Create from a difficulty value.
    ///
    /// Values below 1.0 produce targets above the difficulty-1 target;
    /// non-finite or non-positive input saturates to difficulty 1.
    pub fn from_f64(value: f64) -> Self {
        if value <= 0.0 || !value.is_finite() {
            return Self(Target::MAX);
        }

        let target = if value >= 1.0 {
            Self::diff1() / U256::from((value as u64).max(1))
        } else {
            let multiplier = (1.0 / value) as u64;
            Self::diff1()
                .checked_mul(U256::from(multiplier))
                .unwrap_or(U256::MAX)
        };
        Self(Target::from_le_bytes(target.to_le_bytes::<32>()))
    }

    /// Difficulty as a float (lossy for very large values).
    pub fn as_f64(self) -> f64 {
        self.0.difficulty_float()
    }

    /// Create from a target (lossless).
    pub fn from_target(target: Target) -> Self {
        Self(target)
    }

    /// The underlying target (lossless). Use this for share validation.
    pub fn to_target(self) -> Target {
        self.0
    }
}

impl From<u64> for Difficulty {
    fn from(diff: u64) -> Self {
        if diff == 0 {
            return Self(Target::MAX);
        }
        let target = Self::diff1() / U256::from(diff);
        Self(Target::from_le_bytes(target.to_le_bytes::<32>()))
    }
}

impl PartialEq for Difficulty {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Difficulty {}

impl PartialOrd for Difficulty {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Difficulty {
    fn cmp(&self, other: &Self) -> Ordering {
        // Smaller target = higher difficulty.
        other.0.cmp(&self.0)
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.as_f64();

        if value < 1.0 {
            let s = format!("{:.6}", value);
            return write!(f, "{}", s.trim_end_matches('0').trim_end_matches('.'));
        }

        let (scaled, suffix) = if value >= 1e15 {
            (value / 1e15, "P")
        } else if value >= 1e12 {
            (value / 1e12, "T")
        } else if value >= 1e9 {
            (value / 1e9, "G")
        } else if value >= 1e6 {
            (value / 1e6, "M")
        } else if value >= 1e3 {
            (value / 1e3, "K")
        } else {
            (value, "")
        };

        if scaled >= 100.0 || scaled.fract() == 0.0 {
            write!(f, "{:.0}{}", scaled, suffix)
        } else if scaled >= 10.0 {
            write!(f, "{:.1}{}", scaled, suffix)
        } else {
            write!(f, "{:.2}{}", scaled, suffix)
        }
    }
}

/// Snap a difficulty to the nearest power of two, used by VarDiff so
/// consecutive adjustments land on stable values.
pub fn nearest_power_of_two(value: f64) -> f64 {
    if value <= 0.0 || !value.is_finite() {
        return 1.0;
    }
    2f64.powi(value.log2().round() as i32)
}
