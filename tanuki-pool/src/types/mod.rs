//! Shared value types for the pool core.

mod difficulty;
mod hashrate;
mod share_rate;

pub use difficulty::{nearest_power_of_two, Difficulty};
pub use hashrate::{HashRate, HashrateEma};
pub use share_rate::ShareRate;
