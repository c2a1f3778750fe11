//! Resource governors: re-anchor rate budgets and plan density caps.

pub mod density;
pub mod rate;

pub use density::{ActiveEntry, Admission, DensityCap, DensityConfig, DensityGovernor};
pub use rate::{RateConfig, RateDecision, RateGovernor, RateLimit};
