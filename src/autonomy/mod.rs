//! Autonomy enforcement: tiers, deal-breakers and the gate

pub mod deal_breaker;
pub mod gate;
pub mod tier;

pub use deal_breaker::{violations, DealBreaker, DealBreakerRule};
pub use gate::{ActionSpec, AutonomyGate, Decision, DecisionReason, GateRequest, GateVerdict};
pub use tier::{AutonomyTier, TierCapabilities, TierTable};
