//! Autonomy tiers and their static capability table

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::config::AutonomyConfig;

/// User-configured ceiling on how far agents may act without approval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AutonomyTier {
    /// Suggestions only
    L0,
    /// Suggestions with richer drafts, still no side effects
    L1,
    /// Writes are queued for approval
    L2,
    /// Writes execute directly within deal-breakers and daily caps
    L3,
}

impl AutonomyTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutonomyTier::L0 => "L0",
            AutonomyTier::L1 => "L1",
            AutonomyTier::L2 => "L2",
            AutonomyTier::L3 => "L3",
        }
    }

    /// Parse a stored tier label. Unknown labels return `None`.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_uppercase().as_str() {
            "L0" => Some(AutonomyTier::L0),
            "L1" => Some(AutonomyTier::L1),
            "L2" => Some(AutonomyTier::L2),
            "L3" => Some(AutonomyTier::L3),
            _ => None,
        }
    }
}

impl fmt::Display for AutonomyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Capability row for one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCapabilities {
    pub can_execute_writes: bool,
    pub requires_approval: bool,
    /// Maximum directly executed write actions per user per UTC day
    pub daily_action_cap: Option<u32>,
}

/// Immutable tier → capability lookup, built once at startup
#[derive(Debug, Clone)]
pub struct TierTable {
    rows: HashMap<AutonomyTier, TierCapabilities>,
}

impl Default for TierTable {
    fn default() -> Self {
        Self::from_config(&AutonomyConfig::default())
    }
}

impl TierTable {
    pub fn from_config(config: &AutonomyConfig) -> Self {
        let mut rows = HashMap::new();
        rows.insert(
            AutonomyTier::L0,
            TierCapabilities {
                can_execute_writes: false,
                requires_approval: false,
                daily_action_cap: Some(0),
            },
        );
        rows.insert(
            AutonomyTier::L1,
            TierCapabilities {
                can_execute_writes: false,
                requires_approval: false,
                daily_action_cap: Some(0),
            },
        );
        rows.insert(
            AutonomyTier::L2,
            TierCapabilities {
                can_execute_writes: true,
                requires_approval: true,
                daily_action_cap: Some(config.l2_daily_cap),
            },
        );
        rows.insert(
            AutonomyTier::L3,
            TierCapabilities {
                can_execute_writes: true,
                requires_approval: false,
                daily_action_cap: Some(config.l3_daily_cap),
            },
        );
        Self { rows }
    }

    pub fn get(&self, tier: AutonomyTier) -> Option<&TierCapabilities> {
        self.rows.get(&tier)
    }
}
