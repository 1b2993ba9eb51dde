//! Autonomy Gate
//!
//! Pure decision over (tier, action) before any side-effecting work:
//! - unknown tier or action fails closed
//! - read-only actions always execute
//! - deal-breaker violations deny writes at every tier
//! - tier capabilities pick suggest / approval / execute
//! - the daily cap downgrades direct execution to approval

use serde::{Deserialize, Serialize};

use super::tier::{AutonomyTier, TierTable};

/// Declared shape of an action an agent can perform
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    /// Whether the action has side effects outside the platform
    pub is_write: bool,
}

impl ActionSpec {
    pub fn read(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_write: false,
        }
    }

    pub fn write(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_write: true,
        }
    }
}

/// Gate outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Execute,
    QueueForApproval,
    Suggest,
    Deny,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Execute => "execute",
            Decision::QueueForApproval => "queue_for_approval",
            Decision::Suggest => "suggest",
            Decision::Deny => "deny",
        }
    }
}

/// Why the gate decided what it did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DecisionReason {
    UnknownTier { tier: String },
    UnknownAction { action: String },
    ReadOnly,
    DealBreaker { violations: Vec<String> },
    SuggestOnly { tier: AutonomyTier },
    ApprovalRequired { tier: AutonomyTier },
    DailyCapReached { cap: u32, used: u32 },
    WithinTier { tier: AutonomyTier },
}

impl std::fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionReason::UnknownTier { tier } => write!(f, "Unknown autonomy tier '{}'", tier),
            DecisionReason::UnknownAction { action } => write!(f, "Unknown action '{}'", action),
            DecisionReason::ReadOnly => write!(f, "Read-only action"),
            DecisionReason::DealBreaker { violations } => {
                write!(f, "Deal-breaker violated: {}", violations.join("; "))
            }
            DecisionReason::SuggestOnly { tier } => {
                write!(f, "Tier {} only allows suggestions for writes", tier)
            }
            DecisionReason::ApprovalRequired { tier } => {
                write!(f, "Tier {} requires approval for writes", tier)
            }
            DecisionReason::DailyCapReached { cap, used } => {
                write!(f, "Daily action cap reached ({}/{})", used, cap)
            }
            DecisionReason::WithinTier { tier } => write!(f, "Allowed by tier {}", tier),
        }
    }
}

/// Decision plus its reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub decision: Decision,
    pub reason: DecisionReason,
}

impl GateVerdict {
    fn new(decision: Decision, reason: DecisionReason) -> Self {
        Self { decision, reason }
    }
}

/// Everything the gate looks at. Built by the caller; the gate does no I/O.
#[derive(Debug, Clone)]
pub struct GateRequest<'a> {
    /// Raw tier label from the user profile, `None` when no profile exists
    pub tier: Option<&'a str>,
    pub action_name: &'a str,
    /// Catalog entry for the action, `None` when no agent declares it
    pub action: Option<&'a ActionSpec>,
    /// Deal-breaker violations for the payload
    pub violations: &'a [String],
    /// Writes already executed directly today
    pub actions_today: u32,
}

/// Pure autonomy gate over an immutable tier table
#[derive(Debug, Clone, Default)]
pub struct AutonomyGate {
    table: TierTable,
}

impl AutonomyGate {
    pub fn new(table: TierTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &TierTable {
        &self.table
    }

    /// Decide what may happen to an action. Same input, same verdict.
    pub fn decide(&self, req: &GateRequest<'_>) -> GateVerdict {
        let tier_label = req.tier.unwrap_or("");
        let tier = match AutonomyTier::parse(tier_label) {
            Some(t) => t,
            None => {
                return GateVerdict::new(
                    Decision::Deny,
                    DecisionReason::UnknownTier {
                        tier: tier_label.to_string(),
                    },
                )
            }
        };
        let caps = match self.table.get(tier) {
            Some(c) => c,
            None => {
                return GateVerdict::new(
                    Decision::Deny,
                    DecisionReason::UnknownTier {
                        tier: tier_label.to_string(),
                    },
                )
            }
        };
        let action = match req.action {
            Some(a) if a.name == req.action_name => a,
            _ => {
                return GateVerdict::new(
                    Decision::Deny,
                    DecisionReason::UnknownAction {
                        action: req.action_name.to_string(),
                    },
                )
            }
        };

        if !action.is_write {
            return GateVerdict::new(Decision::Execute, DecisionReason::ReadOnly);
        }

        if !req.violations.is_empty() {
            return GateVerdict::new(
                Decision::Deny,
                DecisionReason::DealBreaker {
                    violations: req.violations.to_vec(),
                },
            );
        }

        if !caps.can_execute_writes {
            return GateVerdict::new(Decision::Suggest, DecisionReason::SuggestOnly { tier });
        }

        if caps.requires_approval {
            return GateVerdict::new(
                Decision::QueueForApproval,
                DecisionReason::ApprovalRequired { tier },
            );
        }

        if let Some(cap) = caps.daily_action_cap {
            if req.actions_today >= cap {
                return GateVerdict::new(
                    Decision::QueueForApproval,
                    DecisionReason::DailyCapReached {
                        cap,
                        used: req.actions_today,
                    },
                );
            }
        }

        GateVerdict::new(Decision::Execute, DecisionReason::WithinTier { tier })
    }
}
