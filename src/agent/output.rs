use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured result every agent returns on success
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub action: String,
    /// Why the agent did what it did. Required.
    pub rationale: String,
    /// In `[0, 1]`
    pub confidence: f64,
    #[serde(default)]
    pub alternatives_considered: Vec<String>,
    #[serde(default)]
    pub data: Value,
}

impl AgentOutput {
    pub fn new(action: &str, rationale: &str, confidence: f64) -> Self {
        Self {
            action: action.to_string(),
            rationale: rationale.to_string(),
            confidence,
            alternatives_considered: Vec::new(),
            data: Value::Null,
        }
    }

    pub fn with_alternatives(mut self, alternatives: Vec<String>) -> Self {
        self.alternatives_considered = alternatives;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Contract check applied to every output before it is accepted
    pub fn validate(&self) -> Result<(), String> {
        if self.rationale.trim().is_empty() {
            return Err("agent output is missing a rationale".to_string());
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!(
                "agent confidence {} is outside [0, 1]",
                self.confidence
            ));
        }
        Ok(())
    }
}
