use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::autonomy::DealBreaker;

/// Per-user autonomy settings.
///
/// `tier` is kept as the raw label so that a value the running build does not
/// know is still stored, and the gate can fail closed on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub tier: String,
    #[serde(default)]
    pub deal_breakers: Vec<DealBreaker>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn new(user_id: &str, tier: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            tier: tier.to_string(),
            deal_breakers: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_deal_breaker(mut self, rule: DealBreaker) -> Self {
        self.deal_breakers.push(rule);
        self
    }
}
