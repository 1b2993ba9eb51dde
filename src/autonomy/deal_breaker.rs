//! Deal-breakers: hard user constraints no tier may override

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Constraint applied to one payload field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum DealBreakerRule {
    /// Field must not equal any of these values
    BlockedValues { values: Vec<Value> },
    /// Field must be present and equal one of these values
    RequiredValues { values: Vec<Value> },
    /// Numeric field must be at least `value`
    Min { value: f64 },
    /// Numeric field must be at most `value`
    Max { value: f64 },
}

/// A named rule over a JSON-pointer field of the action payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealBreaker {
    pub name: String,
    /// JSON pointer, e.g. `/company` or `/salary/min`
    pub field: String,
    #[serde(flatten)]
    pub rule: DealBreakerRule,
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x.trim().eq_ignore_ascii_case(y.trim()),
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

impl DealBreaker {
    pub fn blocked(name: &str, field: &str, values: Vec<Value>) -> Self {
        Self {
            name: name.to_string(),
            field: field.to_string(),
            rule: DealBreakerRule::BlockedValues { values },
        }
    }

    pub fn min(name: &str, field: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            field: field.to_string(),
            rule: DealBreakerRule::Min { value },
        }
    }

    fn not_a_number(&self, actual: &Value) -> String {
        format!("{}: {} is not a number", self.name, actual)
    }

    /// Describe the violation, if `payload` breaks this rule.
    ///
    /// A missing or null field only violates `RequiredValues`; numeric bounds
    /// cannot be judged without a value. A bound over a value that is present
    /// but not a number (`"40000"`, `true`) is always violated.
    pub fn violation(&self, payload: &Value) -> Option<String> {
        let field = payload.pointer(&self.field);

        match (&self.rule, field) {
            (DealBreakerRule::BlockedValues { values }, Some(actual)) => values
                .iter()
                .any(|blocked| values_equal(blocked, actual))
                .then(|| format!("{}: {} is blocked", self.name, actual)),
            (DealBreakerRule::BlockedValues { .. }, None) => None,
            (DealBreakerRule::RequiredValues { values }, Some(actual)) => (!values
                .iter()
                .any(|required| values_equal(required, actual)))
            .then(|| format!("{}: {} is not an accepted value", self.name, actual)),
            (DealBreakerRule::RequiredValues { .. }, None) => {
                Some(format!("{}: {} is missing", self.name, self.field))
            }
            (DealBreakerRule::Min { .. } | DealBreakerRule::Max { .. }, Some(Value::Null)) => None,
            (DealBreakerRule::Min { value }, Some(actual)) => match actual.as_f64() {
                Some(n) if n < *value => {
                    Some(format!("{}: {} is below minimum {}", self.name, n, value))
                }
                Some(_) => None,
                None => Some(self.not_a_number(actual)),
            },
            (DealBreakerRule::Max { value }, Some(actual)) => match actual.as_f64() {
                Some(n) if n > *value => {
                    Some(format!("{}: {} is above maximum {}", self.name, n, value))
                }
                Some(_) => None,
                None => Some(self.not_a_number(actual)),
            },
            (DealBreakerRule::Min { .. } | DealBreakerRule::Max { .. }, None) => None,
        }
    }
}

/// Every violated rule for `payload`
pub fn violations(rules: &[DealBreaker], payload: &Value) -> Vec<String> {
    rules.iter().filter_map(|r| r.violation(payload)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_blocked_company_is_case_insensitive() {
        let rule = DealBreaker::blocked("no-acme", "/company", vec![json!("Acme Corp")]);
        assert!(rule.violation(&json!({"company": "acme corp"})).is_some());
        assert!(rule.violation(&json!({"company": "Globex"})).is_none());
        assert!(rule.violation(&json!({})).is_none());
    }

    #[test]
    fn test_salary_floor() {
        let rule = DealBreaker::min("salary-floor", "/salary/min", 120_000.0);
        assert!(rule.violation(&json!({"salary": {"min": 90_000}})).is_some());
        assert!(rule.violation(&json!({"salary": {"min": 150_000}})).is_none());
        assert!(rule.violation(&json!({"title": "engineer"})).is_none());
    }

    #[test]
    fn test_bounds_reject_non_numeric_values() {
        let floor = DealBreaker::min("floor", "/salary", 100_000.0);
        let violation = floor.violation(&json!({"salary": "40000"})).unwrap();
        assert!(violation.contains("not a number"));
        assert!(floor.violation(&json!({"salary": "150000"})).is_some());
        assert!(floor.violation(&json!({"salary": {"min": 150_000}})).is_some());
        assert!(floor.violation(&json!({"salary": null})).is_none());

        let cap = DealBreaker {
            name: "commute".to_string(),
            field: "/commute_minutes".to_string(),
            rule: DealBreakerRule::Max { value: 45.0 },
        };
        assert!(cap.violation(&json!({"commute_minutes": true})).is_some());
        assert!(cap.violation(&json!({"commute_minutes": 30})).is_none());
    }

    #[test]
    fn test_required_values_fail_on_missing_field() {
        let rule = DealBreaker {
            name: "remote-only".to_string(),
            field: "/location_type".to_string(),
            rule: DealBreakerRule::RequiredValues {
                values: vec![json!("remote")],
            },
        };
        assert!(rule.violation(&json!({})).is_some());
        assert!(rule.violation(&json!({"location_type": "onsite"})).is_some());
        assert!(rule.violation(&json!({"location_type": "Remote"})).is_none());
    }

    #[test]
    fn test_rule_wire_format() {
        let rule: DealBreaker = serde_json::from_value(json!({
            "name": "cap",
            "field": "/commute_minutes",
            "rule": "max",
            "value": 45.0
        }))
        .unwrap();
        assert_eq!(rule.rule, DealBreakerRule::Max { value: 45.0 });
        assert_eq!(violations(&[rule], &json!({"commute_minutes": 60})).len(), 1);
    }
}
