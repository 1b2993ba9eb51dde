//! Built-in diagnostic agent
//!
//! Walks a configurable number of steps so operators can watch the
//! checkpoint protocol (steps, heartbeats, pause, retries) end to end.
//!
//! Payload:
//! - `steps`: number of steps (default 3, max 100)
//! - `step_delay_ms`: sleep per step (default 0)
//! - `fail_attempts`: fail transiently while fewer attempts have failed
//! - `fatal`: fail fatally on the first step

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use super::output::AgentOutput;
use super::stepwise::StepwiseAgent;
use super::traits::{AgentError, AgentInput};
use crate::autonomy::ActionSpec;

const MAX_STEPS: u64 = 100;

pub struct ProbeAgent;

fn field_u64(payload: &Value, key: &str, default: u64) -> u64 {
    payload.get(key).and_then(Value::as_u64).unwrap_or(default)
}

#[async_trait]
impl StepwiseAgent for ProbeAgent {
    fn kind(&self) -> &str {
        "probe"
    }

    fn actions(&self) -> Vec<ActionSpec> {
        vec![ActionSpec::read("probe"), ActionSpec::write("probe_write")]
    }

    fn validate_payload(&self, _action: &str, payload: &Value) -> Result<(), String> {
        if !payload.is_object() && !payload.is_null() {
            return Err("probe payload must be an object".to_string());
        }
        if field_u64(payload, "steps", 3) > MAX_STEPS {
            return Err(format!("probe supports at most {} steps", MAX_STEPS));
        }
        Ok(())
    }

    fn plan(&self, input: &AgentInput) -> Vec<String> {
        let steps = field_u64(&input.payload, "steps", 3);
        (1..=steps).map(|i| format!("probe-{}", i)).collect()
    }

    async fn step(
        &self,
        step: &str,
        input: &AgentInput,
        state: &mut Value,
    ) -> Result<(), AgentError> {
        let payload = &input.payload;

        if payload.get("fatal").and_then(Value::as_bool).unwrap_or(false) {
            return Err(AgentError::Fatal("probe asked to fail fatally".to_string()));
        }
        if (input.attempt as u64) < field_u64(payload, "fail_attempts", 0) {
            return Err(AgentError::Transient(format!(
                "probe failing attempt {}",
                input.attempt
            )));
        }

        let delay = field_u64(payload, "step_delay_ms", 0);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let mut visited = state
            .get("visited")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        visited.push(json!(step));
        *state = json!({ "visited": visited });
        Ok(())
    }

    fn finish(&self, input: &AgentInput, state: Value) -> Result<AgentOutput, AgentError> {
        Ok(AgentOutput::new(
            &input.action,
            "diagnostic probe completed every planned step",
            1.0,
        )
        .with_data(state))
    }
}
