//! Adapter from an ordered list of steps to the `Agent` contract
//!
//! Before each step the brake, kill and soft-timeout signals are checked;
//! after it the checkpoint gets `{completed_steps, state}`, which is also
//! what a later attempt resumes from.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::checkpoint::Checkpoint;
use super::output::AgentOutput;
use super::traits::{Agent, AgentError, AgentInput};
use crate::autonomy::ActionSpec;

#[async_trait]
pub trait StepwiseAgent: Send + Sync {
    fn kind(&self) -> &str;

    fn actions(&self) -> Vec<ActionSpec>;

    fn validate_payload(&self, _action: &str, _payload: &Value) -> Result<(), String> {
        Ok(())
    }

    /// Ordered step names for this input
    fn plan(&self, input: &AgentInput) -> Vec<String>;

    /// Run one step, updating the carried state
    async fn step(&self, step: &str, input: &AgentInput, state: &mut Value)
        -> Result<(), AgentError>;

    /// Build the output once every step is done
    fn finish(&self, input: &AgentInput, state: Value) -> Result<AgentOutput, AgentError>;
}

pub struct Stepwise<A>(pub A);

fn resume_point(resume_from: Option<&Value>) -> (usize, Value) {
    match resume_from {
        Some(saved) => (
            saved
                .get("completed_steps")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize,
            saved.get("state").cloned().unwrap_or_else(|| json!({})),
        ),
        None => (0, json!({})),
    }
}

#[async_trait]
impl<A: StepwiseAgent> Agent for Stepwise<A> {
    fn kind(&self) -> &str {
        self.0.kind()
    }

    fn actions(&self) -> Vec<ActionSpec> {
        self.0.actions()
    }

    fn validate_payload(&self, action: &str, payload: &Value) -> Result<(), String> {
        self.0.validate_payload(action, payload)
    }

    async fn run(
        &self,
        input: AgentInput,
        checkpoint: &mut Checkpoint,
    ) -> Result<AgentOutput, AgentError> {
        let steps = self.0.plan(&input);
        let (mut completed, mut state) = resume_point(input.resume_from.as_ref());

        for step in steps.iter().skip(completed) {
            checkpoint.check()?;
            self.0.step(step, &input, &mut state).await?;
            completed += 1;
            checkpoint
                .reached(step, json!({ "completed_steps": completed, "state": state }))
                .await;
        }

        self.0.finish(&input, state)
    }
}
