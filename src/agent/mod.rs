//! Agent contract and execution
//!
//! - `Agent`: what an agent implements (action catalog, payload check, `run`)
//! - `Checkpoint`: the cooperative suspension point handed to `run`
//! - `Stepwise`: adapter for agents expressed as ordered steps
//! - `AgentRunner`: one attempt under timeouts, heartbeats and kill signals
//! - `AgentRegistry`: kind → agent lookup

pub mod checkpoint;
pub mod output;
pub mod probe;
pub mod registry;
pub mod runner;
pub mod stepwise;
pub mod traits;

pub use checkpoint::Checkpoint;
pub use output::AgentOutput;
pub use probe::ProbeAgent;
pub use registry::AgentRegistry;
pub use runner::{AgentRunner, RunOutcome};
pub use stepwise::{Stepwise, StepwiseAgent};
pub use traits::{Agent, AgentError, AgentInput, Interrupt};
