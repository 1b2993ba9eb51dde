pub mod agent;
pub mod api;
pub mod approval;
pub mod autonomy;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod events;
pub mod persistence;
pub mod scheduler;

pub use agent::{
    Agent, AgentError, AgentInput, AgentOutput, AgentRegistry, Checkpoint, ProbeAgent, Stepwise,
    StepwiseAgent,
};
pub use approval::{ApprovalError, ApprovalQueue, BatchOutcome};
pub use autonomy::{ActionSpec, AutonomyGate, AutonomyTier, DealBreaker, Decision, DecisionReason};
pub use config::AppConfig;
pub use coordination::BrakeRegistry;
pub use error::{JobPilotError, Result};
pub use events::{ActivityPublisher, ActivityStream};
pub use persistence::{MemoryStore, PostgresStore, Store};
pub use scheduler::{
    ApprovalResolution, Scheduler, SchedulerStats, SubmitOutcome, SubmitRequest, SweepReport,
    Sweeper,
};
