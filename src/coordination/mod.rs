//! Coordination Layer
//!
//! Per-user emergency brake shared by the scheduler, the agent runners and
//! the sweep.

pub mod brake;

pub use brake::{BrakeRegistry, OverduePause};
