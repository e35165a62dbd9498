//! Sweep orchestration: the control loop that drives trials end to end

pub mod orchestrator;

pub use orchestrator::{Orchestrator, Trial};
