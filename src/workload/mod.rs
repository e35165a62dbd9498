//! Workload launch, pid discovery, and lifetime tracking

pub mod lifecycle;

pub use lifecycle::{wait_until_stable, WorkloadRun, WorkloadSpec};
