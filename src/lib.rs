//! # ThreadSweep - Thread-Oversubscription Experiment Driver
//!
//! ThreadSweep drives controlled performance experiments against PARSEC-style
//! benchmark workloads on Linux. For every point in a declared sweep space it
//! launches the workload through the external benchmark driver, optionally
//! partitions the workload's threads across a threaded cgroup-v2 hierarchy,
//! optionally attaches a perf-family profiler, and appends one CSV metric
//! record per trial.
//!
//! ## Features
//!
//! - **Sweep Enumeration**: Cartesian product of cores, oversubscription
//!   ratios, and cgroup shapes, unioned with cherry-picked tuples
//! - **Threaded Cgroup Partitioning**: Idempotent cgroup-v2 setup with
//!   seeded, reproducible thread redistribution
//! - **Pid Discovery**: Handshake-file protocol with liveness probing
//! - **Profiler Attachment**: perf stat, perf sched, runqlat (BCC), debug
//! - **Metric Records**: Raw `/usr/bin/time` capture plus an ordered chain
//!   of deduced fields, streamed to CSV
//!
//! ## Quick Start
//!
//! ```no_run
//! use threadsweep::config::{CliArgs, SweepConfig};
//! use threadsweep::sweep::Orchestrator;
//! use clap::Parser;
//!
//! let args = CliArgs::parse_from(["threadsweep", "-p", "dedup", "-C", "4", "-S", "2", "-t"]);
//! let config = SweepConfig::from_cli(&args).unwrap();
//! Orchestrator::new(config).run().unwrap();
//! ```
//!
//! ## Cgroup Partitioning
//!
//! ```no_run
//! use threadsweep::cgroup::CgroupPartition;
//!
//! // 8 reserved cores split into groups of 2, memory from node 0
//! let partition = CgroupPartition::ensure("threaded.test.cg", 2, 8, 0).unwrap();
//! partition.track_pid(12345).unwrap();
//! partition.redistribute_threads(Some(42)).unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cgroup;
pub mod config;
pub mod error;
pub mod profiler;
pub mod record;
pub mod sweep;
pub mod system;
pub mod workload;

// Re-export commonly used types
pub use cgroup::CgroupPartition;
pub use config::{CliArgs, SweepConfig};
pub use error::{Result, SweepError};
pub use sweep::Orchestrator;
pub use workload::{WorkloadRun, WorkloadSpec};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
