//! ThreadSweep CLI - Thread-Oversubscription Experiment Driver
//!
//! Sweeps benchmark workloads over thread counts, oversubscription ratios,
//! and threaded-cgroup partitions, recording one CSV row per trial.

use clap::Parser;
use threadsweep::config::{CliArgs, SweepConfig};
use threadsweep::error::Result;
use threadsweep::sweep::Orchestrator;
use tracing_subscriber::EnvFilter;

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    // Parse CLI arguments
    let args = CliArgs::parse();

    // Handle result
    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: CliArgs) -> Result<()> {
    let config = SweepConfig::from_cli(&args)?;

    let product_empty = config.cores.is_empty() || config.oversub.is_empty();
    if product_empty && config.cherry_picks.is_empty() {
        eprintln!("Usage: threadsweep -p <PACKAGES> -C <CORES> -S <OVERSUB> [OPTIONS]");
        eprintln!("       threadsweep --help for more information");
        std::process::exit(1);
    }

    Orchestrator::new(config).run()
}
