//! Configuration settings for ThreadSweep
//!
//! Defines the CLI surface and the runtime sweep configuration derived from
//! it. The sweep space is the cartesian product of the cores / oversub /
//! cgroup-cores lists, unioned with explicitly cherry-picked tuples.

use clap::{Parser, ValueEnum};
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::error::{Result, SweepError};
use crate::profiler::ProfilerKind;

/// ThreadSweep - thread-oversubscription sweep driver
#[derive(Parser, Debug, Clone)]
#[command(name = "threadsweep")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sweep benchmark workloads over thread oversubscription and CPU partitions")]
#[command(long_about = r#"
ThreadSweep drives controlled performance experiments against a PARSEC-style
benchmark driver. For every configuration in the sweep it launches the
workload, optionally partitions its threads across a threaded cgroup-v2
hierarchy, optionally attaches a profiler, and appends one CSV record.

Examples:
  threadsweep -p dedup -C 4,8 -S 1,2,4 -t -o sweep.csv
  threadsweep -p dedup,ferret -C 8 -S 4 --cgroup-cores 2,4 -r 3
  threadsweep -p dedup -C 4 -S 2 --profiler perfsched
"#)]
#[command(after_long_help = profiler_help())]
pub struct CliArgs {
    /// Comma-separated list of benchmark packages to run
    #[arg(short = 'p', long, required = true, value_delimiter = ',')]
    pub packages: Vec<String>,

    /// Comma-separated list of core counts to test
    #[arg(short = 'C', long, value_delimiter = ',')]
    pub cores: Vec<usize>,

    /// Comma-separated list of thread oversubscription ratios to test
    #[arg(short = 'S', long, value_delimiter = ',')]
    pub oversub: Vec<usize>,

    /// Cherry-picked (cores oversub cgroup-cores) tuples, e.g. "(1 4 0),(2 8 0)"
    #[arg(long)]
    pub cherrypick: Option<String>,

    /// Dump the commands without running anything
    #[arg(long)]
    pub dry_run: bool,

    /// NUMA node to allocate memory from (passed to the driver)
    #[arg(short = 'm', long, default_value_t = 0)]
    pub numamem: u32,

    /// Root directory for benchmark runs; expected to be a tmpfs mount
    #[arg(short = 'd', long, default_value = "/tmp/parsec_sweep")]
    pub rundir: PathBuf,

    /// Wrap runs in /usr/bin/time and emit one CSV record per trial
    #[arg(short = 't', long)]
    pub time_csv: bool,

    /// Temporary file holding the intermediate /usr/bin/time record
    #[arg(long, default_value = "/tmp/time.temp")]
    pub time_temp: PathBuf,

    /// Output CSV file for experiment results
    #[arg(short = 'o', long, default_value = "sweep.csv")]
    pub output: PathBuf,

    /// Repeated runs per configuration
    #[arg(short = 'r', long, default_value_t = 1)]
    pub ntrials: usize,

    /// Keep and reuse the unpacked run directory (passed to the driver)
    #[arg(short = 'k', long)]
    pub keepdir: bool,

    /// Let the driver inherit stdout
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Truncate the output CSV instead of appending
    #[arg(long)]
    pub truncate_output: bool,

    /// Profiler to attach to every trial
    #[arg(long, value_enum)]
    pub profiler: Option<ProfilerKind>,

    /// Extra profiler options as a JSON object, merged over the defaults
    #[arg(long, default_value = "{}")]
    pub profiler_args: String,

    /// Name of the delegated threaded-cgroup root
    #[arg(long, default_value = "threaded.test.cg")]
    pub cgroup_name: String,

    /// Cores per threaded sub-cgroup; 0 disables partitioning
    #[arg(long, value_delimiter = ',', default_value = "0")]
    pub cgroup_cores: Vec<usize>,
}

/// One explicitly enumerated sweep point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfTuple {
    /// Logical cores allocated
    pub cores: usize,
    /// Thread oversubscription ratio
    pub oversub: usize,
    /// Cores per sub-cgroup (0 = no partitioning)
    pub cores_per_group: usize,
}

/// Runtime configuration derived from CLI args
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Benchmark packages to sweep
    pub packages: Vec<String>,
    /// Core counts in the product
    pub cores: Vec<usize>,
    /// Oversubscription ratios in the product
    pub oversub: Vec<usize>,
    /// Cores-per-group values in the product
    pub cgroup_cores: Vec<usize>,
    /// Explicit sweep points unioned with the product
    pub cherry_picks: Vec<ConfTuple>,
    /// Trials per configuration
    pub ntrials: usize,
    /// NUMA memory node
    pub numa_mem: u32,
    /// Driver run directory
    pub run_dir: PathBuf,
    /// Keep run directory between runs
    pub keep_dir: bool,
    /// Verbose driver output
    pub verbose: bool,
    /// Print commands without running
    pub dry_run: bool,
    /// Capture raw /usr/bin/time records
    pub time_csv: bool,
    /// Intermediate raw-record file
    pub time_temp: PathBuf,
    /// Output CSV path
    pub output: PathBuf,
    /// Append to (rather than truncate) the output CSV
    pub append_output: bool,
    /// Profiler selection
    pub profiler: Option<ProfilerKind>,
    /// Profiler option overrides
    pub profiler_args: Map<String, Value>,
    /// Delegated cgroup root name
    pub cgroup_name: String,
}

impl SweepConfig {
    /// Build the runtime configuration from parsed CLI arguments
    pub fn from_cli(args: &CliArgs) -> Result<Self> {
        let profiler_args = match serde_json::from_str::<Value>(&args.profiler_args)? {
            Value::Object(map) => map,
            other => {
                return Err(SweepError::config(format!(
                    "--profiler-args must be a JSON object, got {}",
                    other
                )))
            }
        };

        let cherry_picks = match &args.cherrypick {
            Some(raw) => parse_cherry_picks(raw)?,
            None => Vec::new(),
        };

        if args.ntrials == 0 {
            return Err(SweepError::config("--ntrials must be at least 1"));
        }

        Ok(Self {
            packages: args.packages.clone(),
            cores: args.cores.clone(),
            oversub: args.oversub.clone(),
            cgroup_cores: args.cgroup_cores.clone(),
            cherry_picks,
            ntrials: args.ntrials,
            numa_mem: args.numamem,
            run_dir: args.rundir.clone(),
            keep_dir: args.keepdir,
            verbose: args.verbose,
            dry_run: args.dry_run,
            time_csv: args.time_csv,
            time_temp: args.time_temp.clone(),
            output: args.output.clone(),
            append_output: !args.truncate_output,
            profiler: args.profiler,
            profiler_args,
            cgroup_name: args.cgroup_name.clone(),
        })
    }
}

/// One line per supported profiler for the long-help epilog
fn profiler_help() -> String {
    let mut help = String::from("Profilers:\n");
    for kind in ProfilerKind::value_variants() {
        let name = kind
            .to_possible_value()
            .map(|v| v.get_name().to_string())
            .unwrap_or_default();
        help.push_str(&format!("  {:12} {}\n", name, kind.describe()));
    }
    help
}

/// Parse a cherry-picked configuration string like `(1 4 0),(2 8 0)` into
/// (cores, oversub, cores-per-group) tuples
pub fn parse_cherry_picks(raw: &str) -> Result<Vec<ConfTuple>> {
    raw.split(',')
        .map(|tuple| {
            let inner = tuple.trim().trim_start_matches('(').trim_end_matches(')');
            let parts: Vec<usize> = inner
                .split_whitespace()
                .map(|n| {
                    n.parse().map_err(|_| {
                        SweepError::config(format!("bad cherry-pick number '{}'", n))
                    })
                })
                .collect::<Result<_>>()?;
            match parts[..] {
                [cores, oversub, cores_per_group] => Ok(ConfTuple {
                    cores,
                    oversub,
                    cores_per_group,
                }),
                _ => Err(SweepError::config(format!(
                    "cherry-pick tuple '{}' must have exactly three numbers",
                    tuple
                ))),
            }
        })
        .collect()
}
