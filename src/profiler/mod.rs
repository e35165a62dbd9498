//! External profiler attachment
//!
//! A profiler is anything that records alongside the workload as a separate
//! process. The supported set is fixed and known at compile time, so it is a
//! closed enum rather than an open hierarchy: a sampling counter recorder
//! (`perf stat record`), a scheduling-event recorder (`perf record`), a BPF
//! run-queue latency histogram (`runqlat`), and a diagnostic no-op.
//!
//! Each kind carries a default option map that caller-supplied JSON options
//! override; unknown keys pass through untouched. Recording tools run under
//! sudo, so every output artifact is chowned back to the invoking user.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use clap::ValueEnum;
use rand::seq::SliceRandom;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{Result, SweepError};
use crate::system::privileged;
use crate::workload::WorkloadRun;

/// perf binary, invoked through sudo
const PERF_BIN: &str = "/usr/bin/perf";

/// BCC runqlat binary
const RUNQLAT_BIN: &str = "/usr/sbin/runqlat";

/// Stability-wait parameters used before attaching tools that cannot follow
/// newly created threads
const STABILITY_POLL: Duration = Duration::from_secs(1);
const STABILITY_THRESHOLD: usize = 3;

/// The closed set of supported profilers
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilerKind {
    /// `perf stat record` over a sampled subset of the workload's threads
    #[value(name = "perfstat")]
    PerfStat,
    /// `perf record` of scheduling events for the whole process
    #[value(name = "perfsched")]
    PerfSched,
    /// BCC `runqlat` latency histogram, detached and stopped via SIGINT
    #[value(name = "runqlat-bcc")]
    RunqLat,
    /// Diagnostic no-op that only logs lifecycle milestones
    #[value(name = "dbg")]
    Debug,
}

impl ProfilerKind {
    /// Default option map for this kind
    pub fn default_options(&self) -> Map<String, Value> {
        let mut opts = Map::new();
        match self {
            Self::PerfStat => {
                // Percent of the thread set to sample; a plain number means
                // an absolute thread count instead
                opts.insert("sample-ratio".into(), Value::String("10%".into()));
            }
            Self::PerfSched => {
                // Events for `perf record -e`; empty list falls back to
                // `perf sched record`
                opts.insert(
                    "events".into(),
                    Value::Array(vec![Value::String("sched:sched_switch".into())]),
                );
            }
            Self::RunqLat | Self::Debug => {}
        }
        opts
    }

    /// One-line description for CLI help
    pub fn describe(&self) -> &'static str {
        match self {
            Self::PerfStat => "perf stat counters over a sampled thread subset",
            Self::PerfSched => "perf record of scheduler events (waits for thread stability)",
            Self::RunqLat => "BPF run-queue latency histogram, detached until stop",
            Self::Debug => "diagnostic no-op, logs pid and stability milestones",
        }
    }

    fn artifact_ext(&self) -> Option<&'static str> {
        match self {
            Self::PerfStat | Self::PerfSched => Some("perf.data"),
            Self::RunqLat => Some("runqlat.txt"),
            Self::Debug => None,
        }
    }
}

/// A configured profiler attachment for one trial.
///
/// `start` either blocks until the tool finishes on its own (perf variants,
/// which exit with the workload) or spawns a detached companion that `stop`
/// must interrupt (runqlat).
pub struct Profiler {
    kind: ProfilerKind,
    options: Map<String, Value>,
    companion: Option<Child>,
    artifact: Option<PathBuf>,
    started_at: Option<Instant>,
}

impl Profiler {
    /// Build a profiler from its kind defaults overlaid with caller options
    pub fn new(kind: ProfilerKind, overrides: &Map<String, Value>) -> Self {
        let mut options = kind.default_options();
        for (key, value) in overrides {
            options.insert(key.clone(), value.clone());
        }
        Self {
            kind,
            options,
            companion: None,
            artifact: None,
            started_at: None,
        }
    }

    /// Effective option map (defaults merged with overrides)
    pub fn options(&self) -> &Map<String, Value> {
        &self.options
    }

    /// Attach to a running workload
    pub fn start(&mut self, run: &mut WorkloadRun) -> Result<()> {
        self.started_at = Some(Instant::now());
        let artifact = self
            .kind
            .artifact_ext()
            .map(|ext| PathBuf::from(format!("{}.{}", run.spec().identifier(true), ext)));

        match self.kind {
            ProfilerKind::PerfStat => {
                let pid = run.resolve_pid()?;
                let tids = privileged::tids_of_pid(pid)?;
                let n = sample_size(self.options.get("sample-ratio"), tids.len())?;
                let sampled: Vec<i32> = if tids.len() > n {
                    tids.choose_multiple(&mut rand::thread_rng(), n)
                        .copied()
                        .collect()
                } else {
                    tids
                };
                let tid_list = sampled
                    .iter()
                    .map(|t| t.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                let artifact = artifact.expect("perfstat always names an artifact");
                info!(tids = %tid_list, artifact = %artifact.display(), "running perf stat record");

                let status = Command::new("sudo")
                    .arg(PERF_BIN)
                    .args(["stat", "record", "-e", "cs,instructions,inst_retired.any"])
                    .args(["-I100", "--quiet", "--per-thread"])
                    .arg("-o")
                    .arg(&artifact)
                    .args(["-t", &tid_list])
                    .status()
                    .map_err(|e| SweepError::command("sudo perf stat record", e.to_string()))?;
                if !status.success() {
                    return Err(SweepError::command("sudo perf stat record", status.to_string()));
                }
                privileged::chown_to_invoker(&artifact, false)?;
                self.artifact = Some(artifact);
            }

            ProfilerKind::PerfSched => {
                // perf will not follow threads created after attach, so the
                // population must be complete first
                run.wait_thread_count_stable(STABILITY_POLL, STABILITY_THRESHOLD)?;
                let pid = run.resolve_pid()?;
                let artifact = artifact.expect("perfsched always names an artifact");

                let mut cmd = Command::new("sudo");
                cmd.arg(PERF_BIN);
                let events = sched_events(self.options.get("events"));
                if events.is_empty() {
                    cmd.args(["sched", "record"]);
                } else {
                    cmd.arg("record");
                    for event in &events {
                        cmd.args(["-e", event]);
                    }
                }
                cmd.args(["-p", &pid.to_string()]).arg("-o").arg(&artifact);

                info!(pid, artifact = %artifact.display(), "running perf record");
                let status = cmd
                    .status()
                    .map_err(|e| SweepError::command("sudo perf record", e.to_string()))?;
                if !status.success() {
                    return Err(SweepError::command("sudo perf record", status.to_string()));
                }
                privileged::chown_to_invoker(&artifact, false)?;
                self.artifact = Some(artifact);
            }

            ProfilerKind::RunqLat => {
                if !Path::new(RUNQLAT_BIN).exists() {
                    return Err(SweepError::UnsupportedPlatform(format!(
                        "{} not installed",
                        RUNQLAT_BIN
                    )));
                }
                let pid = run.resolve_pid()?;
                let artifact = artifact.expect("runqlat always names an artifact");
                let output = std::fs::File::create(&artifact)
                    .map_err(|e| SweepError::io(&artifact, e))?;

                info!(pid, artifact = %artifact.display(), "starting detached runqlat");
                let child = Command::new("sudo")
                    .arg(RUNQLAT_BIN)
                    .args(["-p", &pid.to_string()])
                    .stdout(Stdio::from(output))
                    .spawn()
                    .map_err(|e| SweepError::command("sudo runqlat", e.to_string()))?;
                self.companion = Some(child);
                self.artifact = Some(artifact);
            }

            ProfilerKind::Debug => {
                let pid = run.resolve_pid()?;
                info!(pid, "dbg profiler: workload pid resolved");
                run.wait_thread_count_stable(STABILITY_POLL, STABILITY_THRESHOLD)?;
                info!(pid, "dbg profiler: thread population stable");
            }
        }
        Ok(())
    }

    /// Detach cleanly after the workload has exited.
    ///
    /// For the blocking kinds `start` has already returned with the recording
    /// complete, so this is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(mut child) = self.companion.take() {
            // The companion runs under sudo, so the interrupt must too
            privileged::kill(child.id(), "SIGINT")?;
            child
                .wait()
                .map_err(|e| SweepError::command("runqlat", e.to_string()))?;
            debug!("detached profiler stopped");
        }
        if self.kind == ProfilerKind::Debug {
            if let Some(started) = self.started_at {
                info!(elapsed = ?started.elapsed(), "dbg profiler: workload completed");
            }
        }
        Ok(())
    }

    /// The artifact this attachment produced, if any
    pub fn artifact(&self) -> Option<&Path> {
        self.artifact.as_deref()
    }
}

/// Resolve the `sample-ratio` option against a thread-set size: `"N%"`
/// means a fraction of the set, a bare number an absolute count.
fn sample_size(ratio: Option<&Value>, total: usize) -> Result<usize> {
    match ratio {
        Some(Value::String(s)) if s.ends_with('%') => {
            let pct: f64 = s[..s.len() - 1]
                .trim()
                .parse()
                .map_err(|_| SweepError::parse("sample-ratio", format!("bad percentage '{}'", s)))?;
            Ok((pct / 100.0 * total as f64) as usize)
        }
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| SweepError::parse("sample-ratio", format!("bad count '{}'", s))),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|v| v as usize)
            .ok_or_else(|| SweepError::parse("sample-ratio", format!("bad count '{}'", n))),
        Some(other) => Err(SweepError::parse(
            "sample-ratio",
            format!("unsupported value {}", other),
        )),
        None => Ok(total),
    }
}

/// Event list for `perf record -e`; anything non-string is ignored
fn sched_events(events: Option<&Value>) -> Vec<String> {
    match events {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}
