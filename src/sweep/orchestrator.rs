//! Experiment sweep orchestration
//!
//! The top-level control loop. One control thread drives everything; the
//! workload and any profiler run as independent OS processes observed by
//! polling. Trials are strictly sequential because they compete for the same
//! fixed core reservation.
//!
//! Per-trial ordering is load-bearing: partition setup precedes pid tracking,
//! which precedes the stability wait, which precedes thread redistribution,
//! which precedes profiler start. Reordering any of these would let threads
//! escape the intended affinity group or let the profiler miss threads.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::cgroup::CgroupPartition;
use crate::config::{ConfTuple, SweepConfig};
use crate::error::{IoResultExt, Result, SweepError};
use crate::profiler::Profiler;
use crate::record::{deductive, CsvSink, MetricRecord};
use crate::workload::{WorkloadRun, WorkloadSpec};

/// Poll interval for the thread-stability wait
const STABILITY_POLL: Duration = Duration::from_secs(1);

/// Consecutive unchanged polls required for stability
const STABILITY_THRESHOLD: usize = 3;

/// One scheduled trial: a package, a sweep point, and a trial index
pub type Trial = (String, ConfTuple, usize);

/// Drives the whole sweep; owns the partition-manager cache so managers are
/// reused across trials of the same shape instead of being torn down and
/// rebuilt between repeats.
pub struct Orchestrator {
    config: SweepConfig,
    partitions: HashMap<(usize, usize), CgroupPartition>,
}

impl Orchestrator {
    /// Build an orchestrator over a validated configuration
    pub fn new(config: SweepConfig) -> Self {
        Self {
            config,
            partitions: HashMap::new(),
        }
    }

    /// Run the full sweep. Trial-scoped failures are logged and skipped;
    /// platform-level failures propagate and abort.
    pub fn run(&mut self) -> Result<()> {
        if self.config.time_csv && self.config.profiler.is_some() {
            // Both wrap the workload entry point; they cannot coexist
            warn!("profiling requested; raw /usr/bin/time capture is disabled for this sweep");
        }
        if !self.config.dry_run {
            ensure_run_dir(&self.config.run_dir, self.config.numa_mem)?;
        }

        let emit_records =
            self.config.time_csv && self.config.profiler.is_none() && !self.config.dry_run;
        let mut sink = if emit_records {
            Some(CsvSink::open(&self.config.output, self.config.append_output)?)
        } else {
            None
        };

        let trials = self.enumerate();
        info!(n_trials = trials.len(), "starting sweep");

        for (package, conf, trial) in trials {
            match self.run_trial(&package, conf, trial, sink.as_mut()) {
                Ok(()) => {}
                Err(e) if e.is_trial_scoped() => {
                    warn!(
                        package = %package,
                        cores = conf.cores,
                        oversub = conf.oversub,
                        cores_per_group = conf.cores_per_group,
                        trial,
                        error = %e,
                        "trial failed; continuing sweep"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// The declared sweep space: cherry-picked tuples unioned with the
    /// cartesian product of the explicit lists, crossed with packages and
    /// trial indices. Duplicates are permitted and simply re-run.
    pub fn enumerate(&self) -> Vec<Trial> {
        let mut confs: Vec<ConfTuple> = self.config.cherry_picks.clone();
        for &cores in &self.config.cores {
            for &oversub in &self.config.oversub {
                for &cores_per_group in &self.config.cgroup_cores {
                    confs.push(ConfTuple {
                        cores,
                        oversub,
                        cores_per_group,
                    });
                }
            }
        }

        let mut trials = Vec::new();
        for package in &self.config.packages {
            for conf in &confs {
                for trial in 0..self.config.ntrials {
                    trials.push((package.clone(), *conf, trial));
                }
            }
        }
        trials
    }

    fn run_trial(
        &mut self,
        package: &str,
        conf: ConfTuple,
        trial: usize,
        sink: Option<&mut CsvSink<BufWriter<File>>>,
    ) -> Result<()> {
        if invalid_shape(conf) {
            warn!(
                package = %package,
                cores = conf.cores,
                oversub = conf.oversub,
                cores_per_group = conf.cores_per_group,
                "skipping invalid configuration (cores_per_group >= cores)"
            );
            return Ok(());
        }

        let capture_timing = self.config.time_csv && self.config.profiler.is_none();
        let mut run = WorkloadRun::new(WorkloadSpec {
            package: package.to_string(),
            cores: conf.cores,
            oversub: conf.oversub,
            trial,
            numa_mem: self.config.numa_mem,
            run_dir: self.config.run_dir.clone(),
            keep_dir: self.config.keep_dir,
            verbose: self.config.verbose,
        })?;
        if capture_timing {
            run.set_time_instrumentation(&self.config.time_temp);
        }

        if self.config.dry_run {
            println!("Dry run: {}", run.command_line());
            return Ok(());
        }

        // Partition managers are reused across trials of the same shape
        let partition = if conf.cores_per_group > 0 {
            let key = (conf.cores_per_group, conf.cores);
            if !self.partitions.contains_key(&key) {
                let partition = CgroupPartition::ensure(
                    &self.config.cgroup_name,
                    conf.cores_per_group,
                    conf.cores,
                    self.config.numa_mem,
                )?;
                self.partitions.insert(key, partition);
            }
            self.partitions.get(&key)
        } else {
            None
        };

        run.launch()?;

        if let Some(partition) = partition {
            let pid = run.resolve_pid()?;
            partition.track_pid(pid)?;
            run.wait_thread_count_stable(STABILITY_POLL, STABILITY_THRESHOLD)?;
            partition.redistribute_threads(None)?;
        }

        let mut profiler = self
            .config
            .profiler
            .map(|kind| Profiler::new(kind, &self.config.profiler_args));
        if let Some(profiler) = profiler.as_mut() {
            profiler.start(&mut run)?;
        }

        run.wait_for_exit()?;

        if let Some(profiler) = profiler.as_mut() {
            profiler.stop()?;
        }

        if capture_timing {
            if let Some(sink) = sink {
                let raw = std::fs::read_to_string(&self.config.time_temp)
                    .with_path(&self.config.time_temp)?;
                let mut record = MetricRecord::from_raw_line(raw.trim());
                deductive::apply_all(&mut record)?;
                sink.write_record(&record)?;
            }
        }
        Ok(())
    }
}

/// A sweep point whose partition size cannot fit inside its core allocation
fn invalid_shape(conf: ConfTuple) -> bool {
    conf.cores_per_group >= conf.cores
}

/// Create the run directory and verify it is the tmpfs mount the benchmark
/// expects, with a memory policy compatible with the requested NUMA node
fn ensure_run_dir(run_dir: &Path, numa_mem: u32) -> Result<()> {
    std::fs::create_dir_all(run_dir).with_path(run_dir)?;

    let output = Command::new("findmnt")
        .arg("-J")
        .arg(run_dir)
        .output()
        .map_err(|e| SweepError::command("findmnt", e.to_string()))?;
    if !output.status.success() {
        return Err(SweepError::config(format!(
            "run directory {} is not a mount point; a tmpfs mount is expected",
            run_dir.display()
        )));
    }
    check_mount_record(&String::from_utf8_lossy(&output.stdout), run_dir, numa_mem)
}

/// Validate one `findmnt -J` document against the run-directory expectations
fn check_mount_record(json: &str, run_dir: &Path, numa_mem: u32) -> Result<()> {
    #[derive(Deserialize)]
    struct FindMnt {
        filesystems: Vec<Mount>,
    }
    #[derive(Deserialize)]
    struct Mount {
        fstype: String,
        options: String,
    }

    let parsed: FindMnt = serde_json::from_str(json)?;
    let mount = parsed
        .filesystems
        .first()
        .ok_or_else(|| SweepError::config("findmnt reported no filesystems"))?;

    if mount.fstype != "tmpfs" {
        return Err(SweepError::config(format!(
            "run directory {} is {} but a tmpfs mount is expected",
            run_dir.display(),
            mount.fstype
        )));
    }
    for option in mount.options.split(',') {
        if let Some((key, value)) = option.split_once('=') {
            if key == "mpol" && value != format!("bind:{}", numa_mem) {
                return Err(SweepError::config(format!(
                    "tmpfs option {} conflicts with NUMA memory node {}",
                    option, numa_mem
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn config(argv: &[&str]) -> SweepConfig {
        let mut full = vec!["threadsweep"];
        full.extend_from_slice(argv);
        SweepConfig::from_cli(&crate::config::CliArgs::parse_from(full)).unwrap()
    }

    #[test]
    fn test_enumerate_product() {
        let orch = Orchestrator::new(config(&[
            "-p", "dedup", "-C", "2,4", "-S", "1,2", "-r", "3",
        ]));
        // 2 cores x 2 oversub x 1 cgroup-cores x 3 trials
        let trials = orch.enumerate();
        assert_eq!(trials.len(), 12);
        assert!(trials.iter().all(|(p, _, _)| p == "dedup"));
        assert_eq!(trials.iter().filter(|(_, _, t)| *t == 2).count(), 4);
    }

    #[test]
    fn test_enumerate_unions_cherry_picks_and_permits_duplicates() {
        let orch = Orchestrator::new(config(&[
            "-p",
            "dedup",
            "-C",
            "4",
            "-S",
            "2",
            "--cherrypick",
            "(4 2 0),(8 4 2)",
        ]));
        let trials = orch.enumerate();
        // Cherry-picks first, then the product; (4,2,0) appears twice
        assert_eq!(trials.len(), 3);
        let shapes: Vec<ConfTuple> = trials.iter().map(|(_, c, _)| *c).collect();
        assert_eq!(
            shapes
                .iter()
                .filter(|c| c.cores == 4 && c.oversub == 2 && c.cores_per_group == 0)
                .count(),
            2
        );
        assert_eq!(shapes[1].cores, 8);
    }

    #[test]
    fn test_enumerate_crosses_packages() {
        let orch = Orchestrator::new(config(&["-p", "dedup,ferret", "-C", "4", "-S", "2"]));
        let trials = orch.enumerate();
        assert_eq!(trials.len(), 2);
        assert_eq!(trials[0].0, "dedup");
        assert_eq!(trials[1].0, "ferret");
    }

    #[test]
    fn test_invalid_shape_guard() {
        let shape = |cores, cores_per_group| ConfTuple {
            cores,
            oversub: 2,
            cores_per_group,
        };
        assert!(invalid_shape(shape(4, 4)));
        assert!(invalid_shape(shape(4, 8)));
        assert!(!invalid_shape(shape(4, 2)));
        // Partitioning disabled is always a valid shape
        assert!(!invalid_shape(shape(4, 0)));
    }

    #[test]
    fn test_check_mount_record_accepts_bound_tmpfs() {
        let json = r#"{"filesystems":[{"target":"/tmp/parsec_sweep","source":"tmpfs",
            "fstype":"tmpfs","options":"rw,relatime,mpol=bind:0"}]}"#;
        check_mount_record(json, Path::new("/tmp/parsec_sweep"), 0).unwrap();
    }

    #[test]
    fn test_check_mount_record_accepts_tmpfs_without_mpol() {
        let json = r#"{"filesystems":[{"fstype":"tmpfs","options":"rw,relatime,size=8g"}]}"#;
        check_mount_record(json, Path::new("/tmp/parsec_sweep"), 0).unwrap();
    }

    #[test]
    fn test_check_mount_record_rejects_non_tmpfs() {
        let json = r#"{"filesystems":[{"fstype":"ext4","options":"rw,relatime"}]}"#;
        assert!(check_mount_record(json, Path::new("/tmp/x"), 0).is_err());
    }

    #[test]
    fn test_check_mount_record_rejects_conflicting_mpol() {
        let json = r#"{"filesystems":[{"fstype":"tmpfs","options":"rw,mpol=bind:1"}]}"#;
        assert!(check_mount_record(json, Path::new("/tmp/x"), 0).is_err());
    }

    #[test]
    fn test_dry_run_trial_spawns_nothing() {
        let mut orch = Orchestrator::new(config(&["-p", "dedup", "-C", "4", "-S", "2", "--dry-run"]));
        let conf = ConfTuple {
            cores: 4,
            oversub: 2,
            cores_per_group: 0,
        };
        // No driver binary exists in the test environment; dry run must still
        // succeed because nothing is launched and no cgroup is touched.
        orch.run_trial("dedup", conf, 0, None).unwrap();
        assert!(orch.partitions.is_empty());
    }
}
