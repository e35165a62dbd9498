//! Benchmark workload lifecycle
//!
//! Encapsulates one run of the external benchmark driver: composing its
//! command line, launching it detached, discovering the workload's pid
//! through a handshake file, waiting for its thread population to stabilize,
//! and waiting for termination.
//!
//! The driver (`parsecmgmt`) forks the actual workload itself, so the child
//! we spawn is not the process we want to observe. The handshake file bridges
//! that gap: the driver writes the workload's pid into it once the workload
//! is up, and we poll it from this side.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{Result, SweepError};
use crate::record::fields;
use crate::system::privileged;

/// External benchmark driver executable
pub const DRIVER: &str = "parsecmgmt";

/// How long to poll the handshake file before giving up
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Backoff between handshake polls
pub const HANDSHAKE_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound on the thread-stability wait; generous because large thread
/// pools can take a while to spawn under contention
pub const STABILITY_TIMEOUT: Duration = Duration::from_secs(300);

/// Static description of one workload run
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    /// Benchmark package name
    pub package: String,
    /// Logical cores allocated to the workload
    pub cores: usize,
    /// Thread oversubscription ratio
    pub oversub: usize,
    /// Trial index among repeats of the same configuration
    pub trial: usize,
    /// NUMA node to allocate memory from
    pub numa_mem: u32,
    /// Run directory handed to the driver
    pub run_dir: PathBuf,
    /// Keep and reuse the unpacked run directory
    pub keep_dir: bool,
    /// Let the driver inherit stdout
    pub verbose: bool,
}

impl WorkloadSpec {
    /// Threads the workload is expected to spawn
    pub fn expected_threads(&self) -> usize {
        self.cores * self.oversub
    }

    /// Identifier encoding the run configuration, e.g. `dedup.C4.O2`;
    /// with `timestamped`, a filesystem-safe timestamp is appended for
    /// artifact naming.
    pub fn identifier(&self, timestamped: bool) -> String {
        let plain = format!("{}.C{}.O{}", self.package, self.cores, self.oversub);
        if timestamped {
            let ts = chrono::Local::now().format("%Y-%m-%dT%H-%M-%S");
            format!("{}.{}", plain, ts)
        } else {
            plain
        }
    }
}

/// Handle for a single detached workload run.
///
/// The resolved pid is cached and immutable once known; the stabilized flag
/// is monotonic. Both live on the handle, owned by the orchestrator for the
/// duration of the trial.
pub struct WorkloadRun {
    spec: WorkloadSpec,
    command: Vec<String>,
    handshake: Option<NamedTempFile>,
    child: Option<Child>,
    pid: Option<i32>,
    stabilized: bool,
    handshake_timeout: Duration,
    handshake_backoff: Duration,
}

impl WorkloadRun {
    /// Prepare a run: creates the handshake file and composes the driver
    /// command line. Nothing is spawned yet.
    pub fn new(spec: WorkloadSpec) -> Result<Self> {
        let handshake = NamedTempFile::new()
            .map_err(|e| SweepError::io(std::env::temp_dir(), e))?;

        let command = vec![
            DRIVER.to_string(),
            "-a".into(),
            "run".into(),
            "-p".into(),
            spec.package.clone(),
            "-i".into(),
            "native".into(),
            "-n".into(),
            format!("{}x", spec.oversub),
            "-C".into(),
            spec.cores.to_string(),
            "-d".into(),
            spec.run_dir.to_string_lossy().to_string(),
            "--numamem".into(),
            spec.numa_mem.to_string(),
            "--pid".into(),
            handshake.path().to_string_lossy().to_string(),
        ];

        let mut run = Self {
            spec,
            command,
            handshake: Some(handshake),
            child: None,
            pid: None,
            stabilized: false,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            handshake_backoff: HANDSHAKE_BACKOFF,
        };
        if run.spec.keep_dir {
            run.command.push("-k".into());
            run.command.push("--unpack".into());
        }
        Ok(run)
    }

    /// Override the handshake polling bounds (tests use tight ones)
    pub fn with_handshake_timing(mut self, timeout: Duration, backoff: Duration) -> Self {
        self.handshake_timeout = timeout;
        self.handshake_backoff = backoff;
        self
    }

    /// Wrap the workload entry point in `/usr/bin/time`, writing one raw
    /// comma-joined record to `temp`: the `ncores,nthreads,ntrial` prefix
    /// followed by the declared GNU time conversions.
    pub fn set_time_instrumentation(&mut self, temp: &Path) {
        let prefix = format!(
            "{},{},{}",
            self.spec.cores,
            self.spec.expected_threads(),
            self.spec.trial
        );
        let fmt = format!("{},{}", prefix, fields::gnu_time_format());
        let wrapper = format!("/usr/bin/time -o {} -f {}", temp.display(), fmt);
        self.command.push("-s".into());
        self.command.push(wrapper);
    }

    /// The composed driver argv
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Shell-ish rendition of the command for logs and dry runs
    pub fn command_line(&self) -> String {
        self.command
            .iter()
            .map(|arg| {
                if arg.contains(' ') {
                    format!("'{}'", arg)
                } else {
                    arg.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Spec this run was built from
    pub fn spec(&self) -> &WorkloadSpec {
        &self.spec
    }

    /// Launch the driver detached. Returns immediately; exactly one OS
    /// process is spawned.
    pub fn launch(&mut self) -> Result<()> {
        info!(command = %self.command_line(), "launching workload");
        let stdout = if self.spec.verbose {
            Stdio::inherit()
        } else {
            Stdio::null()
        };
        let child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .stdout(stdout)
            .spawn()
            .map_err(|e| SweepError::command(DRIVER, e.to_string()))?;
        self.child = Some(child);
        Ok(())
    }

    /// Poll the handshake file until it yields the workload pid.
    ///
    /// An empty or unparsable file means the driver has not written yet and
    /// is retried until the timeout. A pid that parses but is not live is a
    /// broken handshake, not a timing race: fatal, never retried. The result
    /// is cached for the handle's lifetime.
    pub fn resolve_pid(&mut self) -> Result<i32> {
        if let Some(pid) = self.pid {
            return Ok(pid);
        }
        let handshake = self
            .handshake
            .as_ref()
            .ok_or_else(|| SweepError::config("handshake file already released"))?;

        let deadline = Instant::now() + self.handshake_timeout;
        let pid = loop {
            let content = std::fs::read_to_string(handshake.path()).unwrap_or_default();
            if let Ok(pid) = content.trim().parse::<i32>() {
                break pid;
            }
            if Instant::now() >= deadline {
                return Err(SweepError::timeout(
                    self.handshake_timeout,
                    format!("handshake file {}", handshake.path().display()),
                ));
            }
            std::thread::sleep(self.handshake_backoff);
        };

        if !privileged::pid_is_alive(pid) {
            return Err(SweepError::ProcessNotFound(pid));
        }
        debug!(pid, package = %self.spec.package, "workload pid resolved");
        self.pid = Some(pid);
        Ok(pid)
    }

    /// Wait until the workload's kernel-thread count holds steady.
    ///
    /// Idempotent: once a handle has been marked stable it returns
    /// immediately. See [`wait_until_stable`] for the termination rule.
    pub fn wait_thread_count_stable(
        &mut self,
        poll_interval: Duration,
        stable_threshold: usize,
    ) -> Result<()> {
        if self.stabilized {
            return Ok(());
        }
        let pid = self.resolve_pid()?;
        let expected = self.spec.expected_threads();
        let package = self.spec.package.clone();

        let count = wait_until_stable(
            || Ok(privileged::tids_of_pid(pid)?.len()),
            poll_interval,
            stable_threshold,
            expected,
            STABILITY_TIMEOUT,
        )?;
        info!(pid, count, package = %package, "thread count considered stable");
        self.stabilized = true;
        Ok(())
    }

    /// Block until the driver terminates, then release the handshake file
    pub fn wait_for_exit(&mut self) -> Result<ExitStatus> {
        let mut child = self
            .child
            .take()
            .ok_or_else(|| SweepError::config("workload was never launched"))?;
        let status = child
            .wait()
            .map_err(|e| SweepError::command(DRIVER, e.to_string()))?;
        // Handshake files are never reused across handles
        self.handshake.take();
        debug!(?status, package = %self.spec.package, "workload exited");
        Ok(status)
    }
}

/// Generic stability wait over an injected thread counter.
///
/// Terminates only when BOTH hold: the count has been unchanged for
/// `stable_threshold` consecutive polls, AND the count has reached
/// `expected`. An unchanging but too-low count keeps waiting; it usually
/// means the pool is still spawning. Exceeding `bound` fails with
/// [`SweepError::Timeout`].
pub fn wait_until_stable(
    mut count_threads: impl FnMut() -> Result<usize>,
    poll_interval: Duration,
    stable_threshold: usize,
    expected: usize,
    bound: Duration,
) -> Result<usize> {
    let deadline = Instant::now() + bound;
    let mut last = count_threads()?;
    let mut run_length = 0usize;

    while run_length < stable_threshold || last < expected {
        if Instant::now() >= deadline {
            return Err(SweepError::timeout(
                bound,
                format!("{} threads to stabilize (have {})", expected, last),
            ));
        }
        std::thread::sleep(poll_interval);
        let current = count_threads()?;
        if current == last {
            run_length += 1;
        } else {
            debug!(threads = current, "waiting for thread count to stabilize");
            run_length = 0;
            last = current;
        }
    }
    Ok(last)
}
