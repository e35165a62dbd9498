//! Hierarchical threaded-cgroup CPU partitioning
//!
//! Reserves a set of cores under one delegated cgroup-v2 root and subdivides
//! them into equally sized sibling leaves, then redistributes a workload's
//! threads pseudo-randomly across those leaves.
//!
//! Setup is a fixed progression over the named root node:
//! absent -> root reserved -> controller enabled -> subtree ready ->
//! leaves provisioned. Every step is idempotent: control files are only
//! written when their current content differs from the target, so a converged
//! tree costs zero writes on repeat calls and the whole setup is safe to run
//! before every trial.
//!
//! Delegation rules:
//! 1. the root node sits directly under the cgroup-v2 mount;
//! 2. it is handed to the invoking non-root user via a one-time recursive
//!    chown, after which only `cgroup.procs` writes still need sudo.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::error::{IoResultExt, Result, SweepError};
use crate::system::topology;
use crate::system::privileged;

/// Default cgroup-v2 mount point
pub const CGROUP_BASE: &str = "/sys/fs/cgroup";

/// Name prefix for leaf sub-cgroups (`vnuma.00`, `vnuma.01`, ...)
pub const LEAF_PREFIX: &str = "vnuma";

/// Two zero-padded digits are reserved for the leaf sequence number
const MAX_LEAVES: usize = 100;

/// A provisioned threaded-cgroup partition: one delegated root pinned to a
/// core superset, with `num_groups` leaves pinned to disjoint slices of it.
pub struct CgroupPartition {
    root: PathBuf,
    num_groups: usize,
    leaf_names: Vec<String>,
    control_writes: u64,
}

impl CgroupPartition {
    /// Idempotent setup under the system cgroup mount, reserving
    /// `total_cores` cores from `numa_node` and slicing them into groups of
    /// `cores_per_group`.
    pub fn ensure(
        name: &str,
        cores_per_group: usize,
        total_cores: usize,
        numa_node: u32,
    ) -> Result<Self> {
        let cores = topology::cores_for_node(total_cores, numa_node)?;
        Self::ensure_at(Path::new(CGROUP_BASE), name, cores_per_group, &cores)
    }

    /// Setup against an explicit base directory and core list.
    ///
    /// The base is injectable so the whole state machine can run against a
    /// fake tree; production callers go through [`CgroupPartition::ensure`].
    pub fn ensure_at(
        base: &Path,
        name: &str,
        cores_per_group: usize,
        cores: &[u32],
    ) -> Result<Self> {
        let total_cores = cores.len();
        if cores_per_group == 0 || total_cores % cores_per_group != 0 {
            return Err(SweepError::InvalidConfiguration(format!(
                "{} cores cannot be split into groups of {}",
                total_cores, cores_per_group
            )));
        }
        let num_groups = total_cores / cores_per_group;
        if num_groups >= MAX_LEAVES {
            return Err(SweepError::InvalidConfiguration(format!(
                "{} leaf cgroups exceed the two-digit name limit",
                num_groups
            )));
        }

        let root = base.join(name);
        info!(
            root = %root.display(),
            num_groups,
            cores_per_group,
            "setting up threaded cgroup partition"
        );

        // Absent -> RootReserved: creation needs elevated rights, and the
        // fresh node is root-owned until handed over.
        if !root.exists() {
            privileged::mkdir(&root, true)?;
        }
        if !owned_by_invoker(&root)? {
            privileged::chown_to_invoker(&root, true)?;
        }

        let mut control_writes = 0u64;

        // RootReserved -> ControllerEnabled: the partitioning controller must
        // exist before anything else is worth doing.
        let controllers = read_trimmed(&root.join("cgroup.controllers"))?;
        if !controllers.split_whitespace().any(|c| c == "cpuset") {
            return Err(SweepError::UnsupportedPlatform(format!(
                "cpuset controller not available in {}",
                root.display()
            )));
        }
        control_writes += ensure_exact_content(&root.join("cgroup.subtree_control"), "+cpuset")?;

        // ControllerEnabled -> SubtreeReady: one scheduling domain across all
        // descendants, pinned to the reserved core superset.
        control_writes += ensure_exact_content(&root.join("cgroup.type"), "threaded")?;
        control_writes += ensure_exact_content(&root.join("cpuset.cpus"), &topology::join_ids(cores))?;

        // SubtreeReady -> LeavesProvisioned: each leaf takes a disjoint
        // contiguous slice of the root's cores.
        let leaf_names: Vec<String> = (0..num_groups)
            .map(|i| format!("{}.{:02}", LEAF_PREFIX, i))
            .collect();
        for (i, leaf_name) in leaf_names.iter().enumerate() {
            let leaf = root.join(leaf_name);
            if !leaf.exists() {
                std::fs::create_dir(&leaf).with_path(&leaf)?;
            }
            control_writes += ensure_exact_content(&leaf.join("cgroup.type"), "threaded")?;
            let slice = &cores[i * cores_per_group..(i + 1) * cores_per_group];
            control_writes += ensure_exact_content(&leaf.join("cpuset.cpus"), &topology::join_ids(slice))?;
        }

        // A previous run with more groups leaves stale siblings behind
        remove_stale_leaves(&root, &leaf_names)?;

        debug!(control_writes, "cgroup partition converged");
        Ok(Self {
            root,
            num_groups,
            leaf_names,
            control_writes,
        })
    }

    /// Path of the delegated root node
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of leaf sub-cgroups
    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    /// Leaf node names in slice order
    pub fn leaf_names(&self) -> &[String] {
        &self.leaf_names
    }

    /// Control-file writes performed during setup; zero when the tree was
    /// already converged
    pub fn control_writes(&self) -> u64 {
        self.control_writes
    }

    /// Move a process into the root node's membership file.
    ///
    /// `cgroup.procs` stays root-writable even on a delegated node, hence the
    /// privileged write.
    pub fn track_pid(&self, pid: i32) -> Result<()> {
        privileged::tee(&self.root.join("cgroup.procs"), &pid.to_string())
    }

    /// Shuffle the root's current thread set across the leaves.
    ///
    /// Reads the full thread-id set fresh on every call, so a later call
    /// picks up threads spawned since the last one and fully re-shuffles.
    /// Returns the seed in use (given or freshly drawn) for reproducibility;
    /// it is also logged.
    pub fn redistribute_threads(&self, seed: Option<u64>) -> Result<u64> {
        let threads_path = self.root.join("cgroup.threads");
        let mut tids: Vec<i32> = read_trimmed(&threads_path)?
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                l.trim()
                    .parse()
                    .map_err(|_| SweepError::parse("cgroup.threads", format!("bad tid '{}'", l)))
            })
            .collect::<Result<_>>()?;

        let seed = seed.unwrap_or_else(|| rand::thread_rng().gen());
        info!(
            n_threads = tids.len(),
            num_groups = self.num_groups,
            seed,
            "redistributing threads across threaded cgroups"
        );

        let mut rng = StdRng::seed_from_u64(seed);
        tids.shuffle(&mut rng);

        for (leaf_name, chunk) in self
            .leaf_names
            .iter()
            .zip(split_nearly_equal(&tids, self.num_groups))
        {
            let leaf_threads = self.root.join(leaf_name).join("cgroup.threads");
            // The interface accepts only one id per write call, so each tid
            // goes through its own unbuffered write.
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .open(&leaf_threads)
                .with_path(&leaf_threads)?;
            for tid in chunk {
                file.write_all(format!("{}\n", tid).as_bytes())
                    .with_path(&leaf_threads)?;
            }
        }
        Ok(seed)
    }
}

/// Split a slice into `n` nearly-equal contiguous chunks.
///
/// The first `len % n` chunks carry one extra element, so chunk sizes never
/// differ by more than one and every element lands in exactly one chunk.
pub fn split_nearly_equal<'a, T>(items: &'a [T], n: usize) -> Vec<&'a [T]> {
    assert!(n > 0, "cannot split into zero chunks");
    let base = items.len() / n;
    let extra = items.len() % n;
    let mut chunks = Vec::with_capacity(n);
    let mut offset = 0;
    for i in 0..n {
        let len = base + usize::from(i < extra);
        chunks.push(&items[offset..offset + len]);
        offset += len;
    }
    chunks
}

/// Read-compare-write for one control file: write only when the current
/// content (trimmed; the kernel appends a newline) differs from the target.
/// Returns how many writes were performed (0 or 1).
fn ensure_exact_content(path: &Path, content: &str) -> Result<u64> {
    let current = match std::fs::read_to_string(path) {
        Ok(s) => Some(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(SweepError::io(path, e)),
    };
    if current.as_deref().map(str::trim) == Some(content) {
        return Ok(0);
    }
    std::fs::write(path, content).with_path(path)?;
    Ok(1)
}

/// Drop `vnuma.*` siblings that are not part of the current target set
fn remove_stale_leaves(root: &Path, keep: &[String]) -> Result<()> {
    let prefix = format!("{}.", LEAF_PREFIX);
    for entry in std::fs::read_dir(root).with_path(root)? {
        let entry = entry.with_path(root)?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(&prefix) && !keep.iter().any(|k| *k == name) {
            debug!(leaf = %name, "removing stale leaf cgroup");
            // cgroupfs directories rmdir clean even though interface files
            // appear inside them; an ordinary directory needs the full removal
            if std::fs::remove_dir(entry.path()).is_err() {
                std::fs::remove_dir_all(entry.path()).with_path(entry.path())?;
            }
        }
    }
    Ok(())
}

fn read_trimmed(path: &Path) -> Result<String> {
    Ok(std::fs::read_to_string(path)
        .with_path(path)?
        .trim()
        .to_string())
}

#[cfg(unix)]
fn owned_by_invoker(path: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(path).with_path(path)?;
    Ok(meta.uid() == nix::unistd::getuid().as_raw() && meta.gid() == nix::unistd::getgid().as_raw())
}

#[cfg(not(unix))]
fn owned_by_invoker(_path: &Path) -> Result<bool> {
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    /// Build a fake delegated root the way the kernel would present it
    fn fake_root(base: &Path, name: &str, controllers: &str) -> PathBuf {
        let root = base.join(name);
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("cgroup.controllers"), controllers).unwrap();
        root
    }

    fn leaf_cores(root: &Path, leaf: &str) -> Vec<u32> {
        std::fs::read_to_string(root.join(leaf).join("cpuset.cpus"))
            .unwrap()
            .trim()
            .split(',')
            .map(|c| c.parse().unwrap())
            .collect()
    }

    #[test]
    fn test_ensure_provisions_disjoint_covering_leaves() {
        let tmp = tempfile::tempdir().unwrap();
        fake_root(tmp.path(), "sweep.cg", "cpuset cpu memory");
        let cores: Vec<u32> = (0..8).collect();

        let cg = CgroupPartition::ensure_at(tmp.path(), "sweep.cg", 2, &cores).unwrap();
        assert_eq!(cg.num_groups(), 4);

        let mut seen = BTreeSet::new();
        for (i, leaf) in cg.leaf_names().iter().enumerate() {
            let slice = leaf_cores(cg.root(), leaf);
            assert_eq!(slice, vec![2 * i as u32, 2 * i as u32 + 1]);
            for c in slice {
                assert!(seen.insert(c), "core {} pinned to two leaves", c);
            }
        }
        assert_eq!(seen, cores.iter().copied().collect());

        // Root metadata
        let root = cg.root();
        assert_eq!(
            std::fs::read_to_string(root.join("cgroup.type")).unwrap(),
            "threaded"
        );
        assert_eq!(
            std::fs::read_to_string(root.join("cgroup.subtree_control")).unwrap(),
            "+cpuset"
        );
        assert_eq!(
            std::fs::read_to_string(root.join("cpuset.cpus")).unwrap(),
            "0,1,2,3,4,5,6,7"
        );
    }

    #[test]
    fn test_ensure_second_call_is_write_free() {
        let tmp = tempfile::tempdir().unwrap();
        fake_root(tmp.path(), "sweep.cg", "cpuset");
        let cores: Vec<u32> = (0..4).collect();

        let first = CgroupPartition::ensure_at(tmp.path(), "sweep.cg", 2, &cores).unwrap();
        assert!(first.control_writes() > 0);

        let second = CgroupPartition::ensure_at(tmp.path(), "sweep.cg", 2, &cores).unwrap();
        assert_eq!(second.control_writes(), 0);
    }

    #[test]
    fn test_ensure_removes_stale_leaves_on_shrink() {
        let tmp = tempfile::tempdir().unwrap();
        fake_root(tmp.path(), "sweep.cg", "cpuset");
        let cores: Vec<u32> = (0..8).collect();

        let wide = CgroupPartition::ensure_at(tmp.path(), "sweep.cg", 2, &cores).unwrap();
        assert_eq!(wide.num_groups(), 4);

        let narrow = CgroupPartition::ensure_at(tmp.path(), "sweep.cg", 4, &cores).unwrap();
        assert_eq!(narrow.num_groups(), 2);
        assert!(narrow.root().join("vnuma.00").exists());
        assert!(narrow.root().join("vnuma.01").exists());
        assert!(!narrow.root().join("vnuma.02").exists());
        assert!(!narrow.root().join("vnuma.03").exists());
    }

    #[test]
    fn test_ensure_rejects_uneven_split() {
        let tmp = tempfile::tempdir().unwrap();
        fake_root(tmp.path(), "sweep.cg", "cpuset");
        let cores: Vec<u32> = (0..8).collect();
        assert!(matches!(
            CgroupPartition::ensure_at(tmp.path(), "sweep.cg", 3, &cores),
            Err(SweepError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_ensure_rejects_too_many_leaves() {
        let tmp = tempfile::tempdir().unwrap();
        fake_root(tmp.path(), "sweep.cg", "cpuset");
        let cores: Vec<u32> = (0..100).collect();
        assert!(matches!(
            CgroupPartition::ensure_at(tmp.path(), "sweep.cg", 1, &cores),
            Err(SweepError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_ensure_fails_without_cpuset_controller() {
        let tmp = tempfile::tempdir().unwrap();
        fake_root(tmp.path(), "sweep.cg", "cpu memory io");
        let cores: Vec<u32> = (0..4).collect();
        assert!(matches!(
            CgroupPartition::ensure_at(tmp.path(), "sweep.cg", 2, &cores),
            Err(SweepError::UnsupportedPlatform(_))
        ));
    }

    #[test]
    fn test_redistribute_preserves_thread_set() {
        let tmp = tempfile::tempdir().unwrap();
        fake_root(tmp.path(), "sweep.cg", "cpuset");
        let cores: Vec<u32> = (0..4).collect();
        let cg = CgroupPartition::ensure_at(tmp.path(), "sweep.cg", 2, &cores).unwrap();

        let tids: Vec<i32> = (1000..1011).collect();
        let joined: String = tids.iter().map(|t| format!("{}\n", t)).collect();
        std::fs::write(cg.root().join("cgroup.threads"), joined).unwrap();

        cg.redistribute_threads(Some(42)).unwrap();

        let mut collected = Vec::new();
        let mut sizes = Vec::new();
        for leaf in cg.leaf_names() {
            let content =
                std::fs::read_to_string(cg.root().join(leaf).join("cgroup.threads")).unwrap();
            let chunk: Vec<i32> = content.lines().map(|l| l.parse().unwrap()).collect();
            sizes.push(chunk.len());
            collected.extend(chunk);
        }
        collected.sort_unstable();
        assert_eq!(collected, tids);
        let (min, max) = (sizes.iter().min().unwrap(), sizes.iter().max().unwrap());
        assert!(max - min <= 1, "chunk sizes {:?} differ by more than 1", sizes);
    }

    #[test]
    fn test_redistribute_same_seed_is_reproducible() {
        let tmp = tempfile::tempdir().unwrap();
        fake_root(tmp.path(), "sweep.cg", "cpuset");
        let cores: Vec<u32> = (0..4).collect();
        let cg = CgroupPartition::ensure_at(tmp.path(), "sweep.cg", 2, &cores).unwrap();

        let joined: String = (500..520).map(|t| format!("{}\n", t)).collect();
        std::fs::write(cg.root().join("cgroup.threads"), &joined).unwrap();

        let leaf_snapshot = |cg: &CgroupPartition| -> Vec<String> {
            cg.leaf_names()
                .iter()
                .map(|l| std::fs::read_to_string(cg.root().join(l).join("cgroup.threads")).unwrap())
                .collect()
        };

        let seed = cg.redistribute_threads(Some(7)).unwrap();
        assert_eq!(seed, 7);
        let first = leaf_snapshot(&cg);

        // Clear leaf files and replay with the same seed
        for leaf in cg.leaf_names() {
            std::fs::write(cg.root().join(leaf).join("cgroup.threads"), "").unwrap();
        }
        cg.redistribute_threads(Some(7)).unwrap();
        assert_eq!(leaf_snapshot(&cg), first);
    }

    proptest! {
        #[test]
        fn prop_split_nearly_equal(len in 0usize..200, n in 1usize..20) {
            let items: Vec<usize> = (0..len).collect();
            let chunks = split_nearly_equal(&items, n);
            prop_assert_eq!(chunks.len(), n);

            let sizes: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
            let min = sizes.iter().min().unwrap();
            let max = sizes.iter().max().unwrap();
            prop_assert!(max - min <= 1);

            let rejoined: Vec<usize> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
            prop_assert_eq!(rejoined, items);
        }

        #[test]
        fn prop_ensure_partitions_exactly(per in 1usize..5, groups in 1usize..7) {
            let tmp = tempfile::tempdir().unwrap();
            fake_root(tmp.path(), "sweep.cg", "cpuset");
            let cores: Vec<u32> = (0..(per * groups) as u32).collect();

            let cg = CgroupPartition::ensure_at(tmp.path(), "sweep.cg", per, &cores).unwrap();
            prop_assert_eq!(cg.num_groups(), groups);

            let mut union = BTreeSet::new();
            for leaf in cg.leaf_names() {
                for c in leaf_cores(cg.root(), leaf) {
                    prop_assert!(union.insert(c));
                }
            }
            prop_assert_eq!(union, cores.iter().copied().collect::<BTreeSet<_>>());
        }
    }
}
