//! CPU core topology queries for NUMA-aware core reservation
//!
//! Answers one question: which logical CPU ids should a workload that wants
//! `count` cores on NUMA node `node` be pinned to? The answer is deterministic
//! for a given host, so results are memoized by `(count, node)`.
//!
//! Core ids come from `/sys/devices/system/node/node<N>/cpulist`. On kernels
//! without a NUMA sysfs tree, node 0 falls back to all online CPUs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use crate::error::{Result, SweepError};

/// Base of the sysfs NUMA node tree
const NODE_SYSFS_BASE: &str = "/sys/devices/system/node";

fn cache() -> &'static Mutex<HashMap<(usize, u32), Vec<u32>>> {
    static CACHE: OnceLock<Mutex<HashMap<(usize, u32), Vec<u32>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Ordered logical CPU ids for `count` cores on NUMA node `node`.
///
/// Fails with [`SweepError::ResourceExhausted`] when the node holds fewer
/// than `count` cores. Side-effect free apart from the memoization cache.
pub fn cores_for_node(count: usize, node: u32) -> Result<Vec<u32>> {
    if let Some(cores) = cache().lock().unwrap().get(&(count, node)) {
        return Ok(cores.clone());
    }

    let available = node_cpus(Path::new(NODE_SYSFS_BASE), node);
    if available.len() < count {
        return Err(SweepError::ResourceExhausted {
            requested: count,
            found: available.len(),
            node,
        });
    }

    let cores: Vec<u32> = available.into_iter().take(count).collect();
    cache()
        .lock()
        .unwrap()
        .insert((count, node), cores.clone());
    Ok(cores)
}

/// Comma-joined flat core list, e.g. `"0,1,2,3"`, for interfaces that take
/// an explicit id list (`cpuset.cpus`).
pub fn core_list_str(count: usize, node: u32) -> Result<String> {
    let cores = cores_for_node(count, node)?;
    Ok(join_ids(&cores))
}

/// Gap-compressed `(start, end)` ranges covering the same core set,
/// e.g. `[(0,4), (11,15)]` for `0-4,11-15`.
pub fn compressed_ranges(count: usize, node: u32) -> Result<Vec<(u32, u32)>> {
    let cores = cores_for_node(count, node)?;
    Ok(compress(&cores))
}

/// Range form as a string usable on command lines, e.g. `"0-4,11-15"`.
pub fn compressed_str(count: usize, node: u32) -> Result<String> {
    let ranges = compressed_ranges(count, node)?;
    Ok(ranges
        .iter()
        .map(|(start, end)| format!("{}-{}", start, end))
        .collect::<Vec<_>>()
        .join(","))
}

/// Join core ids with commas
pub fn join_ids(ids: &[u32]) -> String {
    ids.iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// CPUs belonging to one NUMA node, read from sysfs.
///
/// Falls back to all online CPUs for node 0 when the node tree is missing
/// (non-NUMA kernels); other nodes report empty in that case.
fn node_cpus(base: &Path, node: u32) -> Vec<u32> {
    let cpulist = base.join(format!("node{}", node)).join("cpulist");
    match std::fs::read_to_string(&cpulist) {
        Ok(content) => parse_cpu_list(content.trim()),
        Err(_) if node == 0 => (0..num_cpus::get() as u32).collect(),
        Err(_) => Vec::new(),
    }
}

/// Parse kernel CPU list format (e.g. "0-3,8-11" -> [0,1,2,3,8,9,10,11])
fn parse_cpu_list(s: &str) -> Vec<u32> {
    let mut cpus = Vec::new();

    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.parse::<u32>(), end.parse::<u32>()) {
                cpus.extend(start..=end);
            }
        } else if let Ok(cpu) = part.parse::<u32>() {
            cpus.push(cpu);
        }
    }

    cpus
}

/// Compress an ordered id list into inclusive `(start, end)` ranges
fn compress(cores: &[u32]) -> Vec<(u32, u32)> {
    let mut ranges: Vec<(u32, u32)> = Vec::new();
    for &cpu in cores {
        match ranges.last_mut() {
            Some((_, end)) if *end + 1 == cpu => *end = cpu,
            _ => ranges.push((cpu, cpu)),
        }
    }
    ranges
}
