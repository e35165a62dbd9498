//! Threaded cgroup-v2 partition management

pub mod partition;

pub use partition::{split_nearly_equal, CgroupPartition, CGROUP_BASE, LEAF_PREFIX};
