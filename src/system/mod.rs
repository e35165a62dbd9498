//! Host-facing helpers: CPU topology queries and privileged shell-outs

pub mod privileged;
pub mod topology;

pub use topology::{compressed_ranges, compressed_str, core_list_str, cores_for_node};
