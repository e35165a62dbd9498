//! CLI surface and runtime sweep configuration

pub mod settings;

pub use settings::{parse_cherry_picks, CliArgs, ConfTuple, SweepConfig};
