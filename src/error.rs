//! Error types for ThreadSweep
//!
//! This module defines all error types used throughout the application.
//! The taxonomy distinguishes trial-scoped failures (caught at the sweep's
//! per-trial boundary) from platform-level failures that abort the whole run.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for ThreadSweep operations
#[derive(Error, Debug)]
pub enum SweepError {
    /// I/O error during file operations
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Polling exceeded its bound (handshake file, thread stability).
    /// Fatal to the trial, not the sweep.
    #[error("Timed out after {0:?} while waiting for {1}")]
    Timeout(Duration, String),

    /// A resolved pid is not live. Indicates a broken handshake rather than
    /// a timing race, so never retried.
    #[error("Process {0} not found")]
    ProcessNotFound(i32),

    /// Partition arithmetic or sweep parameters invalid.
    /// Skipped with a warning before any resource is touched.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A required kernel facility is missing (e.g. the cpuset controller).
    /// Fatal to the whole run, since no trial can proceed.
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// Topology query cannot satisfy the requested core count
    #[error("Only found {found} of {requested} requested cores on NUMA node {node}")]
    ResourceExhausted {
        requested: usize,
        found: usize,
        node: u32,
    },

    /// An external collaborator (parsecmgmt, sudo, perf, findmnt) failed
    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Malformed content read from a collaborator (handshake file, cgroup
    /// interface file, raw timing record)
    #[error("Parse error in {context}: {message}")]
    Parse { context: String, message: String },

    /// Configuration error from CLI processing
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl SweepError {
    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a timeout error
    pub fn timeout(bound: Duration, waiting_for: impl Into<String>) -> Self {
        Self::Timeout(bound, waiting_for.into())
    }

    /// Create a command failure error
    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a parse error
    pub fn parse(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Trial-scoped failures are caught at the orchestrator's per-trial
    /// boundary; everything else propagates and terminates the run.
    pub fn is_trial_scoped(&self) -> bool {
        !matches!(self, Self::UnsupportedPlatform(_) | Self::ConfigError(_))
    }
}

/// Result type alias for ThreadSweep operations
pub type Result<T> = std::result::Result<T, SweepError>;

impl From<std::io::Error> for SweepError {
    fn from(err: std::io::Error) -> Self {
        SweepError::Io {
            path: std::path::PathBuf::new(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for SweepError {
    fn from(err: serde_json::Error) -> Self {
        SweepError::Parse {
            context: "json".to_string(),
            message: err.to_string(),
        }
    }
}

/// Extension trait for adding path context to std::io::Result
pub trait IoResultExt<T> {
    /// Add path context to an I/O error
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| SweepError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = SweepError::io("/sys/fs/cgroup/test", io_err);
        assert!(err.to_string().contains("/sys/fs/cgroup/test"));
    }

    #[test]
    fn test_trial_scoped_classification() {
        let trial = SweepError::timeout(Duration::from_secs(10), "handshake file");
        assert!(trial.is_trial_scoped());

        let trial = SweepError::ProcessNotFound(1234);
        assert!(trial.is_trial_scoped());

        let fatal = SweepError::UnsupportedPlatform("cpuset controller missing".into());
        assert!(!fatal.is_trial_scoped());
    }

    #[test]
    fn test_resource_exhausted_message() {
        let err = SweepError::ResourceExhausted {
            requested: 16,
            found: 8,
            node: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("16"));
        assert!(msg.contains('8'));
        assert!(msg.contains("node 1"));
    }
}
