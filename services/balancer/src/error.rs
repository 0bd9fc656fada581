//! Error types for the balance scheduler.
//!
//! Everything here is fatal: a misconfigured mount, a broken telemetry
//! source, or a degenerate pool. A failed balance unit is *not* an error
//! (see [`crate::pool::UnitOutcome`]); the loop absorbs those.

use thiserror::Error;

/// Fatal balancer errors.
#[derive(Debug, Error)]
pub enum BalancerError {
    /// No filesystem is mounted at the configured path.
    #[error("no filesystem mounted at {0}")]
    MountMissing(String),

    /// The configured path is mounted, but not btrfs.
    #[error("{mount} is backed by {fstype}, expected btrfs")]
    WrongFilesystem { mount: String, fstype: String },

    /// The mount table could not be read.
    #[error("failed to read {path}: {source}")]
    MountTable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The telemetry command could not be launched.
    #[error("failed to run `{command}`: {source}")]
    Telemetry {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The telemetry command ran but reported failure.
    #[error("`{command}` failed: {stderr}")]
    TelemetryFailed { command: String, stderr: String },

    /// A device line from the telemetry output could not be parsed.
    #[error("unparseable device line in telemetry output: {0:?}")]
    TelemetryParse(String),

    /// A policy-level fault (degenerate pool).
    #[error(transparent)]
    Policy(#[from] smrbal_policy::PolicyError),
}
