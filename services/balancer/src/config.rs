//! Configuration for the balance scheduler.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Default dispersion threshold: 5 GiB.
const DEFAULT_STDEV_LIMIT_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// Balance scheduler configuration.
///
/// Every flag can also come from an `SMRBAL_*` environment variable.
/// All durations and thresholds must be at least 1; clap enforces this
/// at parse time, so the values are valid for the process lifetime.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "smr-balanced",
    about = "Gradually balances a btrfs pool of DM-SMR drives without overflowing their write caches",
    version
)]
pub struct Config {
    /// Mount point of the btrfs filesystem to balance.
    #[arg(long, env = "SMRBAL_FILESYSTEM", default_value = "/media/btrfs")]
    pub filesystem: PathBuf,

    /// Seconds after which a single balance unit counts as slow.
    #[arg(
        long,
        env = "SMRBAL_CHUNK_TIMEOUT_SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub chunk_timeout_secs: u64,

    /// Maximum seconds to sleep between balance units.
    #[arg(
        long,
        env = "SMRBAL_MAX_SLEEP_SECS",
        default_value_t = 7200,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub max_sleep_secs: u64,

    /// Stop once the stdev of unallocated bytes drops below this.
    #[arg(
        long,
        env = "SMRBAL_STDEV_LIMIT_BYTES",
        default_value_t = DEFAULT_STDEV_LIMIT_BYTES,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub stdev_limit_bytes: u64,

    /// Seconds to pause after a failed balance unit before retrying.
    #[arg(
        long,
        env = "SMRBAL_FAILURE_COOLDOWN_SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub failure_cooldown_secs: u64,
}

impl Config {
    /// Slow-unit classification threshold.
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    /// Upper bound on the adaptive sleep.
    pub fn max_sleep(&self) -> Duration {
        Duration::from_secs(self.max_sleep_secs)
    }

    /// Fixed pause after a transient balance failure.
    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.failure_cooldown_secs)
    }
}
