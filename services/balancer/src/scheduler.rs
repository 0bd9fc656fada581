//! The balance scheduler loop.
//!
//! One iteration per balance unit, fully sequential:
//! snapshot telemetry, stop if the pool has converged, pick the least-free
//! device, run one balance unit, feed its duration to the backoff, sleep.
//! At most one balance unit is ever in flight against the pool; running
//! units concurrently is exactly the cache-pressure behavior this daemon
//! exists to avoid.

use std::time::Duration;

use bytesize::ByteSize;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use smrbal_policy::{least_free_device, unallocated_stdev, Backoff};

use crate::config::Config;
use crate::error::BalancerError;
use crate::pool::{Pool, UnitOutcome};

/// Scheduler loop configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// A unit slower than this counts as a cache-pressure signal.
    pub chunk_timeout: Duration,

    /// Upper bound on the adaptive inter-unit sleep.
    pub max_sleep: Duration,

    /// Stop once the stdev of unallocated bytes drops below this.
    pub stdev_limit_bytes: u64,

    /// Fixed pause after a failed unit, outside the backoff policy.
    pub failure_cooldown: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            chunk_timeout: Duration::from_secs(60),
            max_sleep: Duration::from_secs(7200),
            stdev_limit_bytes: 5 * 1024 * 1024 * 1024,
            failure_cooldown: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            chunk_timeout: config.chunk_timeout(),
            max_sleep: config.max_sleep(),
            stdev_limit_bytes: config.stdev_limit_bytes,
            failure_cooldown: config.failure_cooldown(),
        }
    }
}

/// Scheduler driving a pool toward even free-space distribution.
pub struct Scheduler<P: Pool> {
    /// Pool collaborator.
    pool: P,

    /// Configuration.
    config: SchedulerConfig,

    /// The only state carried between iterations.
    backoff: Backoff,
}

impl<P: Pool> Scheduler<P> {
    /// Create a scheduler with the backoff at its starting position.
    pub fn new(pool: P, config: SchedulerConfig) -> Self {
        Self {
            pool,
            config,
            backoff: Backoff::new(),
        }
    }

    /// Current backoff index (exposed for tests and status logging).
    pub fn backoff_index(&self) -> usize {
        self.backoff.index()
    }

    /// The pool this scheduler drives.
    pub fn pool(&self) -> &P {
        &self.pool
    }

    /// Run until the pool converges.
    ///
    /// Returns `Ok(())` once the free-space dispersion drops below the
    /// configured limit. Errors are fatal (telemetry broken, fewer than
    /// two devices); failed balance units are absorbed with a cooldown
    /// and never surface here.
    pub async fn run(&mut self) -> Result<(), BalancerError> {
        info!(
            chunk_timeout_secs = self.config.chunk_timeout.as_secs(),
            max_sleep_secs = self.config.max_sleep.as_secs(),
            stdev_limit = %ByteSize::b(self.config.stdev_limit_bytes),
            "Starting balance loop"
        );

        loop {
            let devices = self.pool.devices().await?;

            let stdev = unallocated_stdev(&devices)?;
            let limit = self.config.stdev_limit_bytes;
            if stdev < limit as f64 {
                info!(
                    stdev = %ByteSize::b(stdev as u64),
                    limit = %ByteSize::b(limit),
                    "Unallocated space stdev is below the limit, pool is balanced"
                );
                return Ok(());
            }
            info!(
                stdev = %ByteSize::b(stdev as u64),
                limit = %ByteSize::b(limit),
                "Unallocated space stdev is above the limit, continuing"
            );

            let device = least_free_device(&devices)?.clone();
            info!(
                devid = %device.id,
                path = %device.path,
                unallocated = %ByteSize::b(device.unallocated_bytes()),
                "Balancing the least empty device"
            );

            let started = Instant::now();
            let outcome = self.pool.rebalance_one(&device).await;
            let duration = started.elapsed();

            match outcome {
                UnitOutcome::Failure { output } => {
                    // No timing signal in a failed unit; leave the backoff
                    // alone and retry after a short fixed pause.
                    warn!(devid = %device.id, %output, "Balance unit failed");
                    info!(
                        cooldown_secs = self.config.failure_cooldown.as_secs(),
                        "Pausing before the next attempt"
                    );
                    sleep(self.config.failure_cooldown).await;
                }
                UnitOutcome::Success { output } => {
                    if !output.is_empty() {
                        debug!(devid = %device.id, %output, "Balance unit output");
                    }
                    let slow = duration > self.config.chunk_timeout;
                    info!(
                        duration_secs = duration.as_secs(),
                        verdict = if slow { "slow" } else { "fast" },
                        "Balance unit finished"
                    );

                    self.backoff
                        .observe(duration, self.config.chunk_timeout, self.config.max_sleep);
                    let sleep_for = self.backoff.current_sleep();
                    let wake = chrono::Local::now()
                        + chrono::Duration::seconds(sleep_for.as_secs() as i64);
                    info!(
                        sleep_secs = sleep_for.as_secs(),
                        wake = %wake.format("%H:%M:%S"),
                        "Sleeping before the next unit"
                    );
                    sleep(sleep_for).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.chunk_timeout, Duration::from_secs(60));
        assert_eq!(config.max_sleep, Duration::from_secs(7200));
        assert_eq!(config.stdev_limit_bytes, 5 * 1024 * 1024 * 1024);
        assert_eq!(config.failure_cooldown, Duration::from_secs(30));
    }

    #[test]
    fn test_scheduler_config_from_cli_config() {
        use clap::Parser;

        let cli = Config::try_parse_from([
            "smr-balanced",
            "--chunk-timeout-secs",
            "45",
            "--max-sleep-secs",
            "600",
        ])
        .unwrap();
        let config = SchedulerConfig::from(&cli);
        assert_eq!(config.chunk_timeout, Duration::from_secs(45));
        assert_eq!(config.max_sleep, Duration::from_secs(600));
    }
}
