//! smr-balanced
//!
//! Gradually balances a btrfs filesystem built from DM-SMR drives. Such
//! drives stage random writes in a small persistent cache region; pushing
//! balance work too hard overflows that cache and collapses the drive's
//! latency. The daemon therefore moves one chunk at a time, always off
//! the device with the least unallocated space, and adapts the pause
//! between chunks to how long the previous one took. It exits once the
//! unallocated space is spread evenly enough across the devices.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use smrbal_balancer::config::Config;
use smrbal_balancer::pool::{BtrfsPool, Pool};
use smrbal_balancer::scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();
    info!(
        filesystem = %config.filesystem.display(),
        chunk_timeout_secs = config.chunk_timeout_secs,
        max_sleep_secs = config.max_sleep_secs,
        stdev_limit_bytes = config.stdev_limit_bytes,
        "Starting smr-balanced"
    );

    // Fail fast on a missing or non-btrfs mount; retrying cannot fix a
    // misconfiguration.
    let pool = BtrfsPool::new(&config.filesystem);
    pool.verify()
        .await
        .context("mount verification failed")?;
    info!(
        filesystem = %config.filesystem.display(),
        "Found btrfs filesystem"
    );

    let mut scheduler = Scheduler::new(pool, (&config).into());
    tokio::select! {
        result = scheduler.run() => {
            result.context("balance loop failed")?;
            info!("Pool is balanced, exiting");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, exiting");
        }
    }

    Ok(())
}
