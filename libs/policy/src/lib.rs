//! Balance scheduling policies.
//!
//! This library holds the decision logic of the balance scheduler, kept
//! free of I/O so it can be exercised against fabricated telemetry:
//!
//! - **Dispersion**: sample standard deviation of unallocated space across
//!   the pool's devices, the single convergence signal.
//! - **Selection**: which device to balance next (the least-free one).
//! - **Backoff**: how long to wait between balance units, adapted from how
//!   long the previous unit took.
//!
//! # Invariants
//!
//! - All decisions are deterministic given the same inputs.
//! - The backoff index never goes below zero and never grows past the
//!   point where the next sleep term would reach the configured maximum.
//! - Snapshots are consumed by value reference only; no policy retains
//!   telemetry across iterations.

use std::time::Duration;

use thiserror::Error;

/// Policy errors.
///
/// Both variants indicate a misconfigured or degenerate pool, not a
/// transient fault; callers are expected to treat them as fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// Dispersion is undefined for fewer than two devices.
    #[error("dispersion needs at least 2 devices, snapshot has {0}")]
    InsufficientSamples(usize),

    /// Selection over an empty snapshot.
    #[error("snapshot contains no devices")]
    EmptySnapshot,
}

/// One physical member of the storage pool, as reported by telemetry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Identifier unique within a snapshot, opaque to the policies.
    pub id: String,

    /// Device node path, used to address external operations.
    pub path: String,

    /// Total raw size in bytes.
    pub size_bytes: u64,

    /// Bytes currently allocated to data and metadata.
    pub used_bytes: u64,
}

impl Device {
    /// Free (unallocated) bytes on this device.
    pub fn unallocated_bytes(&self) -> u64 {
        self.size_bytes.saturating_sub(self.used_bytes)
    }
}

/// Sample standard deviation of unallocated bytes across the snapshot.
///
/// Requires at least two devices; a pool with fewer has no meaningful
/// dispersion and is treated as a configuration fault.
pub fn unallocated_stdev(devices: &[Device]) -> Result<f64, PolicyError> {
    if devices.len() < 2 {
        return Err(PolicyError::InsufficientSamples(devices.len()));
    }

    let n = devices.len() as f64;
    let mean = devices
        .iter()
        .map(|d| d.unallocated_bytes() as f64)
        .sum::<f64>()
        / n;
    let variance = devices
        .iter()
        .map(|d| {
            let delta = d.unallocated_bytes() as f64 - mean;
            delta * delta
        })
        .sum::<f64>()
        / (n - 1.0);

    Ok(variance.sqrt())
}

/// Whether free space is spread evenly enough to stop balancing.
///
/// Converged means the sample standard deviation of unallocated bytes is
/// strictly below `limit_bytes`.
pub fn is_converged(devices: &[Device], limit_bytes: u64) -> Result<bool, PolicyError> {
    Ok(unallocated_stdev(devices)? < limit_bytes as f64)
}

/// The device with the least unallocated space.
///
/// Ties resolve to the first such device in snapshot order, so repeated
/// runs against a stable snapshot pick the same device.
pub fn least_free_device(devices: &[Device]) -> Result<&Device, PolicyError> {
    // min_by_key returns the first of equally-minimal elements.
    devices
        .iter()
        .min_by_key(|d| d.unallocated_bytes())
        .ok_or(PolicyError::EmptySnapshot)
}

/// Adaptive inter-unit backoff.
///
/// Sleep durations follow a Fibonacci-like sequence (`seq(0) = seq(1) = 1`,
/// `seq(n) = seq(n-1) + seq(n-2)`, in seconds). A slow balance unit walks
/// the index up one step, capped so the next term stays under the
/// configured maximum sleep; a fast unit walks it down two steps (one near
/// zero). Recovery from an over-cautious state is deliberately quicker
/// than escalation into one.
#[derive(Debug)]
pub struct Backoff {
    /// Position in the sleep sequence.
    index: usize,

    /// Memoized sequence terms, grown lazily. `memo[n]` is `seq(n)`.
    memo: Vec<u64>,
}

impl Backoff {
    /// Create a backoff controller at index zero.
    pub fn new() -> Self {
        Self {
            index: 0,
            memo: vec![1, 1],
        }
    }

    /// Current position in the sleep sequence.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The `n`-th term of the sleep sequence, in seconds.
    ///
    /// Computed once per index and cached for the life of the controller.
    pub fn term(&mut self, n: usize) -> u64 {
        while self.memo.len() <= n {
            let len = self.memo.len();
            let next = self.memo[len - 1].saturating_add(self.memo[len - 2]);
            self.memo.push(next);
        }
        self.memo[n]
    }

    /// Fold the outcome of one completed balance unit into the index.
    ///
    /// A unit slower than `chunk_timeout` suggests the drive's write cache
    /// is filling; step up unless the next term would reach `max_sleep`.
    /// A fast unit steps down twice as far as the escalation steps up.
    pub fn observe(&mut self, duration: Duration, chunk_timeout: Duration, max_sleep: Duration) {
        if duration > chunk_timeout {
            if self.term(self.index + 1) < max_sleep.as_secs() {
                self.index += 1;
            }
        } else if self.index > 1 {
            self.index -= 2;
        } else if self.index > 0 {
            self.index -= 1;
        }
    }

    /// Sleep to apply before the next balance unit.
    pub fn current_sleep(&mut self) -> Duration {
        Duration::from_secs(self.term(self.index))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn dev(id: &str, size: u64, used: u64) -> Device {
        Device {
            id: id.to_string(),
            path: format!("/dev/{id}"),
            size_bytes: size,
            used_bytes: used,
        }
    }

    #[test]
    fn test_sequence_identities() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.term(0), 1);
        assert_eq!(backoff.term(1), 1);
        for n in 2..40 {
            assert_eq!(backoff.term(n), backoff.term(n - 1) + backoff.term(n - 2));
        }
        // 1, 1, 2, 3, 5, 8, 13, ...
        assert_eq!(backoff.term(6), 13);
    }

    #[test]
    fn test_sequence_memoized() {
        let mut backoff = Backoff::new();
        let first = backoff.term(30);
        // Memo table holds every term up to the requested index and does
        // not grow on repeated lookups.
        assert_eq!(backoff.memo.len(), 31);
        assert_eq!(backoff.term(30), first);
        assert_eq!(backoff.memo.len(), 31);
    }

    #[test]
    fn test_slow_units_escalate_until_cap() {
        let mut backoff = Backoff::new();
        let slow = Duration::from_secs(90);
        let timeout = Duration::from_secs(60);
        let max_sleep = Duration::from_secs(100);

        let mut last = 0;
        for _ in 0..32 {
            backoff.observe(slow, timeout, max_sleep);
            assert!(backoff.index() >= last, "index must be non-decreasing");
            last = backoff.index();
        }

        // seq: 1 1 2 3 5 8 13 21 34 55 89 144; the cap check is on the
        // *next* term, so the index holds where seq(index + 1) = 144.
        assert_eq!(backoff.index(), 10);
        let held = backoff.index();
        backoff.observe(slow, timeout, max_sleep);
        assert_eq!(backoff.index(), held);
        assert!(backoff.term(held) < max_sleep.as_secs());
    }

    #[test]
    fn test_fast_units_decay_two_then_one_then_floor() {
        let mut backoff = Backoff::new();
        let slow = Duration::from_secs(90);
        let fast = Duration::from_secs(10);
        let timeout = Duration::from_secs(60);
        let max_sleep = Duration::from_secs(7200);

        for _ in 0..5 {
            backoff.observe(slow, timeout, max_sleep);
        }
        assert_eq!(backoff.index(), 5);

        backoff.observe(fast, timeout, max_sleep);
        assert_eq!(backoff.index(), 3);
        backoff.observe(fast, timeout, max_sleep);
        assert_eq!(backoff.index(), 1);
        backoff.observe(fast, timeout, max_sleep);
        assert_eq!(backoff.index(), 0);
        backoff.observe(fast, timeout, max_sleep);
        assert_eq!(backoff.index(), 0);
    }

    #[test]
    fn test_boundary_duration_counts_as_fast() {
        let mut backoff = Backoff::new();
        let timeout = Duration::from_secs(60);
        let max_sleep = Duration::from_secs(7200);

        // Exactly at the timeout is not "slower than" it.
        backoff.observe(timeout, timeout, max_sleep);
        assert_eq!(backoff.index(), 0);
    }

    #[test]
    fn test_current_sleep_tracks_index() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.current_sleep(), Duration::from_secs(1));

        let slow = Duration::from_secs(90);
        let timeout = Duration::from_secs(60);
        let max_sleep = Duration::from_secs(7200);
        for _ in 0..4 {
            backoff.observe(slow, timeout, max_sleep);
        }
        assert_eq!(backoff.index(), 4);
        assert_eq!(backoff.current_sleep(), Duration::from_secs(5));
    }

    #[test]
    fn test_stdev_even_pool_is_zero() {
        let devices = vec![
            dev("1", 12 * GIB, 2 * GIB),
            dev("2", 12 * GIB, 2 * GIB),
            dev("3", 12 * GIB, 2 * GIB),
        ];
        assert_eq!(unallocated_stdev(&devices).unwrap(), 0.0);
        assert!(is_converged(&devices, 1).unwrap());
    }

    #[test]
    fn test_stdev_skewed_pool() {
        // Unallocated: 0, 0, 40 GiB -> sample stdev ~= 18.86 GiB.
        let devices = vec![
            dev("1", 40 * GIB, 40 * GIB),
            dev("2", 40 * GIB, 40 * GIB),
            dev("3", 40 * GIB, 0),
        ];
        let stdev = unallocated_stdev(&devices).unwrap();
        let expected = 40.0 * GIB as f64 / 3.0f64.sqrt();
        assert!((stdev - expected).abs() < 1.0);
        assert!(!is_converged(&devices, 5 * GIB).unwrap());
    }

    #[test]
    fn test_stdev_requires_two_devices() {
        let one = vec![dev("1", GIB, 0)];
        assert_eq!(
            unallocated_stdev(&one),
            Err(PolicyError::InsufficientSamples(1))
        );
        assert_eq!(
            unallocated_stdev(&[]),
            Err(PolicyError::InsufficientSamples(0))
        );
    }

    #[test]
    fn test_least_free_device() {
        let devices = vec![
            dev("1", 200 * GIB, 100 * GIB),
            dev("2", 200 * GIB, 80 * GIB),
            dev("3", 200 * GIB, 180 * GIB),
        ];
        assert_eq!(least_free_device(&devices).unwrap().id, "3");
    }

    #[test]
    fn test_least_free_tie_breaks_to_first() {
        let devices = vec![
            dev("1", 100 * GIB, 90 * GIB),
            dev("2", 100 * GIB, 90 * GIB),
            dev("3", 100 * GIB, 50 * GIB),
        ];
        assert_eq!(least_free_device(&devices).unwrap().id, "1");
    }

    #[test]
    fn test_least_free_empty_snapshot() {
        assert_eq!(least_free_device(&[]), Err(PolicyError::EmptySnapshot));
    }

    #[test]
    fn test_unallocated_saturates() {
        // Telemetry can momentarily report used > size mid-balance.
        let d = dev("1", GIB, 2 * GIB);
        assert_eq!(d.unallocated_bytes(), 0);
    }

    proptest! {
        #[test]
        fn prop_backoff_index_stays_bounded(outcomes in prop::collection::vec(any::<bool>(), 0..200)) {
            let mut backoff = Backoff::new();
            let timeout = Duration::from_secs(60);
            let max_sleep = Duration::from_secs(7200);

            for slow in outcomes {
                let duration = if slow {
                    Duration::from_secs(120)
                } else {
                    Duration::from_secs(5)
                };
                backoff.observe(duration, timeout, max_sleep);

                let index = backoff.index();
                // Any index above zero was reached through the cap check.
                if index > 0 {
                    prop_assert!(backoff.term(index) < max_sleep.as_secs());
                }
            }
        }

        #[test]
        fn prop_fast_runs_reach_zero(start_slow in 0usize..20) {
            let mut backoff = Backoff::new();
            let timeout = Duration::from_secs(60);
            let max_sleep = Duration::from_secs(7200);

            for _ in 0..start_slow {
                backoff.observe(Duration::from_secs(120), timeout, max_sleep);
            }
            let mut previous = backoff.index();
            while backoff.index() > 0 {
                backoff.observe(Duration::from_secs(5), timeout, max_sleep);
                prop_assert!(backoff.index() < previous);
                previous = backoff.index();
            }
            prop_assert_eq!(backoff.current_sleep(), Duration::from_secs(1));
        }
    }
}
