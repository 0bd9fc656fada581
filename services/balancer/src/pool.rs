//! Pool collaborator interface and implementations.
//!
//! The scheduler only ever talks to the storage pool through the [`Pool`]
//! trait: verify the mount, snapshot device telemetry, run one balance
//! unit. `BtrfsPool` shells out to the btrfs tooling for production use;
//! `MockPool` replays scripted snapshots and outcomes for tests.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use smrbal_policy::Device;

use crate::error::BalancerError;

/// Result of one balance unit against a device.
///
/// Failure is a normal outcome, not an error: the external tool refusing
/// or aborting a unit carries no fatal signal, and the loop retries after
/// a cooldown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// The unit completed; `output` is the tool's combined output.
    Success { output: String },

    /// The unit failed; `output` carries the diagnostic text.
    Failure { output: String },
}

/// External storage pool operations.
#[async_trait]
pub trait Pool: Send + Sync {
    /// Check that the pool's mount exists and is btrfs-backed.
    async fn verify(&self) -> Result<(), BalancerError>;

    /// Snapshot per-device capacity and usage, in pool-reported order.
    async fn devices(&self) -> Result<Vec<Device>, BalancerError>;

    /// Move exactly one bounded unit of data off the given device.
    ///
    /// The external operation enforces the one-unit limit, so this call
    /// does not block for unbounded time under normal operation.
    async fn rebalance_one(&self, device: &Device) -> UnitOutcome;
}

/// Production pool backed by the btrfs userspace tools.
pub struct BtrfsPool {
    /// Mount point of the filesystem to balance.
    mount: PathBuf,

    /// Mount table to verify against. `/proc/self/mounts` in production;
    /// overridable so tests can point at a fixture.
    mounts_path: PathBuf,
}

impl BtrfsPool {
    /// Create a pool handle for the given btrfs mount point.
    pub fn new(mount: impl Into<PathBuf>) -> Self {
        Self {
            mount: mount.into(),
            mounts_path: PathBuf::from("/proc/self/mounts"),
        }
    }

    /// Override the mount table location (tests only).
    pub fn with_mounts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mounts_path = path.into();
        self
    }
}

#[async_trait]
impl Pool for BtrfsPool {
    async fn verify(&self) -> Result<(), BalancerError> {
        let table = tokio::fs::read_to_string(&self.mounts_path)
            .await
            .map_err(|source| BalancerError::MountTable {
                path: self.mounts_path.display().to_string(),
                source,
            })?;

        find_mount(&table, &self.mount)
    }

    async fn devices(&self) -> Result<Vec<Device>, BalancerError> {
        let command = format!("btrfs filesystem show --raw {}", self.mount.display());
        let output = Command::new("btrfs")
            .args(["filesystem", "show", "--raw"])
            .arg(&self.mount)
            .output()
            .await
            .map_err(|source| BalancerError::Telemetry {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(BalancerError::TelemetryFailed {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_device_lines(&String::from_utf8_lossy(&output.stdout))
    }

    async fn rebalance_one(&self, device: &Device) -> UnitOutcome {
        let filter = format!("-ddevid={},limit=1", device.id);
        debug!(devid = %device.id, filter = %filter, "Starting balance unit");

        let result = Command::new("btrfs")
            .args(["balance", "start"])
            .arg(&filter)
            .arg(&self.mount)
            .output()
            .await;

        match result {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).trim().to_string();
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stderr = stderr.trim();
                if !stderr.is_empty() {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(stderr);
                }
                if output.status.success() {
                    UnitOutcome::Success { output: text }
                } else {
                    UnitOutcome::Failure { output: text }
                }
            }
            Err(e) => UnitOutcome::Failure {
                output: format!("failed to run btrfs balance: {e}"),
            },
        }
    }
}

/// Look up `mount` in a `/proc/self/mounts`-format table.
fn find_mount(table: &str, mount: &Path) -> Result<(), BalancerError> {
    let wanted = mount.display().to_string();

    for line in table.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_source), Some(target), Some(fstype)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };

        if decode_mount_field(target) == wanted {
            if fstype == "btrfs" {
                return Ok(());
            }
            return Err(BalancerError::WrongFilesystem {
                mount: wanted,
                fstype: fstype.to_string(),
            });
        }
    }

    Err(BalancerError::MountMissing(wanted))
}

/// Decode the octal escapes the kernel uses in mount table fields
/// (`\040` for space, `\011` tab, `\012` newline, `\134` backslash).
fn decode_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && bytes[i + 1..i + 4].is_ascii() {
            if let Ok(value) = u8::from_str_radix(&field[i + 1..i + 4], 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse `devid` lines out of `btrfs filesystem show --raw` output.
///
/// Lines look like:
/// `devid    1 size 4000787030016 used 3999688294400 path /dev/sda`
/// Device order in the output is preserved.
fn parse_device_lines(output: &str) -> Result<Vec<Device>, BalancerError> {
    let mut devices = Vec::new();

    for line in output.lines() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with("devid") {
            continue;
        }

        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let parsed = (|| {
            if fields.len() < 8 || fields[2] != "size" || fields[4] != "used" || fields[6] != "path"
            {
                return None;
            }
            let size_bytes: u64 = fields[3].parse().ok()?;
            let used_bytes: u64 = fields[5].parse().ok()?;
            Some(Device {
                id: fields[1].to_string(),
                path: fields[7].to_string(),
                size_bytes,
                used_bytes,
            })
        })();

        match parsed {
            Some(device) => devices.push(device),
            None => return Err(BalancerError::TelemetryParse(line.to_string())),
        }
    }

    Ok(devices)
}

/// Scripted pool for tests and development.
///
/// Each telemetry call consumes the next scripted snapshot; the last one
/// repeats once the script runs out. Balance units optionally take
/// (virtual) time and optionally fail.
pub struct MockPool {
    snapshots: Mutex<Vec<Vec<Device>>>,
    balanced: Mutex<Vec<String>>,
    unit_duration: Duration,
    fail_units: bool,
}

impl MockPool {
    /// Create a mock pool replaying the given snapshots in order.
    pub fn new(snapshots: Vec<Vec<Device>>) -> Self {
        Self {
            snapshots: Mutex::new(snapshots),
            balanced: Mutex::new(Vec::new()),
            unit_duration: Duration::ZERO,
            fail_units: false,
        }
    }

    /// Make every balance unit take this long (in tokio time).
    pub fn with_unit_duration(mut self, duration: Duration) -> Self {
        self.unit_duration = duration;
        self
    }

    /// Make every balance unit fail.
    pub fn with_failing_units(mut self) -> Self {
        self.fail_units = true;
        self
    }

    /// Device ids balance units were run against, in order.
    pub fn balanced_devices(&self) -> Vec<String> {
        self.balanced.lock().unwrap().clone()
    }

    /// Number of balance units run.
    pub fn rebalance_calls(&self) -> usize {
        self.balanced.lock().unwrap().len()
    }
}

#[async_trait]
impl Pool for MockPool {
    async fn verify(&self) -> Result<(), BalancerError> {
        Ok(())
    }

    async fn devices(&self) -> Result<Vec<Device>, BalancerError> {
        let mut snapshots = self.snapshots.lock().unwrap();
        if snapshots.len() > 1 {
            Ok(snapshots.remove(0))
        } else {
            snapshots
                .first()
                .cloned()
                .ok_or(BalancerError::Policy(
                    smrbal_policy::PolicyError::EmptySnapshot,
                ))
        }
    }

    async fn rebalance_one(&self, device: &Device) -> UnitOutcome {
        self.balanced.lock().unwrap().push(device.id.clone());

        if !self.unit_duration.is_zero() {
            tokio::time::sleep(self.unit_duration).await;
        }

        if self.fail_units {
            UnitOutcome::Failure {
                output: format!("[MOCK] balance of devid {} refused", device.id),
            }
        } else {
            UnitOutcome::Success {
                output: format!("[MOCK] relocated 1 chunk off devid {}", device.id),
            }
        }
    }
}
