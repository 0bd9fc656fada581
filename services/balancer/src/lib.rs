//! smr-balanced library surface.
//!
//! The binary is a thin wrapper over these modules; exposing them as a
//! library lets the integration tests drive the scheduler with a mock
//! pool instead of a real btrfs mount.

pub mod config;
pub mod error;
pub mod pool;
pub mod scheduler;
