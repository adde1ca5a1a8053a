//! Pasha common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all Pasha components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{MigrationPolicyKind, MoveOutTiming, PashaConfig, PreMigrate, SccMechanism};
pub use error::{PashaError, Result};
pub use types::{HostId, Key, PartitionId, Partitioner, TableId, Tid, WorkerId};
