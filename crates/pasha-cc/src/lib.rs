//! Migration-aware two-phase locking for Pasha.
//!
//! This crate provides:
//! - Transaction key sets and their lifecycle
//! - The lock, read and migration primitives over local and shared tuples
//! - Migration policies deciding which tuples stay in the shared region
//! - Inter-host messages and their in-process transport
//! - Worker execution, commit and abort, and owner-side request serving
//! - Cluster bootstrap over one shared CXL pool

pub mod executor;
pub mod helper;
pub mod message;
pub mod migration;
mod protocol;
pub mod runtime;
pub mod rwkey;
pub mod transaction;
pub mod transport;

pub use executor::{TxnScope, WorkerCore, WorkerStats};
pub use helper::{HelperStats, NextKeyLock, TwoPlPashaHelper};
pub use message::{Envelope, MigrationStatus, Request, Response, ScanStatus};
pub use migration::{
    create_migration_manager, MigrationManager, MigrationResult, MigrationStats, MoveOutOutcome,
    MoveOutStatus,
};
pub use runtime::{Cluster, HostRuntime};
pub use rwkey::{LockMode, ScanKind, ScanRow};
pub use transaction::{AbortReason, TwoPlPashaTransaction, TxnOutcome, TxnState};
pub use transport::Transport;
