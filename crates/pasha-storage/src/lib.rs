//! Partition-local storage for Pasha.
//!
//! This crate provides:
//! - Local tuple metadata ([`LocalRow`]) with its lock word and migration link
//! - The [`Table`] abstraction with ordered and hash-backed implementations
//! - Fixed-width tuple value serialization
//! - Composite key packing
//! - The per-host [`Database`] of owned partitions

mod database;
mod key;
mod ordered;
mod row;
mod table;
mod tuple;
mod unordered;

pub use database::{Database, TableDef};
pub use key::KeyPacker;
pub use ordered::{OrderedTable, MAX_KEY};
pub use row::{LocalRow, LocalRowState};
pub use table::{Adjacent, RowEntry, Table, TableKind};
pub use tuple::{FieldType, FieldValue, TupleSchema, TupleValue};
pub use unordered::UnorderedTable;
