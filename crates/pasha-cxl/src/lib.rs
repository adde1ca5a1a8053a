//! CXL shared memory for Pasha.
//!
//! This crate models the memory pool shared by every host and the
//! structures that live in it:
//! - Slot arena with offset-stable typed handles
//! - Shared tuple metadata and the packed lock word
//! - Shared-region index of migrated tuples
//! - Epoch-based reclamation of retired tuples
//! - Software cache coherence around shared tuple bytes

mod arena;
mod ebr;
mod index;
mod lock_word;
mod pool;
mod row;
mod scc;

pub use arena::{SharedHandle, SlotArena};
pub use ebr::{Ebr, EbrStats, RetiredObject, MAX_EPOCH};
pub use index::{RegionKey, SharedIndex, INDEX_BUCKET_BYTES, INDEX_ENTRY_BYTES};
pub use lock_word::{LockWord, MAX_READERS};
pub use pool::{
    AllocCategory, CategoryStats, CxlPool, CxlPoolConfig, CxlPoolStats, MAX_ROOTS, ROOT_EBR,
    ROOT_INIT_DONE, ROOT_SHARED_INDEX,
};
pub use row::{SharedRow, SharedRowState, SHARED_ROW_METADATA_BYTES};
pub use scc::{
    create_scc_manager, SccManager, SccMeta, SccNoOp, SccNonTemporal, SccStats,
    SccWriteThrough, CACHE_LINE_SIZE,
};
