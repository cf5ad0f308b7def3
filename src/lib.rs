//! A paged random-access read cache over process memory dumps.
//!
//! Higher level diagnostics walkers resolve every query to small, often
//! repeated, unaligned byte reads at arbitrary virtual addresses. This
//! crate sits between those consumers and the raw backing store,
//! translating virtual addresses through an immutable segment map and
//! serving the bytes out of an aligned page cache.

mod buffer;
mod cache;
mod reader;
mod segment;
mod stats;
mod store;
mod utils;

pub use self::cache::ConfigError;
pub use self::reader::{PointerWidth, ReaderBuilder, VmReader};
pub use self::segment::{Segment, SegmentMap, SegmentMapError};
pub use self::stats::StatsSnapshot;
pub use self::store::{BackingStore, MemStore, MmapStore, StreamStore};

/// Configuration options for the cache components.
pub mod config {
    pub use crate::cache::{
        CacheCapacity,
        CacheConfig,
        DEFAULT_BYTE_BUDGET,
        DEFAULT_PAGE_SIZE,
    };
}
