use std::sync::Arc;

use crate::buffer::BufferPool;
use crate::segment::{Segment, SegmentMap};
use crate::stats::CacheStats;
use crate::store::MemStore;


const PAGE_SIZE: u64 = 0x1000;

/// A store of `len` bytes holding the byte pattern `i -> i & 0xff`.
fn pattern_store(len: usize) -> Arc<MemStore> {
    Arc::new(MemStore::new((0..len).map(|i| i as u8).collect()))
}

fn single_segment_map(va: u64, len: u64) -> Arc<SegmentMap> {
    Arc::new(SegmentMap::new(vec![Segment::new(va, len, 0)]).unwrap())
}

fn test_pool(max_idle: usize) -> Arc<BufferPool> {
    Arc::new(BufferPool::new(PAGE_SIZE as usize, max_idle))
}

fn test_stats() -> Arc<CacheStats> {
    Arc::new(CacheStats::default())
}
