use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::buffer::BufferPool;
use crate::cache::{
    CacheCapacity,
    CacheConfig,
    CacheSlot,
    ConfigError,
    LruPageCache,
    PageCache,
    SegmentPageCache,
};
use crate::segment::SegmentMap;
use crate::stats::{CacheStats, StatsSnapshot};
use crate::store::BackingStore;

#[derive(
    Debug,
    Default,
    Copy,
    Clone,
    Eq,
    PartialEq,
    serde_derive::Serialize,
    serde_derive::Deserialize,
)]
/// The pointer size of the target process.
pub enum PointerWidth {
    /// 32 bit pointers.
    U32,
    #[default]
    /// 64 bit pointers.
    U64,
}

impl PointerWidth {
    #[inline]
    /// The size of a pointer in bytes.
    pub fn size(&self) -> usize {
        match self {
            PointerWidth::U32 => 4,
            PointerWidth::U64 => 8,
        }
    }
}

/// A builder for creating new [VmReader]s.
pub struct ReaderBuilder {
    config: CacheConfig,
    pointer_width: PointerWidth,
}

impl Default for ReaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReaderBuilder {
    /// Create a new [ReaderBuilder] with default options.
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
            pointer_width: PointerWidth::default(),
        }
    }

    /// Set the size of cache pages in bytes.
    ///
    /// Must be a power of two. Defaults to 4KB.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.config.page_size = page_size;
        self
    }

    /// Set the capacity of the cache.
    ///
    /// The kind of capacity selects the cache variant, see [CacheCapacity].
    pub fn with_capacity(mut self, capacity: CacheCapacity) -> Self {
        self.config.capacity = capacity;
        self
    }

    /// Replace the full cache configuration.
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the pointer size of the target process.
    ///
    /// Defaults to 64 bit.
    pub fn with_pointer_width(mut self, pointer_width: PointerWidth) -> Self {
        self.pointer_width = pointer_width;
        self
    }

    /// Open a new [VmReader] over the given store and segment map.
    pub fn open(
        self,
        store: Arc<dyn BackingStore>,
        segments: SegmentMap,
    ) -> Result<VmReader, ConfigError> {
        self.config.validate()?;

        let page_size = self.config.page_size;
        let segments = Arc::new(segments);
        let stats = Arc::new(CacheStats::default());

        let max_idle = match self.config.capacity {
            CacheCapacity::PageCount(pages) => pages,
            CacheCapacity::ByteBudget(bytes) => {
                (bytes / page_size as u64).max(1) as usize
            },
        };
        let pool = Arc::new(BufferPool::new(page_size, max_idle));

        let cache: Box<dyn PageCache> = match self.config.capacity {
            CacheCapacity::PageCount(pages) => Box::new(LruPageCache::new(
                store,
                segments,
                pool,
                stats.clone(),
                page_size as u64,
                pages,
            )),
            CacheCapacity::ByteBudget(bytes) => Box::new(SegmentPageCache::new(
                store,
                &segments,
                pool,
                stats.clone(),
                page_size as u64,
                bytes,
            )),
        };

        Ok(VmReader {
            cache,
            page_size,
            page_mask: page_size as u64 - 1,
            pointer_width: self.pointer_width,
            stats,
            closed: AtomicBool::new(false),
        })
    }
}

/// A random-access view of a target process's virtual address space.
///
/// Every read resolves through the page cache, only cache misses touch
/// the backing store. The reader is a best-effort byte source, runtime
/// read problems surface as partial byte counts rather than errors.
pub struct VmReader {
    cache: Box<dyn PageCache>,
    page_size: usize,
    page_mask: u64,
    pointer_width: PointerWidth,
    stats: Arc<CacheStats>,
    closed: AtomicBool,
}

impl VmReader {
    /// Create a new [ReaderBuilder] with default options.
    pub fn builder() -> ReaderBuilder {
        ReaderBuilder::new()
    }

    /// Copy the bytes at the virtual address `va` into `out`.
    ///
    /// Returns the number of bytes copied, which may be short when the
    /// range runs past the mapped segments or the backing store. Bytes in
    /// `out` beyond the returned count are untouched. A read at virtual
    /// address zero always returns `0`.
    pub fn read(&self, va: u64, out: &mut [u8]) -> usize {
        if va == 0 || self.closed.load(Ordering::Acquire) {
            return 0;
        }

        if va & self.page_mask != 0 {
            self.stats.incr_unaligned_reads();
        }

        let mut cursor = va;
        let mut written = 0usize;
        let mut pages_touched = 0u32;
        let mut carried: Option<CacheSlot> = None;

        while written < out.len() {
            let slot = match carried.take() {
                Some(slot) => slot,
                None => match self.cache.get_or_create(cursor) {
                    Some(slot) => slot,
                    None => break,
                },
            };
            pages_touched += 1;

            let copied = self.cache.read_entry(&slot, cursor, &mut out[written..]);
            if copied == 0 {
                break;
            }

            written += copied;
            cursor += copied as u64;

            if cursor == slot.entry.end_va() {
                carried = self.cache.advance(&slot);
            } else if written < out.len() {
                // The page came up short, nothing follows it.
                break;
            }
        }

        if pages_touched > 1 {
            self.stats.incr_multi_page_reads();
        }
        written
    }

    /// Read a plain-old-data value at the virtual address `va`.
    ///
    /// The bytes are reinterpreted in the target's native layout. Returns
    /// `None` unless the full `size_of::<T>()` bytes could be read.
    pub fn read_value<T: bytemuck::Pod>(&self, va: u64) -> Option<T> {
        let mut value = T::zeroed();
        let out = bytemuck::bytes_of_mut(&mut value);
        let wanted = out.len();
        (self.read(va, out) == wanted).then_some(value)
    }

    /// Read a target-sized pointer at the virtual address `va`.
    ///
    /// Dispatches to a 4 or 8 byte read based on the configured
    /// [PointerWidth], 32 bit pointers are zero extended.
    pub fn read_pointer(&self, va: u64) -> Option<u64> {
        match self.pointer_width {
            PointerWidth::U32 => self.read_value::<u32>(va).map(u64::from),
            PointerWidth::U64 => self.read_value::<u64>(va),
        }
    }

    #[inline]
    /// The size of a target pointer in bytes.
    pub fn pointer_size(&self) -> usize {
        self.pointer_width.size()
    }

    #[inline]
    /// The size of cache pages in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Evict every resident page.
    ///
    /// Counters are unaffected, use [VmReader::reset_stats] to zero them.
    pub fn flush(&self) {
        self.cache.flush();
    }

    /// Take a point-in-time copy of the cache counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Zero the cache counters.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// The number of bytes currently held by resident pages.
    pub fn resident_bytes(&self) -> u64 {
        self.cache.resident_bytes()
    }

    /// Shut down the cache.
    ///
    /// Stops the trim worker if one is running and releases every page
    /// buffer. Reads after close return `0`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.cache.close();
        }
    }
}

impl Drop for VmReader {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;
    use crate::store::MemStore;

    fn pattern_reader(capacity: CacheCapacity) -> VmReader {
        let store = MemStore::new((0..0x4000).map(|i| i as u8).collect());
        let segments =
            SegmentMap::new(vec![Segment::new(0x1000, 0x4000, 0)]).unwrap();
        VmReader::builder()
            .with_page_size(0x1000)
            .with_capacity(capacity)
            .open(Arc::new(store), segments)
            .unwrap()
    }

    #[test]
    fn test_invalid_page_size_rejected() {
        let store = Arc::new(MemStore::new(Vec::new()));
        let segments = SegmentMap::new(Vec::new()).unwrap();
        let result = VmReader::builder()
            .with_page_size(3000)
            .open(store, segments);
        assert!(matches!(result, Err(ConfigError::InvalidPageSize(3000))));
    }

    #[rstest::rstest]
    #[case::lru(CacheCapacity::PageCount(4))]
    #[case::segmented(CacheCapacity::ByteBudget(64 << 10))]
    fn test_read_at_va_zero(#[case] capacity: CacheCapacity) {
        let reader = pattern_reader(capacity);
        let mut out = [0u8; 8];
        assert_eq!(reader.read(0, &mut out), 0);
        assert_eq!(reader.read_pointer(0), None);
        assert_eq!(reader.read_value::<u32>(0), None);
    }

    #[rstest::rstest]
    #[case::lru(CacheCapacity::PageCount(4))]
    #[case::segmented(CacheCapacity::ByteBudget(64 << 10))]
    fn test_read_after_close(#[case] capacity: CacheCapacity) {
        let reader = pattern_reader(capacity);
        let mut out = [0u8; 8];
        assert_eq!(reader.read(0x1000, &mut out), 8);

        reader.close();
        assert_eq!(reader.read(0x1000, &mut out), 0);
        assert_eq!(reader.resident_bytes(), 0);

        // Closing twice is a no-op.
        reader.close();
    }

    #[test]
    fn test_pointer_width_dispatch() {
        let store = MemStore::new(vec![0xAA; 0x100]);
        let segments = SegmentMap::new(vec![Segment::new(0x1000, 0x100, 0)]).unwrap();

        let reader = VmReader::builder()
            .with_page_size(0x100)
            .with_capacity(CacheCapacity::PageCount(2))
            .with_pointer_width(PointerWidth::U32)
            .open(Arc::new(store), segments)
            .unwrap();

        assert_eq!(reader.pointer_size(), 4);
        assert_eq!(reader.read_pointer(0x1000), Some(0xAAAA_AAAA));
    }

    #[test]
    fn test_read_value_requires_full_width() {
        let reader = pattern_reader(CacheCapacity::PageCount(8));

        // The last 4 bytes of the mapped range half-cover a u64.
        let va = 0x1000 + 0x4000 - 4;
        assert_eq!(reader.read_value::<u64>(va), None);
        assert_eq!(reader.read_value::<u32>(va), Some(u32::from_le_bytes([
            0xFC, 0xFD, 0xFE, 0xFF,
        ])));
    }
}
