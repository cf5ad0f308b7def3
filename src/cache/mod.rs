mod entry;
mod lru;
mod segmented;
#[cfg(all(test, not(miri)))]
mod tests;
mod trimmer;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) use self::entry::PageEntry;
pub(crate) use self::lru::LruPageCache;
pub(crate) use self::segmented::SegmentPageCache;

/// The default page size of a cache.
pub const DEFAULT_PAGE_SIZE: usize = 4 << 10;
/// The default byte budget of a cache.
pub const DEFAULT_BYTE_BUDGET: u64 = 256 << 20;

#[derive(Debug, Clone, serde_derive::Serialize, serde_derive::Deserialize)]
/// Configuration options for the page cache backing a reader.
pub struct CacheConfig {
    /// The size of cache pages in bytes.
    ///
    /// Must be a power of two. Defaults to 4KB.
    pub page_size: usize,
    /// The capacity of the cache.
    ///
    /// The kind of capacity selects the cache variant, see [CacheCapacity].
    pub capacity: CacheCapacity,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            capacity: CacheCapacity::ByteBudget(DEFAULT_BYTE_BUDGET),
        }
    }
}

impl CacheConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if !self.page_size.is_power_of_two() {
            return Err(ConfigError::InvalidPageSize(self.page_size));
        }

        let is_zero = match self.capacity {
            CacheCapacity::PageCount(pages) => pages == 0,
            CacheCapacity::ByteBudget(bytes) => bytes == 0,
        };
        if is_zero {
            return Err(ConfigError::ZeroCapacity);
        }

        Ok(())
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    serde_derive::Serialize,
    serde_derive::Deserialize,
)]
/// The capacity of a page cache.
pub enum CacheCapacity {
    /// Keep at most this many pages resident, displacing the least recently
    /// used page when full.
    PageCount(usize),
    /// Pre-instantiate a descriptor for every mapped page and bound the
    /// resident bytes by this budget, enforced by a background trimmer.
    ByteBudget(u64),
}

#[derive(Debug, thiserror::Error)]
/// The cache configuration is invalid.
pub enum ConfigError {
    #[error("page size must be a power of two, got {0}")]
    /// The configured page size is not a power of two.
    InvalidPageSize(usize),
    #[error("cache capacity must be non-zero")]
    /// The configured capacity is zero pages or zero bytes.
    ZeroCapacity,
}

/// A handle to a single page of a cache.
pub(crate) struct CacheSlot {
    /// The page descriptor.
    pub entry: Arc<PageEntry>,
    /// The index of the page following this one within the same segment,
    /// if the segment continues. Only produced by the segment-sized variant.
    pub chain: Option<u32>,
}

/// The capability shared by both cache variants.
///
/// The read facade is agnostic to the variant behind this trait.
pub(crate) trait PageCache: Send + Sync {
    /// Look up or create the page containing `va`.
    ///
    /// Returns `None` when the page base of `va` lies outside every mapped
    /// segment.
    fn get_or_create(&self, va: u64) -> Option<CacheSlot>;

    /// Step to the page following `slot` within the same segment without a
    /// fresh lookup.
    fn advance(&self, slot: &CacheSlot) -> Option<CacheSlot>;

    /// Run the entry read protocol for `va` against the slot's page.
    fn read_entry(&self, slot: &CacheSlot, va: u64, out: &mut [u8]) -> usize;

    /// Evict every resident page.
    fn flush(&self);

    /// Shut down the cache, releasing all buffers and stopping any
    /// background work.
    fn close(&self);

    /// The number of bytes currently held by resident pages.
    fn resident_bytes(&self) -> u64;
}

/// Tracks the resident byte total of a budget-bound cache.
///
/// Charges and credits happen under the owning page's write lock, so the
/// counter can never observe an eviction for bytes that were not charged.
pub(crate) struct PageBudget {
    current: AtomicU64,
    max: u64,
    wake_at: u64,
    low: u64,
}

impl PageBudget {
    /// The fraction of the budget at which the trimmer is woken.
    const WAKE_PCT: u64 = 95;
    /// The fraction of the budget the trimmer frees down to.
    const LOW_PCT: u64 = 60;

    pub(crate) fn new(max: u64) -> Self {
        Self {
            current: AtomicU64::new(0),
            max,
            wake_at: max / 100 * Self::WAKE_PCT,
            low: max / 100 * Self::LOW_PCT,
        }
    }

    #[inline]
    pub(crate) fn charge(&self, bytes: u64) {
        self.current.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn credit(&self, bytes: u64) {
        self.current.fetch_sub(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn max(&self) -> u64 {
        self.max
    }

    #[inline]
    pub(crate) fn needs_trim(&self) -> bool {
        self.current() >= self.wake_at
    }

    #[inline]
    pub(crate) fn above_low_watermark(&self) -> bool {
        self.current() > self.low
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[rstest::rstest]
    #[case::tiny(128)]
    #[case::default(4 << 10)]
    #[case::large(32 << 10)]
    fn test_valid_page_sizes(#[case] page_size: usize) {
        let config = CacheConfig {
            page_size,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[rstest::rstest]
    #[case::zero(0)]
    #[case::odd(3000)]
    #[case::off_by_one(4097)]
    fn test_invalid_page_sizes(#[case] page_size: usize) {
        let config = CacheConfig {
            page_size,
            ..CacheConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPageSize(size)) if size == page_size,
        ));
    }

    #[rstest::rstest]
    #[case::no_pages(CacheCapacity::PageCount(0))]
    #[case::no_bytes(CacheCapacity::ByteBudget(0))]
    fn test_zero_capacity(#[case] capacity: CacheCapacity) {
        let config = CacheConfig {
            capacity,
            ..CacheConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroCapacity)));
    }

    #[test]
    fn test_budget_thresholds() {
        let budget = PageBudget::new(1000);
        assert_eq!(budget.max(), 1000);
        assert!(!budget.needs_trim());
        assert!(!budget.above_low_watermark());

        budget.charge(700);
        assert!(!budget.needs_trim());
        assert!(budget.above_low_watermark());

        budget.charge(250);
        assert!(budget.needs_trim());

        budget.credit(350);
        assert!(!budget.needs_trim());
        assert_eq!(budget.current(), 600);
    }
}
