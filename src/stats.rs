use std::sync::atomic::{AtomicU64, Ordering};

/// Live read counters shared between the facade, the cache and the trimmer.
///
/// All counters are monotonically non-decreasing until explicitly reset.
#[derive(Default)]
pub(crate) struct CacheStats {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) multi_page_reads: AtomicU64,
    pub(crate) unaligned_reads: AtomicU64,
    pub(crate) page_outs: AtomicU64,
}

impl CacheStats {
    #[inline]
    pub(crate) fn incr_hits(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn incr_misses(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn incr_multi_page_reads(&self) {
        self.multi_page_reads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn incr_unaligned_reads(&self) {
        self.unaligned_reads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn incr_page_outs(&self) {
        self.page_outs.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of the counters.
    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            multi_page_reads: self.multi_page_reads.load(Ordering::Relaxed),
            unaligned_reads: self.unaligned_reads.load(Ordering::Relaxed),
            page_outs: self.page_outs.load(Ordering::Relaxed),
        }
    }

    /// Zero all counters.
    pub(crate) fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.multi_page_reads.store(0, Ordering::Relaxed);
        self.unaligned_reads.store(0, Ordering::Relaxed);
        self.page_outs.store(0, Ordering::Relaxed);
    }
}

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
/// A point-in-time copy of the cache counters.
pub struct StatsSnapshot {
    /// Reads satisfied by an already resident page.
    pub hits: u64,
    /// Reads that required a page to be created or filled.
    pub misses: u64,
    /// `read` calls that touched more than one page.
    pub multi_page_reads: u64,
    /// `read` calls whose start address was not page aligned.
    pub unaligned_reads: u64,
    /// Resident pages evicted by the trimmer or by LRU displacement.
    pub page_outs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_reset() {
        let stats = CacheStats::default();
        stats.incr_hits();
        stats.incr_hits();
        stats.incr_misses();
        stats.incr_multi_page_reads();
        stats.incr_unaligned_reads();
        stats.incr_page_outs();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.multi_page_reads, 1);
        assert_eq!(snapshot.unaligned_reads, 1);
        assert_eq!(snapshot.page_outs, 1);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
