use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use foldhash::{HashMap, HashMapExt};
use parking_lot::Mutex;

use super::entry::{PageEntry, StoreAccess};
use super::trimmer::{TrimSignal, TrimWorker};
use super::{CacheSlot, PageBudget, PageCache};
use crate::buffer::BufferPool;
use crate::segment::SegmentMap;
use crate::stats::CacheStats;
use crate::store::BackingStore;
use crate::utils::{align_down, align_up};

/// A byte-budget page cache with a descriptor pre-instantiated for every
/// page of every mapped segment.
///
/// Descriptors never come and go, only their buffers do. Pages within a
/// segment are chained so a multi-page read walks forward without
/// re-hashing, chains terminate at segment boundaries. Resident bytes are
/// bounded by the budget, enforced asynchronously by a dedicated trim
/// worker thread.
pub(crate) struct SegmentPageCache {
    shared: Arc<SegmentedShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

pub(super) struct SegmentedShared {
    pub(super) pages: Box<[SegPage]>,
    lookup: HashMap<u64, u32>,
    page_size: u64,
    store: Arc<dyn BackingStore>,
    store_guard: Option<Mutex<()>>,
    pub(super) stats: Arc<CacheStats>,
    pub(super) budget: Arc<PageBudget>,
    pub(super) signal: TrimSignal,
    /// Monotonic age counter, incremented once per trim cycle. Readers
    /// stamp pages with its current value.
    pub(super) age: AtomicU64,
}

pub(super) struct SegPage {
    pub(super) entry: Arc<PageEntry>,
    next: Option<u32>,
}

impl SegmentPageCache {
    /// Create a new [SegmentPageCache] bounded by `max_bytes` and spawn
    /// its trim worker.
    pub(crate) fn new(
        store: Arc<dyn BackingStore>,
        segments: &SegmentMap,
        pool: Arc<BufferPool>,
        stats: Arc<CacheStats>,
        page_size: u64,
        max_bytes: u64,
    ) -> Self {
        let budget = Arc::new(PageBudget::new(max_bytes));

        let mut pages = Vec::new();
        let mut lookup = HashMap::new();
        for segment in segments.segments() {
            let mut base = align_up(segment.va, page_size);
            while base < segment.end() {
                let index = pages.len() as u32;
                let len = page_size.min(segment.end() - base) as usize;
                let has_next = base + page_size < segment.end();

                let entry = Arc::new(PageEntry::new(
                    base,
                    segment.file_offset_of(base),
                    len,
                    pool.clone(),
                    Some(budget.clone()),
                ));

                pages.push(SegPage {
                    entry,
                    next: has_next.then_some(index + 1),
                });
                lookup.entry(base).or_insert(index);

                base += page_size;
            }
        }

        tracing::debug!(
            num_pages = pages.len(),
            num_segments = segments.len(),
            page_size = page_size,
            "segment cache pre-sized with {budget} budget",
            budget = humansize::format_size(max_bytes, humansize::DECIMAL),
        );

        let shared = Arc::new(SegmentedShared {
            pages: pages.into_boxed_slice(),
            lookup,
            page_size,
            store_guard: (!store.is_thread_safe()).then(|| Mutex::new(())),
            store,
            stats,
            budget,
            signal: TrimSignal::new(),
            age: AtomicU64::new(0),
        });

        let worker = TrimWorker::new(shared.clone());
        let handle = std::thread::Builder::new()
            .name("vmcache_trim_worker".to_string())
            .spawn(move || worker.run())
            .expect("spawn cache trim worker");

        Self {
            shared,
            worker: Mutex::new(Some(handle)),
        }
    }

    fn slot_at(&self, index: u32) -> CacheSlot {
        let page = &self.shared.pages[index as usize];
        CacheSlot {
            entry: page.entry.clone(),
            chain: page.next,
        }
    }
}

impl PageCache for SegmentPageCache {
    fn get_or_create(&self, va: u64) -> Option<CacheSlot> {
        let base = align_down(va, self.shared.page_size);
        let index = *self.shared.lookup.get(&base)?;
        Some(self.slot_at(index))
    }

    fn advance(&self, slot: &CacheSlot) -> Option<CacheSlot> {
        Some(self.slot_at(slot.chain?))
    }

    fn read_entry(&self, slot: &CacheSlot, va: u64, out: &mut [u8]) -> usize {
        let access = StoreAccess {
            store: &*self.shared.store,
            guard: self.shared.store_guard.as_ref(),
        };
        let stamp = self.shared.age.load(Ordering::Relaxed);
        let result = slot.entry.read(&access, stamp, va, out);

        if result.fresh {
            self.shared.stats.incr_misses();
            if self.shared.budget.needs_trim() {
                self.shared.signal.wake();
            }
        } else {
            self.shared.stats.incr_hits();
        }

        result.copied
    }

    fn flush(&self) {
        for page in self.shared.pages.iter() {
            if page.entry.evict() > 0 {
                self.shared.stats.incr_page_outs();
            }
        }
    }

    fn close(&self) {
        let maybe_handle = self.worker.lock().take();
        if let Some(handle) = maybe_handle {
            self.shared.signal.shutdown();
            let _ = handle.join();
        }
        self.flush();
    }

    fn resident_bytes(&self) -> u64 {
        self.shared.budget.current()
    }
}

impl Drop for SegmentPageCache {
    fn drop(&mut self) {
        PageCache::close(self);
    }
}
