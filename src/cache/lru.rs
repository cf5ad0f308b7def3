use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use foldhash::{HashMap, HashMapExt};
use parking_lot::Mutex;

use super::entry::{PageEntry, StoreAccess};
use super::{CacheSlot, PageCache};
use crate::buffer::BufferPool;
use crate::segment::SegmentMap;
use crate::stats::CacheStats;
use crate::store::BackingStore;
use crate::utils::align_down;

const NIL: u32 = u32::MAX;

/// A fixed-count page cache with least-recently-used displacement.
///
/// Pages are keyed by their page-aligned virtual address. The lookup map
/// and the recency list live behind a single mutex whose critical sections
/// are all O(1). The recency list is index linked within a slot arena, so
/// eviction reuses the slot and only the page buffer itself is recycled
/// through the pool.
pub(crate) struct LruPageCache {
    store: Arc<dyn BackingStore>,
    store_guard: Option<Mutex<()>>,
    segments: Arc<SegmentMap>,
    pool: Arc<BufferPool>,
    stats: Arc<CacheStats>,
    page_size: u64,
    capacity: usize,
    /// Source of last-access stamps, bumped on every read.
    seq: AtomicU64,
    state: Mutex<LruState>,
}

impl LruPageCache {
    /// Create a new [LruPageCache] holding at most `capacity` pages.
    pub(crate) fn new(
        store: Arc<dyn BackingStore>,
        segments: Arc<SegmentMap>,
        pool: Arc<BufferPool>,
        stats: Arc<CacheStats>,
        page_size: u64,
        capacity: usize,
    ) -> Self {
        tracing::debug!(
            capacity = capacity,
            page_size = page_size,
            "lru page cache has capacity for {memory_target}",
            memory_target = humansize::format_size(
                capacity as u64 * page_size,
                humansize::DECIMAL,
            ),
        );

        let store_guard = (!store.is_thread_safe()).then(|| Mutex::new(()));

        Self {
            store,
            store_guard,
            segments,
            pool,
            stats,
            page_size,
            capacity,
            seq: AtomicU64::new(0),
            state: Mutex::new(LruState {
                lookup: HashMap::with_capacity(capacity),
                slots: Vec::with_capacity(capacity),
                head: NIL,
                tail: NIL,
            }),
        }
    }
}

impl PageCache for LruPageCache {
    fn get_or_create(&self, va: u64) -> Option<CacheSlot> {
        let base = align_down(va, self.page_size);

        let mut state = self.state.lock();

        if let Some(&index) = state.lookup.get(&base) {
            self.stats.incr_hits();
            state.move_to_front(index);
            return Some(CacheSlot {
                entry: state.slots[index as usize].entry.clone(),
                chain: None,
            });
        }

        // The descriptor geometry requires the page base itself to be
        // mapped, an unmapped base reads as zero bytes.
        let span = self.segments.page_span(base, self.page_size)?;
        self.stats.incr_misses();

        let entry = Arc::new(PageEntry::new(
            base,
            span.file_offset,
            span.len,
            self.pool.clone(),
            None,
        ));

        let index = if state.slots.len() < self.capacity {
            let index = state.slots.len() as u32;
            state.slots.push(LruSlot {
                base,
                entry: entry.clone(),
                prev: NIL,
                next: NIL,
            });
            index
        } else {
            let index = state.tail;
            state.detach(index);

            let old_base = state.slots[index as usize].base;
            state.lookup.remove(&old_base);

            let slot = &mut state.slots[index as usize];
            slot.base = base;
            let evicted = mem::replace(&mut slot.entry, entry.clone());

            if evicted.evict() > 0 {
                self.stats.incr_page_outs();
            }
            index
        };

        state.push_front(index);
        state.lookup.insert(base, index);

        Some(CacheSlot { entry, chain: None })
    }

    fn advance(&self, _slot: &CacheSlot) -> Option<CacheSlot> {
        None
    }

    fn read_entry(&self, slot: &CacheSlot, va: u64, out: &mut [u8]) -> usize {
        debug_assert_eq!(align_down(va, self.page_size), slot.entry.base_va());

        let access = StoreAccess {
            store: &*self.store,
            guard: self.store_guard.as_ref(),
        };
        let stamp = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        slot.entry.read(&access, stamp, va, out).copied
    }

    fn flush(&self) {
        let mut state = self.state.lock();
        state.lookup.clear();
        state.head = NIL;
        state.tail = NIL;
        for slot in state.slots.drain(..) {
            if slot.entry.evict() > 0 {
                self.stats.incr_page_outs();
            }
        }
    }

    fn close(&self) {
        self.flush();
    }

    fn resident_bytes(&self) -> u64 {
        let state = self.state.lock();
        state
            .slots
            .iter()
            .map(|slot| slot.entry.resident_capacity() as u64)
            .sum()
    }
}

struct LruState {
    lookup: HashMap<u64, u32>,
    slots: Vec<LruSlot>,
    /// Most recently used slot.
    head: u32,
    /// Least recently used slot.
    tail: u32,
}

struct LruSlot {
    base: u64,
    entry: Arc<PageEntry>,
    prev: u32,
    next: u32,
}

impl LruState {
    fn detach(&mut self, index: u32) {
        let (prev, next) = {
            let slot = &self.slots[index as usize];
            (slot.prev, slot.next)
        };

        if prev != NIL {
            self.slots[prev as usize].next = next;
        } else {
            self.head = next;
        }

        if next != NIL {
            self.slots[next as usize].prev = prev;
        } else {
            self.tail = prev;
        }

        let slot = &mut self.slots[index as usize];
        slot.prev = NIL;
        slot.next = NIL;
    }

    fn push_front(&mut self, index: u32) {
        let old_head = self.head;

        {
            let slot = &mut self.slots[index as usize];
            slot.prev = NIL;
            slot.next = old_head;
        }

        if old_head != NIL {
            self.slots[old_head as usize].prev = index;
        } else {
            self.tail = index;
        }
        self.head = index;
    }

    fn move_to_front(&mut self, index: u32) {
        if self.head != index {
            self.detach(index);
            self.push_front(index);
        }
    }
}
