use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::{cmp, mem};

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};

use super::PageBudget;
use crate::buffer::BufferPool;
use crate::store::BackingStore;

/// The residency state of a page.
enum PageSlot {
    /// No buffer is materialised, the descriptor is only a reservation.
    Vacant,
    /// The page holds `len` valid bytes at the front of `buf`.
    Resident { buf: Box<[u8]>, len: usize },
    /// A fill returned zero bytes, the page is permanently empty.
    Exhausted,
}

/// Backing store access for a page fill.
///
/// When the store is not thread safe the fill acquires the shared guard
/// lock so the store only ever observes one read at a time.
pub(crate) struct StoreAccess<'a> {
    pub store: &'a dyn BackingStore,
    pub guard: Option<&'a Mutex<()>>,
}

impl StoreAccess<'_> {
    fn read(&self, file_offset: u64, out: &mut [u8]) -> usize {
        match self.guard {
            Some(guard) => {
                let _held = guard.lock();
                self.store.read(file_offset, out)
            },
            None => self.store.read(file_offset, out),
        }
    }
}

/// The outcome of a single [PageEntry::read] call.
pub(crate) struct EntryRead {
    /// The number of bytes copied into the caller's buffer.
    pub copied: usize,
    /// `true` if this call performed the backing store read for the page.
    pub fresh: bool,
}

/// A single cache page.
///
/// The geometry of the page is fixed at creation, only the residency of
/// its buffer changes. Every state change happens under the entry's
/// reader-writer lock, so a reader holding the shared lock can never see
/// the buffer vanish mid-copy.
pub(crate) struct PageEntry {
    base_va: u64,
    file_offset: u64,
    declared_len: usize,
    /// Last-access stamp, written on every successful read.
    stamp: AtomicU64,
    slot: RwLock<PageSlot>,
    pool: Arc<BufferPool>,
    budget: Option<Arc<PageBudget>>,
}

impl PageEntry {
    /// Create a new vacant [PageEntry].
    ///
    /// `base_va` must be page aligned and `declared_len` must not exceed
    /// the pool's page size.
    pub(crate) fn new(
        base_va: u64,
        file_offset: u64,
        declared_len: usize,
        pool: Arc<BufferPool>,
        budget: Option<Arc<PageBudget>>,
    ) -> Self {
        debug_assert!(declared_len <= pool.page_size());
        Self {
            base_va,
            file_offset,
            declared_len,
            stamp: AtomicU64::new(0),
            slot: RwLock::new(PageSlot::Vacant),
            pool,
            budget,
        }
    }

    #[inline]
    /// The page-aligned virtual address of the first byte of the page.
    pub(crate) fn base_va(&self) -> u64 {
        self.base_va
    }

    #[inline]
    /// The virtual address one past the declared end of the page.
    pub(crate) fn end_va(&self) -> u64 {
        self.base_va + self.declared_len as u64
    }

    #[inline]
    /// The last-access stamp of the page.
    pub(crate) fn stamp(&self) -> u64 {
        self.stamp.load(Ordering::Relaxed)
    }

    /// Returns `true` if the page currently holds a buffer.
    pub(crate) fn is_resident(&self) -> bool {
        matches!(&*self.slot.read(), PageSlot::Resident { .. })
    }

    /// The capacity of the resident buffer, `0` if the page is not
    /// resident.
    pub(crate) fn resident_capacity(&self) -> usize {
        match &*self.slot.read() {
            PageSlot::Resident { buf, .. } => buf.len(),
            _ => 0,
        }
    }

    /// Copy bytes starting at `va` into `out`.
    ///
    /// `va` must lie within `[base_va, base_va + declared_len)`. If the
    /// page is vacant it is filled from the backing store first. A fill
    /// that comes up short shrinks the readable length of the page, a fill
    /// returning zero bytes marks the page permanently empty.
    pub(crate) fn read(
        &self,
        access: &StoreAccess<'_>,
        stamp: u64,
        va: u64,
        out: &mut [u8],
    ) -> EntryRead {
        debug_assert!(self.base_va <= va && va < self.end_va());

        {
            let slot = self.slot.read();
            match &*slot {
                PageSlot::Resident { buf, len } => {
                    let copied = self.copy_out(buf, *len, va, out);
                    self.stamp.store(stamp, Ordering::Relaxed);
                    return EntryRead {
                        copied,
                        fresh: false,
                    };
                },
                PageSlot::Exhausted => {
                    return EntryRead {
                        copied: 0,
                        fresh: false,
                    };
                },
                PageSlot::Vacant => {},
            }
        }

        let mut slot = self.slot.write();

        // Another reader may have materialised the page while we waited on
        // the write lock.
        let mut fresh = false;
        if matches!(&*slot, PageSlot::Vacant) {
            fresh = true;

            let mut buf = self.pool.rent();
            let len = access.read(self.file_offset, &mut buf[..self.declared_len]);

            if len == 0 {
                self.pool.release(buf);
                *slot = PageSlot::Exhausted;
                return EntryRead { copied: 0, fresh };
            }

            if let Some(budget) = &self.budget {
                budget.charge(buf.len() as u64);
            }
            *slot = PageSlot::Resident { buf, len };
        }

        let slot = RwLockWriteGuard::downgrade(slot);
        match &*slot {
            PageSlot::Resident { buf, len } => {
                let copied = self.copy_out(buf, *len, va, out);
                self.stamp.store(stamp, Ordering::Relaxed);
                EntryRead { copied, fresh }
            },
            PageSlot::Exhausted => EntryRead { copied: 0, fresh },
            PageSlot::Vacant => unreachable!("page cannot be vacant after fill"),
        }
    }

    /// Strip the resident buffer, returning it to the pool.
    ///
    /// Returns the number of bytes freed. An exhausted page stays
    /// exhausted.
    pub(crate) fn evict(&self) -> usize {
        let mut slot = self.slot.write();
        match mem::replace(&mut *slot, PageSlot::Vacant) {
            PageSlot::Resident { buf, .. } => {
                let freed = buf.len();
                if let Some(budget) = &self.budget {
                    budget.credit(freed as u64);
                }
                self.pool.release(buf);
                freed
            },
            other => {
                *slot = other;
                0
            },
        }
    }

    fn copy_out(&self, buf: &[u8], len: usize, va: u64, out: &mut [u8]) -> usize {
        let offset = (va - self.base_va) as usize;
        if offset >= len {
            return 0;
        }

        let n = cmp::min(out.len(), len - offset);
        out[..n].copy_from_slice(&buf[offset..offset + n]);
        n
    }
}

impl Drop for PageEntry {
    fn drop(&mut self) {
        let slot = mem::replace(self.slot.get_mut(), PageSlot::Vacant);
        if let PageSlot::Resident { buf, .. } = slot {
            if let Some(budget) = &self.budget {
                budget.credit(buf.len() as u64);
            }
            self.pool.release(buf);
        }
    }
}
