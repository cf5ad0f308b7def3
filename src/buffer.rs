use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

/// A pool of fixed-size page buffers.
///
/// Rented buffers always have a length equal to the pool's page size. The
/// contents of a rented buffer are undefined, buffers are not cleared on
/// return.
///
/// Releasing a buffer of any other length is permitted, but such buffers are
/// dropped instead of being pooled.
pub(crate) struct BufferPool {
    page_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<Box<[u8]>>>,
    outstanding: AtomicI64,
}

impl BufferPool {
    /// Create a new [BufferPool] producing buffers of `page_size` bytes
    /// and retaining at most `max_idle` free buffers.
    pub(crate) fn new(page_size: usize, max_idle: usize) -> Self {
        Self {
            page_size,
            max_idle,
            idle: Mutex::new(Vec::new()),
            outstanding: AtomicI64::new(0),
        }
    }

    /// Rent a buffer of exactly `page_size` bytes from the pool.
    pub(crate) fn rent(&self) -> Box<[u8]> {
        self.outstanding.fetch_add(1, Ordering::Relaxed);

        let maybe_buffer = self.idle.lock().pop();
        match maybe_buffer {
            Some(buffer) => buffer,
            None => vec![0u8; self.page_size].into_boxed_slice(),
        }
    }

    /// Return a buffer to the pool.
    pub(crate) fn release(&self, buffer: Box<[u8]>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);

        if buffer.len() != self.page_size {
            return;
        }

        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buffer);
        }
    }

    #[inline]
    /// Returns the size of the buffers produced by the pool.
    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the number of rented buffers not yet returned.
    pub(crate) fn outstanding(&self) -> i64 {
        self.outstanding.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}
