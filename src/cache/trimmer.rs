use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::entry::PageEntry;
use super::segmented::SegmentedShared;

/// Maximum time the trim worker sleeps before re-checking for shutdown.
const TRIM_TICK: Duration = Duration::from_secs(10);
/// Minimum interval between trim status info logs.
const INFO_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// The wake event connecting page fills to the trim worker.
pub(super) struct TrimSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

#[derive(Default)]
struct SignalState {
    wake: bool,
    done: bool,
}

impl TrimSignal {
    pub(super) fn new() -> Self {
        Self {
            state: Mutex::new(SignalState::default()),
            cond: Condvar::new(),
        }
    }

    /// Request a trim cycle.
    pub(super) fn wake(&self) {
        let mut state = self.state.lock();
        state.wake = true;
        self.cond.notify_one();
    }

    /// Tell the worker to exit.
    pub(super) fn shutdown(&self) {
        let mut state = self.state.lock();
        state.done = true;
        self.cond.notify_one();
    }

    /// Block until woken or `timeout` elapses.
    ///
    /// Returns `true` when the worker should exit.
    fn wait(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.done {
            return true;
        }

        if !state.wake {
            let _ = self.cond.wait_for(&mut state, timeout);
        }

        if state.done {
            return true;
        }
        state.wake = false;
        false
    }
}

/// The background worker keeping a segment-sized cache under its byte
/// budget.
///
/// The worker owns a monotonic age counter. Readers stamp pages with the
/// current age, the worker increments it once per cycle and pages out in
/// up to three passes: really-old pages first, then anything not touched
/// this cycle, then whatever remains in traversal order until the cache is
/// below its low watermark.
pub(super) struct TrimWorker {
    shared: Arc<SegmentedShared>,
    last_info_log: Instant,
    freed_window: u64,
    pages_out_window: usize,
}

impl TrimWorker {
    pub(super) fn new(shared: Arc<SegmentedShared>) -> Self {
        Self {
            shared,
            last_info_log: Instant::now(),
            freed_window: 0,
            pages_out_window: 0,
        }
    }

    pub(super) fn run(mut self) {
        tracing::debug!("cache trim thread is starting...");

        loop {
            let exit = self.shared.signal.wait(TRIM_TICK);
            if exit {
                tracing::debug!("cache trim thread is exiting");
                break;
            }

            self.run_trim_cycle();
            self.log_trim_info();
        }
    }

    fn run_trim_cycle(&mut self) {
        if !self.shared.budget.needs_trim() {
            return;
        }

        let age = self.shared.age.fetch_add(1, Ordering::Relaxed) + 1;

        let mut freed = 0u64;
        let mut paged_out = 0usize;

        // Pass 1: pages untouched for at least half the cache's lifetime.
        for page in self.shared.pages.iter() {
            let entry = &page.entry;
            if entry.is_resident() && entry.stamp() < age / 2 {
                freed += self.page_out(entry, &mut paged_out);
            }
        }

        // Pass 2: anything not touched during this cycle.
        if self.shared.budget.above_low_watermark() {
            for page in self.shared.pages.iter() {
                let entry = &page.entry;
                if entry.is_resident() && entry.stamp() < age {
                    freed += self.page_out(entry, &mut paged_out);
                }
            }
        }

        // Pass 3: traversal order until below the low watermark.
        for page in self.shared.pages.iter() {
            if !self.shared.budget.above_low_watermark() {
                break;
            }
            if page.entry.is_resident() {
                freed += self.page_out(&page.entry, &mut paged_out);
            }
        }

        self.freed_window += freed;
        self.pages_out_window += paged_out;

        tracing::debug!(
            age = age,
            paged_out = paged_out,
            freed = %humansize::format_size(freed, humansize::DECIMAL),
            resident = %humansize::format_size(
                self.shared.budget.current(),
                humansize::DECIMAL,
            ),
            budget = %humansize::format_size(
                self.shared.budget.max(),
                humansize::DECIMAL,
            ),
            "trim cycle complete",
        );
    }

    fn page_out(&self, entry: &PageEntry, paged_out: &mut usize) -> u64 {
        let freed = entry.evict() as u64;
        if freed > 0 {
            self.shared.stats.incr_page_outs();
            *paged_out += 1;
        }
        freed
    }

    fn log_trim_info(&mut self) {
        if self.last_info_log.elapsed() < INFO_LOG_INTERVAL {
            return;
        }
        if self.pages_out_window == 0 {
            return;
        }

        tracing::info!(
            "cache trim status freed: {freed} over {pages} pages, resident: {resident}",
            freed = humansize::format_size(self.freed_window, humansize::DECIMAL),
            pages = self.pages_out_window,
            resident = humansize::format_size(
                self.shared.budget.current(),
                humansize::DECIMAL,
            ),
        );

        self.freed_window = 0;
        self.pages_out_window = 0;
        self.last_info_log = Instant::now();
    }
}
