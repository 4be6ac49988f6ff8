//! Cost-aware admission control for decode work.
//!
//! The limiter bounds concurrent decodes by two budgets at once: a running
//! count and an estimated memory footprint. Work that fits runs immediately
//! on the worker context; work that does not is queued and re-examined every
//! time a slot is returned.
//!
//! Admission policy:
//!
//! ```text
//! allow(cost) = (used_memory + cost <= max_memory
//!                AND running < max_concurrency)
//!               OR running == 0
//! ```
//!
//! The `running == 0` clause means one oversized task may overshoot the
//! budget rather than starve forever. The counters are also checked and
//! charged in two steps, so concurrent submitters can overshoot by a bounded
//! amount; callers get throttling, not a hard ceiling.
//!
//! This component never fails: a task is either run now or queued, with no
//! bound on queue depth.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::config::{BudgetSettings, MIN_DECODE_CONCURRENCY, MIN_DECODE_MEMORY_BYTES};
use crate::pipeline::dispatch::{StageTask, WorkerSpawner};

/// Decode work plus the budget it was costed at.
struct QueuedDecode {
    cost: u64,
    work: Box<dyn FnOnce(DecodeSlot) + Send>,
}

/// Admission controller for costed decode work.
pub struct DecodeLimiter {
    /// Maximum decodes running at once.
    max_concurrency: AtomicU32,

    /// Maximum estimated decode memory in flight, in bytes.
    max_memory: AtomicU64,

    /// Decodes currently holding a slot.
    running: AtomicU32,

    /// Estimated bytes charged by running decodes.
    used_memory: AtomicU64,

    /// Work waiting for budget, in arrival order.
    pending: Mutex<VecDeque<QueuedDecode>>,

    /// Where admitted work runs.
    spawner: Arc<dyn WorkerSpawner>,

    /// Peak running count observed (for tuning).
    peak_running: AtomicU32,
}

impl DecodeLimiter {
    /// Creates a limiter with the given budget, running admitted work on
    /// `spawner`.
    pub fn new(budget: BudgetSettings, spawner: Arc<dyn WorkerSpawner>) -> Arc<Self> {
        Arc::new(Self {
            max_concurrency: AtomicU32::new(budget.max_concurrency),
            max_memory: AtomicU64::new(budget.max_memory_bytes),
            running: AtomicU32::new(0),
            used_memory: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
            spawner,
            peak_running: AtomicU32::new(0),
        })
    }

    /// Submits decode work costing `cost` bytes.
    ///
    /// Runs immediately on the worker context when the budget allows,
    /// otherwise queues. The work receives a [`DecodeSlot`] that returns the
    /// budget when dropped.
    pub fn submit(self: &Arc<Self>, cost: u64, work: impl FnOnce(DecodeSlot) + Send + 'static) {
        let entry = QueuedDecode {
            cost,
            work: Box::new(work),
        };

        if self.allow(cost) {
            self.charge(cost);
            debug!(
                cost,
                running = self.running(),
                used_memory = self.used_memory(),
                "decode admitted"
            );
            self.dispatch(entry);
            return;
        }

        let depth = {
            let mut pending = self.pending.lock().expect("pending queue lock poisoned");
            pending.push_back(entry);
            pending.len()
        };
        debug!(cost, depth, "decode queued");

        // The last running decode may have completed between the admission
        // check and the push; rescan so the entry is not stranded behind an
        // idle queue.
        if self.running.load(Ordering::SeqCst) == 0 {
            self.rescan();
        }
    }

    /// Updates the budget. Each limit is applied only if the new value is at
    /// least its floor; out-of-range values are ignored per field.
    pub fn set_budget(&self, max_concurrency: u32, max_memory_bytes: u64) {
        if max_concurrency >= MIN_DECODE_CONCURRENCY {
            self.max_concurrency.store(max_concurrency, Ordering::SeqCst);
        } else {
            warn!(
                requested = max_concurrency,
                floor = MIN_DECODE_CONCURRENCY,
                "max_concurrency below floor, ignored"
            );
        }

        if max_memory_bytes >= MIN_DECODE_MEMORY_BYTES {
            self.max_memory.store(max_memory_bytes, Ordering::SeqCst);
        } else {
            warn!(
                requested = max_memory_bytes,
                floor = MIN_DECODE_MEMORY_BYTES,
                "max_memory below floor, ignored"
            );
        }
    }

    /// Admission policy. The check and the charge are separate operations,
    /// so concurrent submitters can overshoot by at most one task each.
    fn allow(&self, cost: u64) -> bool {
        let running = self.running.load(Ordering::SeqCst);
        if running == 0 {
            return true;
        }
        let used = self.used_memory.load(Ordering::SeqCst);
        used + cost <= self.max_memory.load(Ordering::SeqCst)
            && running < self.max_concurrency.load(Ordering::SeqCst)
    }

    /// Accounts an admitted decode and tracks the peak.
    fn charge(&self, cost: u64) {
        let current = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.used_memory.fetch_add(cost, Ordering::SeqCst);

        let mut peak = self.peak_running.load(Ordering::Relaxed);
        while current > peak {
            match self.peak_running.compare_exchange_weak(
                peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }
    }

    /// Runs an already-charged entry on the worker context.
    fn dispatch(self: &Arc<Self>, entry: QueuedDecode) {
        let slot = DecodeSlot {
            limiter: Some(Arc::clone(self)),
            cost: entry.cost,
        };
        let work = entry.work;
        self.spawner.spawn(Box::new(move || work(slot)));
    }

    /// Returns one slot's budget and re-examines the queue.
    fn complete(self: &Arc<Self>, cost: u64) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.used_memory.fetch_sub(cost, Ordering::SeqCst);
        self.rescan();
    }

    /// Admits every queued entry the budget now allows, front to back.
    ///
    /// Entries that still do not fit are skipped in place, so a later small
    /// task can run ahead of an earlier one that exceeds the budget.
    /// Admissible entries are charged under the queue lock but dispatched
    /// after it is released, so a spawner that runs work inline cannot
    /// re-enter the lock.
    fn rescan(self: &Arc<Self>) {
        let mut admitted = Vec::new();
        {
            let mut pending = self.pending.lock().expect("pending queue lock poisoned");
            let mut index = 0;
            while index < pending.len() {
                if self.allow(pending[index].cost) {
                    if let Some(entry) = pending.remove(index) {
                        self.charge(entry.cost);
                        admitted.push(entry);
                    }
                } else {
                    index += 1;
                }
            }
        }

        for entry in admitted {
            debug!(
                cost = entry.cost,
                running = self.running(),
                used_memory = self.used_memory(),
                "queued decode admitted"
            );
            self.dispatch(entry);
        }
    }

    /// Decodes currently holding a slot.
    pub fn running(&self) -> u32 {
        self.running.load(Ordering::SeqCst)
    }

    /// Estimated bytes charged by running decodes.
    pub fn used_memory(&self) -> u64 {
        self.used_memory.load(Ordering::SeqCst)
    }

    /// Current concurrency limit.
    pub fn max_concurrency(&self) -> u32 {
        self.max_concurrency.load(Ordering::SeqCst)
    }

    /// Current memory limit in bytes.
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory.load(Ordering::SeqCst)
    }

    /// Entries waiting for budget.
    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .expect("pending queue lock poisoned")
            .len()
    }

    /// Peak running count observed.
    pub fn peak_running(&self) -> u32 {
        self.peak_running.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for DecodeLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeLimiter")
            .field("max_concurrency", &self.max_concurrency())
            .field("max_memory", &self.max_memory_bytes())
            .field("running", &self.running())
            .field("used_memory", &self.used_memory())
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

/// RAII admission slot handed to admitted decode work.
///
/// Holding the slot keeps its cost charged against the budget; dropping it
/// returns the budget and triggers a queue rescan. Moving the slot through
/// the decode and upload stages transfers that obligation with it, so the
/// budget is returned exactly once no matter where the work stops.
pub struct DecodeSlot {
    limiter: Option<Arc<DecodeLimiter>>,
    cost: u64,
}

impl DecodeSlot {
    /// The cost this slot charges while held.
    #[inline]
    pub fn cost(&self) -> u64 {
        self.cost
    }
}

impl Drop for DecodeSlot {
    fn drop(&mut self) {
        if let Some(limiter) = self.limiter.take() {
            limiter.complete(self.cost);
        }
    }
}

impl std::fmt::Debug for DecodeSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeSlot").field("cost", &self.cost).finish()
    }
}
