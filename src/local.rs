//! Epoch manager whose worker fast path is one write to a per-core slot.

use crate::collector::{self, Collect};
use crate::error::Error;
use crate::pad::CachePadded;
use crate::pool::EpochClock;
use crate::reclaim::Reclaim;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;

const DEFAULT_TICK_MS: u64 = 50;

/// One retired payload, stamped with the epoch at which it left the
/// protected structure.
struct RetiredNode<T> {
    deleted_epoch: u64,
    garbage: *mut T,
    next: AtomicPtr<RetiredNode<T>>,
}

/// Epoch-based reclamation with per-core epoch announcements.
///
/// Instead of maintaining a shared active-thread count, each worker writes
/// the epoch it observed into its own cache-line-padded slot right before
/// every operation on the protected structure ([`LocalWriteEm::announce`]).
/// That store stays in the worker's L1 between ticks; the only cross-core
/// traffic is the collector reading all slots once per tick to compute the
/// minimum announced epoch, below which retired garbage is freed.
///
/// `advance_epoch`, `collect` and `tick` follow a single-collector contract:
/// any thread may run them, but never two threads at once.
pub struct LocalWriteEm<T: Reclaim> {
    /// Slot `i` is written only by workers that claim core affinity `i`.
    slots: Box<[CachePadded<AtomicU64>]>,
    /// The global epoch. Workers read it; the collector advances it.
    epoch: CachePadded<AtomicU64>,
    /// Head of the retired LIFO. Workers CAS-prepend; the collector unlinks
    /// successors but never the head itself.
    retired_head: AtomicPtr<RetiredNode<T>>,
    exited: AtomicBool,
    collector: Mutex<Option<JoinHandle<()>>>,
    tick_ms: AtomicU64,

    nodes_retired: AtomicU64,
    nodes_freed: AtomicU64,
}

unsafe impl<T: Reclaim + Send> Send for LocalWriteEm<T> {}
unsafe impl<T: Reclaim + Send> Sync for LocalWriteEm<T> {}

impl<T: Reclaim> LocalWriteEm<T> {
    /// Creates a manager with `core_num` announcement slots.
    ///
    /// `core_num` must be at least 1. Slot and epoch counters start at 0.
    pub fn new(core_num: usize) -> Self {
        assert!(core_num >= 1, "need at least one announcement slot");

        let slots = (0..core_num)
            .map(|_| CachePadded::new(AtomicU64::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            epoch: CachePadded::new(AtomicU64::new(0)),
            retired_head: AtomicPtr::new(ptr::null_mut()),
            exited: AtomicBool::new(false),
            collector: Mutex::new(None),
            tick_ms: AtomicU64::new(DEFAULT_TICK_MS),
            nodes_retired: AtomicU64::new(0),
            nodes_freed: AtomicU64::new(0),
        }
    }

    /// Number of announcement slots.
    pub fn core_num(&self) -> usize {
        self.slots.len()
    }

    /// Publishes the current epoch into `slot[core_id]`.
    ///
    /// Call immediately before each operation on the protected structure.
    /// Once this store is visible, no garbage retired in an epoch at or
    /// after the announced one can be freed until the next announcement.
    /// The load must precede the store; this pair is the entire fast path.
    #[inline]
    pub fn announce(&self, core_id: usize) {
        debug_assert!(core_id < self.slots.len(), "core id out of range");
        let epoch = self.epoch.load(Ordering::Acquire);
        self.slots[core_id].store(epoch, Ordering::Release);
    }

    /// Hands a payload to the manager for deferred destruction.
    ///
    /// The entry is stamped with the current global epoch, which is at or
    /// after the epoch the retiring worker announced, and CAS-prepended onto
    /// the retired LIFO.
    ///
    /// # Safety
    ///
    /// `garbage` must be unreachable from the protected structure at the
    /// moment of the call, and must be destructible by `T::reclaim`.
    pub unsafe fn retire(&self, garbage: *mut T) -> Result<(), Error> {
        if self.exited.load(Ordering::Acquire) {
            return Err(Error::Exited);
        }

        let node = Box::into_raw(Box::new(RetiredNode {
            deleted_epoch: self.epoch.load(Ordering::Acquire),
            garbage,
            next: AtomicPtr::new(ptr::null_mut()),
        }));

        let mut head = self.retired_head.load(Ordering::Relaxed);
        loop {
            unsafe {
                (*node).next.store(head, Ordering::Relaxed);
            }
            match self.retired_head.compare_exchange_weak(
                head,
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }

        self.nodes_retired.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Advances the global epoch by one. Single-collector contract.
    pub fn advance_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// The current global epoch.
    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// The minimum epoch announced across all slots.
    ///
    /// Garbage retired strictly before this bound is safe to free: every
    /// worker's next announcement can only raise its slot.
    pub fn safe_epoch(&self) -> u64 {
        let mut min = u64::MAX;
        for slot in self.slots.iter() {
            min = min.min(slot.load(Ordering::Acquire));
        }
        min
    }

    /// Frees retired entries older than the minimum announced epoch.
    ///
    /// Single-collector contract; a no-op once the manager is exiting (the
    /// drain sweep takes over). The list head is deliberately left in place:
    /// workers CAS new entries onto it concurrently, and unlinking it here
    /// would race those prepends. The cost is at most one surviving entry
    /// per sweep.
    pub fn collect(&self) {
        if self.exited.load(Ordering::Acquire) {
            return;
        }

        let min_epoch = self.safe_epoch();

        let pred = self.retired_head.load(Ordering::Acquire);
        if pred.is_null() {
            return;
        }
        let mut pred = pred;
        // SAFETY: linked entries are freed only by this collector, and the
        // predecessor is always a node this sweep has decided to keep.
        let mut current = unsafe { (*pred).next.load(Ordering::Acquire) };

        while !current.is_null() {
            let node = unsafe { &*current };
            if node.deleted_epoch < min_epoch {
                let next = node.next.load(Ordering::Relaxed);
                unsafe {
                    (*pred).next.store(next, Ordering::Relaxed);
                }
                let garbage = node.garbage;
                unsafe {
                    T::reclaim(garbage);
                    drop(Box::from_raw(current));
                }
                self.nodes_freed.fetch_add(1, Ordering::Relaxed);
                current = next;
            } else {
                pred = current;
                current = node.next.load(Ordering::Acquire);
            }
        }
    }

    /// One collector period: advance the epoch, then sweep.
    ///
    /// Advancing first means anything retired just before the tick is at
    /// least one full epoch behind the slots read during the sweep.
    pub fn tick(&self) {
        self.advance_epoch();
        self.collect();
    }

    /// Spawns the internal collector task, ticking every
    /// [`LocalWriteEm::collect_interval`].
    ///
    /// The task holds the manager weakly, so the caller's clone is consumed
    /// here without extending the manager's lifetime.
    pub fn start_collector(self: Arc<Self>) -> Result<(), Error>
    where
        T: Send + 'static,
    {
        if self.exited.load(Ordering::Acquire) {
            return Err(Error::Exited);
        }
        let mut slot = self.collector.lock().expect("collector mutex poisoned");
        if slot.is_some() {
            return Err(Error::CollectorRunning);
        }
        *slot = Some(collector::spawn(Arc::downgrade(&self)));
        Ok(())
    }

    /// Tells the collector (internal or external) to stop. Idempotent.
    pub fn signal_exit(&self) {
        self.exited.store(true, Ordering::Release);
    }

    /// Whether `signal_exit` has been called.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Sets the collector period. Takes effect from the next wake.
    ///
    /// Must be at least one millisecond.
    pub fn set_collect_interval(&self, interval: Duration) {
        debug_assert!(interval >= Duration::from_millis(1));
        self.tick_ms
            .store((interval.as_millis() as u64).max(1), Ordering::Relaxed);
    }

    /// The current collector period.
    pub fn collect_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms.load(Ordering::Relaxed))
    }

    /// Payloads handed to [`LocalWriteEm::retire`] so far.
    pub fn nodes_retired(&self) -> u64 {
        self.nodes_retired.load(Ordering::Relaxed)
    }

    /// Payloads destroyed so far, including the final drain.
    pub fn nodes_freed(&self) -> u64 {
        self.nodes_freed.load(Ordering::Relaxed)
    }

    /// Frees every remaining retired entry regardless of epoch.
    ///
    /// Only sound single-threaded, after workers and the collector have
    /// stopped; the destructor runs it last.
    fn sweep_all(&mut self) {
        let mut current = *self.retired_head.get_mut();
        while !current.is_null() {
            // SAFETY: no concurrent access remains; each entry and payload
            // is freed exactly once.
            let node = unsafe { Box::from_raw(current) };
            unsafe {
                T::reclaim(node.garbage);
            }
            self.nodes_freed.fetch_add(1, Ordering::Relaxed);
            current = node.next.load(Ordering::Relaxed);
        }
        *self.retired_head.get_mut() = ptr::null_mut();
    }
}

impl<T: Reclaim + Send + 'static> Collect for LocalWriteEm<T> {
    fn tick(&self) {
        LocalWriteEm::tick(self);
    }

    fn has_exited(&self) -> bool {
        LocalWriteEm::has_exited(self)
    }

    fn collect_interval(&self) -> Duration {
        LocalWriteEm::collect_interval(self)
    }
}

impl<T: Reclaim> EpochClock for LocalWriteEm<T> {
    fn current_epoch(&self) -> u64 {
        LocalWriteEm::current_epoch(self)
    }

    fn safe_epoch(&self) -> u64 {
        LocalWriteEm::safe_epoch(self)
    }
}

impl<T: Reclaim> Drop for LocalWriteEm<T> {
    fn drop(&mut self) {
        self.signal_exit();
        if let Some(handle) = self
            .collector
            .get_mut()
            .expect("collector mutex poisoned")
            .take()
        {
            let _ = handle.join();
        }

        self.sweep_all();

        debug!(
            "local em dropped: {} retired, {} freed",
            self.nodes_retired(),
            self.nodes_freed(),
        );
    }
}
