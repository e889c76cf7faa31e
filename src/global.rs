//! Epoch manager built on a reference-counted chain of epoch nodes.

use crate::collector::{self, Collect};
use crate::error::Error;
use crate::reclaim::Reclaim;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;

/// Default collector period in milliseconds.
const DEFAULT_TICK_MS: u64 = 50;

/// Sentinel the collector CASes into `active_threads` to lock an epoch node
/// against late joiners while its garbage is being freed.
const LOCKED: i64 = i64::MIN;

/// One epoch in the chain.
///
/// Worker threads contend on `active_threads` (join/leave) and on the head of
/// the garbage list (retire). `next` is written only by the collector when it
/// appends the successor epoch.
struct EpochNode<T> {
    active_threads: AtomicI64,
    garbage_head: AtomicPtr<GarbageNode<T>>,
    next: AtomicPtr<EpochNode<T>>,
}

impl<T> EpochNode<T> {
    fn boxed() -> *mut Self {
        Box::into_raw(Box::new(Self {
            active_threads: AtomicI64::new(0),
            garbage_head: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// Wrapper linking one retired payload into an epoch's garbage list.
struct GarbageNode<T> {
    garbage: *mut T,
    next: *mut GarbageNode<T>,
}

/// Epoch-based reclamation with a globally shared active-thread counter.
///
/// Epoch nodes form a singly linked chain from the oldest unswept epoch to
/// the current one. Joining increments the tail node's counter; retiring
/// prepends onto the tail node's garbage list; the collector frees whole
/// epochs from the head of the chain once their counters drain to zero.
///
/// `reclaim`, `advance_epoch` and `tick` follow a single-collector contract:
/// they may be called from any thread, but never from two threads at once.
/// [`GlobalWriteEm::start_collector`] runs them from an internal task.
pub struct GlobalWriteEm<T: Reclaim> {
    /// Oldest epoch not yet swept. Collector-only.
    head_epoch: AtomicPtr<EpochNode<T>>,
    /// The epoch workers join and retire into. Moved only by the collector;
    /// read with acquire ordering by every worker.
    current_epoch: AtomicPtr<EpochNode<T>>,
    exited: AtomicBool,
    collector: Mutex<Option<JoinHandle<()>>>,
    tick_ms: AtomicU64,

    // Counters mirror the epoch chain's life: chain bookkeeping by the
    // collector, join/leave traffic by workers.
    nodes_retired: AtomicU64,
    nodes_freed: AtomicU64,
    epochs_created: AtomicU64,
    epochs_freed: AtomicU64,
    joins: AtomicU64,
    leaves: AtomicU64,
}

unsafe impl<T: Reclaim + Send> Send for GlobalWriteEm<T> {}
unsafe impl<T: Reclaim + Send> Sync for GlobalWriteEm<T> {}

impl<T: Reclaim> GlobalWriteEm<T> {
    /// Creates a manager whose chain holds a single empty epoch.
    ///
    /// No collector is started; call [`GlobalWriteEm::start_collector`] or
    /// drive [`GlobalWriteEm::tick`] externally.
    pub fn new() -> Self {
        let initial = EpochNode::<T>::boxed();
        Self {
            head_epoch: AtomicPtr::new(initial),
            current_epoch: AtomicPtr::new(initial),
            exited: AtomicBool::new(false),
            collector: Mutex::new(None),
            tick_ms: AtomicU64::new(DEFAULT_TICK_MS),
            nodes_retired: AtomicU64::new(0),
            nodes_freed: AtomicU64::new(0),
            epochs_created: AtomicU64::new(1),
            epochs_freed: AtomicU64::new(0),
            joins: AtomicU64::new(0),
            leaves: AtomicU64::new(0),
        }
    }

    /// Enters the current epoch.
    ///
    /// Nothing retired during or after the joined epoch will be freed before
    /// the returned guard drops. Loops on the tail snapshot: a negative
    /// counter means the collector locked that node between our load and the
    /// increment, so the refreshed tail is tried instead.
    pub fn join_epoch(&self) -> Result<EpochGuard<'_, T>, Error> {
        if self.exited.load(Ordering::Acquire) {
            return Err(Error::Exited);
        }

        loop {
            let epoch = self.current_epoch.load(Ordering::Acquire);
            // SAFETY: the tail node outlives every joiner; the collector
            // frees only non-tail nodes it has locked first.
            let previous = unsafe { (*epoch).active_threads.fetch_add(1, Ordering::AcqRel) };
            if previous >= 0 {
                self.joins.fetch_add(1, Ordering::Relaxed);
                return Ok(EpochGuard { node: epoch, em: self });
            }
            // Locked by the collector; reload the tail and try again.
        }
    }

    /// Hands a payload to the manager for deferred destruction.
    ///
    /// The wrapper is CAS-prepended onto the current epoch's garbage list.
    /// The current epoch cannot be swept while the retiring thread is inside
    /// an operation, so the snapshot taken here stays valid.
    ///
    /// # Safety
    ///
    /// `garbage` must be unreachable from the protected structure at the
    /// moment of the call, and must be destructible by `T::reclaim`.
    pub unsafe fn retire(&self, garbage: *mut T) -> Result<(), Error> {
        if self.exited.load(Ordering::Acquire) {
            return Err(Error::Exited);
        }

        let wrapper = Box::into_raw(Box::new(GarbageNode {
            garbage,
            next: ptr::null_mut(),
        }));

        let epoch = self.current_epoch.load(Ordering::Acquire);
        // SAFETY: same tail-lifetime argument as join_epoch.
        let list = unsafe { &(*epoch).garbage_head };

        let mut head = list.load(Ordering::Relaxed);
        loop {
            unsafe {
                (*wrapper).next = head;
            }
            match list.compare_exchange_weak(head, wrapper, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }

        self.nodes_retired.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Appends a fresh epoch node and moves `current_epoch` to it.
    ///
    /// Single-collector contract. Visibility lag is harmless: a worker that
    /// still sees the old tail merely joins an older epoch, which only delays
    /// reclamation.
    pub fn advance_epoch(&self) {
        let node = EpochNode::<T>::boxed();
        let old_tail = self.current_epoch.load(Ordering::Relaxed);
        // SAFETY: the tail is never freed while it is the tail.
        unsafe {
            (*old_tail).next.store(node, Ordering::Release);
        }
        self.current_epoch.store(node, Ordering::Release);
        self.epochs_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Sweeps drained epochs from the head of the chain.
    ///
    /// Single-collector contract. Each head node is first locked by CASing
    /// its counter from 0 to `i64::MIN`; a failed CAS means joiners are still
    /// inside (or were, when they fetched the counter) and the sweep stops
    /// there. Locking makes any late `fetch_add` observe a negative value
    /// and retry against the new tail.
    pub fn reclaim(&self) {
        loop {
            let head = self.head_epoch.load(Ordering::Relaxed);
            let current = self.current_epoch.load(Ordering::Acquire);
            if head.is_null() || head == current {
                return;
            }

            // SAFETY: head is non-null and only this collector frees it.
            let head_ref = unsafe { &*head };
            if head_ref
                .active_threads
                .compare_exchange(0, LOCKED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            let mut garbage = head_ref.garbage_head.load(Ordering::Acquire);
            while !garbage.is_null() {
                // SAFETY: the list is unreachable to workers once the epoch
                // is locked; each wrapper and payload is freed exactly once.
                let wrapper = unsafe { Box::from_raw(garbage) };
                unsafe {
                    T::reclaim(wrapper.garbage);
                }
                self.nodes_freed.fetch_add(1, Ordering::Relaxed);
                garbage = wrapper.next;
            }

            let next = head_ref.next.load(Ordering::Acquire);
            self.head_epoch.store(next, Ordering::Relaxed);
            // SAFETY: locked and unlinked; no worker can reach it anymore.
            unsafe {
                drop(Box::from_raw(head));
            }
            self.epochs_freed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// One collector period: sweep, then open a fresh epoch.
    ///
    /// Sweeping first keeps the collector from immediately locking the epoch
    /// a worker picked up between the two steps.
    pub fn tick(&self) {
        self.reclaim();
        self.advance_epoch();
    }

    /// Spawns the internal collector task, ticking every
    /// [`GlobalWriteEm::collect_interval`].
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

    /// Payloads handed to [`GlobalWriteEm::retire`] so far.
    pub fn nodes_retired(&self) -> u64 {
        self.nodes_retired.load(Ordering::Relaxed)
    }

    /// Payloads destroyed so far, including the final drain.
    pub fn nodes_freed(&self) -> u64 {
        self.nodes_freed.load(Ordering::Relaxed)
    }

    /// Epoch nodes created, counting the initial one.
    pub fn epochs_created(&self) -> u64 {
        self.epochs_created.load(Ordering::Relaxed)
    }

    /// Epoch nodes swept and freed.
    pub fn epochs_freed(&self) -> u64 {
        self.epochs_freed.load(Ordering::Relaxed)
    }

    /// Successful joins so far.
    pub fn joins(&self) -> u64 {
        self.joins.load(Ordering::Relaxed)
    }

    /// Guard drops so far.
    pub fn leaves(&self) -> u64 {
        self.leaves.load(Ordering::Relaxed)
    }
}

impl<T: Reclaim> Default for GlobalWriteEm<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Reclaim + Send + 'static> Collect for GlobalWriteEm<T> {
    fn tick(&self) {
        GlobalWriteEm::tick(self);
    }

    fn has_exited(&self) -> bool {
        GlobalWriteEm::has_exited(self)
    }

    fn collect_interval(&self) -> Duration {
        GlobalWriteEm::collect_interval(self)
    }
}

impl<T: Reclaim> Drop for GlobalWriteEm<T> {
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

        // With a null tail the sweep runs the chain down to nothing. All
        // guards have dropped (they borrow the manager), so every counter
        // is zero and each lock CAS succeeds.
        self.current_epoch.store(ptr::null_mut(), Ordering::Release);
        self.reclaim();
        debug_assert!(self.head_epoch.load(Ordering::Relaxed).is_null());

        debug!(
            "global em dropped: {} retired, {} freed, epochs {}/{} created/freed",
            self.nodes_retired(),
            self.nodes_freed(),
            self.epochs_created(),
            self.epochs_freed(),
        );
    }
}

/// Membership in an epoch of a [`GlobalWriteEm`].
///
/// Dropping the guard leaves the epoch: a single `fetch_sub`, no reload, no
/// retry. The possibly negative result after the collector locked the node
/// is expected and ignored.
pub struct EpochGuard<'a, T: Reclaim> {
    node: *mut EpochNode<T>,
    em: &'a GlobalWriteEm<T>,
}

impl<T: Reclaim> Drop for EpochGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the joined node cannot be freed while its counter is
        // positive, and this guard holds one unit of it.
        unsafe {
            (*self.node).active_threads.fetch_sub(1, Ordering::Release);
        }
        self.em.leaves.fetch_add(1, Ordering::Relaxed);
    }
}
