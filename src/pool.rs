//! Lock-free variable-length allocator over a chain of bump chunks.

use crate::error::Error;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::alloc::{self, Layout};
use std::sync::Arc;

use log::debug;

/// Bytes reserved in front of every allocation for the owning-chunk
/// back-pointer. The user pointer sits immediately after it.
const BACKREF_BYTES: usize = 8;

/// Allocation granularity; every returned pointer is aligned to this.
const ALIGN: usize = 8;

/// `delete_epoch` value meaning "not stamped yet".
const EPOCH_UNSET: u64 = u64::MAX;

/// The epoch view a pool needs from its reclamation manager.
///
/// [`crate::LocalWriteEm`] implements this; any source with a monotone
/// current epoch and a safe lower bound works.
pub trait EpochClock {
    /// The epoch new garbage would be stamped with.
    fn current_epoch(&self) -> u64;
    /// Strict upper bound on reclaimable epochs: anything stamped strictly
    /// below this is past every live reader.
    fn safe_epoch(&self) -> u64;
}

#[inline]
fn pack(refs: u32, offset: u32) -> u64 {
    ((refs as u64) << 32) | offset as u64
}

#[inline]
fn unpack(header: u64) -> (u32, u32) {
    ((header >> 32) as u32, header as u32)
}

#[inline]
fn round_up(size: usize) -> usize {
    (size + (ALIGN - 1)) & !(ALIGN - 1)
}

/// One bump-allocated region.
///
/// `header` packs `(refcount, offset)` into a single word so both advance
/// under one CAS: the offset reserves bytes, the refcount records the live
/// allocation carved out by the same success.
struct Chunk {
    header: AtomicU64,
    next: AtomicPtr<Chunk>,
    /// Epoch at which the refcount dropped to zero while this chunk was no
    /// longer the append tail. `EPOCH_UNSET` until then.
    delete_epoch: AtomicU64,
    data: *mut u8,
    capacity: usize,
}

impl Chunk {
    fn boxed(capacity: usize) -> Result<*mut Chunk, Error> {
        // SAFETY: capacity is non-zero and ALIGN is a power of two.
        let data = unsafe { alloc::alloc(Layout::from_size_align_unchecked(capacity, ALIGN)) };
        if data.is_null() {
            return Err(Error::AllocationExhausted);
        }
        Ok(Box::into_raw(Box::new(Chunk {
            header: AtomicU64::new(pack(0, 0)),
            next: AtomicPtr::new(ptr::null_mut()),
            delete_epoch: AtomicU64::new(EPOCH_UNSET),
            data,
            capacity,
        })))
    }

    /// Reserves `total` bytes (back-pointer included) out of this chunk.
    ///
    /// Returns the user pointer, or `None` when the chunk cannot fit the
    /// request. On CAS success the byte range belongs exclusively to the
    /// caller, so the back-pointer write below is race-free.
    fn bump(&self, total: usize) -> Option<*mut u8> {
        debug_assert!(total % ALIGN == 0);

        let mut header = self.header.load(Ordering::Acquire);
        loop {
            let (refs, offset) = unpack(header);
            let new_offset = offset as usize + total;
            if new_offset > self.capacity {
                return None;
            }

            match self.header.compare_exchange_weak(
                header,
                pack(refs + 1, new_offset as u32),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // SAFETY: [offset, new_offset) is ours alone and lies
                    // inside the data buffer; offset is ALIGN-aligned.
                    unsafe {
                        let base = self.data.add(offset as usize);
                        (base as *mut u64).write(self as *const Chunk as u64);
                        return Some(base.add(BACKREF_BYTES));
                    }
                }
                Err(current) => header = current,
            }
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: same layout the buffer was allocated with.
        unsafe {
            alloc::dealloc(self.data, Layout::from_size_align_unchecked(self.capacity, ALIGN));
        }
    }
}

/// A lock-free allocator that groups variable-length allocations into
/// fixed-size chunks.
///
/// Allocation bumps the tail chunk's offset with a single CAS; when the tail
/// fills up, the first thread to notice appends a fresh chunk. Freeing
/// decrements the owning chunk's refcount, recovered from the back-pointer
/// in front of the user pointer. A chunk whose count reaches zero after it
/// has stopped being the tail is stamped with the clock's current epoch and
/// destroyed by [`VarLenPool::collect`] once the clock's safe bound passes
/// it.
///
/// `collect` follows the same single-collector contract as the managers.
pub struct VarLenPool<E: EpochClock> {
    /// Oldest chunk in the chain. Read and written only by the sweep.
    head: AtomicPtr<Chunk>,
    /// The chunk allocations bump. Workers only ever touch the chain here.
    tail: AtomicPtr<Chunk>,
    chunk_size: usize,
    clock: Arc<E>,
    chunks_created: AtomicU64,
    chunks_freed: AtomicU64,
}

unsafe impl<E: EpochClock + Send + Sync> Send for VarLenPool<E> {}
unsafe impl<E: EpochClock + Send + Sync> Sync for VarLenPool<E> {}

impl<E: EpochClock> VarLenPool<E> {
    /// Creates a pool whose chunks hold `chunk_size` bytes each, gated by
    /// `clock` for chunk reclamation.
    ///
    /// `chunk_size` must fit a header-carrying allocation and a 32-bit
    /// offset.
    pub fn new(chunk_size: usize, clock: Arc<E>) -> Result<Self, Error> {
        assert!(chunk_size >= BACKREF_BYTES + ALIGN, "chunk size too small");
        assert!(chunk_size <= u32::MAX as usize, "chunk size exceeds u32 offsets");

        let first = Chunk::boxed(chunk_size)?;
        Ok(Self {
            head: AtomicPtr::new(first),
            tail: AtomicPtr::new(first),
            chunk_size,
            clock,
            chunks_created: AtomicU64::new(1),
            chunks_freed: AtomicU64::new(0),
        })
    }

    /// Allocates `size` bytes, 8-byte aligned.
    ///
    /// Requests larger than the configured chunk size get a chunk of their
    /// own; the pool keeps serving ordinary sizes afterwards.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, Error> {
        // Offsets are 32-bit; reject before rounding can overflow.
        if size > u32::MAX as usize - ALIGN - BACKREF_BYTES {
            return Err(Error::AllocationExhausted);
        }
        let total = round_up(size) + BACKREF_BYTES;

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            // SAFETY: the tail chunk is never reclaimed while it is the
            // tail, and stale tails survive the caller's announced epoch.
            let tail_ref = unsafe { &*tail };

            if let Some(p) = tail_ref.bump(total) {
                // bump returns inside the buffer, never null.
                return Ok(NonNull::new(p).expect("bump returned null"));
            }

            // Tail is full. Race to extend the chain; losers throw their
            // speculative chunk away and retry from the refreshed tail.
            let fresh = Chunk::boxed(self.chunk_size.max(total))?;
            match tail_ref.next.compare_exchange(
                ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // Chain growth is serialized on this store: nobody can
                    // append past `fresh` before seeing it as the tail.
                    self.tail.store(fresh, Ordering::Release);
                    self.chunks_created.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => unsafe {
                    drop(Box::from_raw(fresh));
                },
            }
        }
    }

    /// Releases an allocation previously returned by
    /// [`VarLenPool::allocate`].
    ///
    /// Decrements the owning chunk's refcount. The thread that takes the
    /// count to zero on a chunk that is no longer the append tail stamps the
    /// chunk's delete epoch; the chunk itself is freed by a later sweep.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this pool's `allocate` and must not be used or
    /// freed again.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        // SAFETY: allocate wrote the owning chunk's address right in front
        // of the user pointer.
        let chunk = unsafe { (ptr.as_ptr().sub(BACKREF_BYTES) as *const u64).read() } as *mut Chunk;
        let chunk_ref = unsafe { &*chunk };

        let mut header = chunk_ref.header.load(Ordering::Acquire);
        loop {
            let (refs, offset) = unpack(header);
            debug_assert!(refs > 0, "double free into pool chunk");

            match chunk_ref.header.compare_exchange_weak(
                header,
                pack(refs - 1, offset),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if refs == 1 && chunk != self.tail.load(Ordering::Acquire) {
                        // Non-tail chunks are never allocated from again, so
                        // zero means dead from here on.
                        chunk_ref
                            .delete_epoch
                            .store(self.clock.current_epoch(), Ordering::Release);
                    }
                    return;
                }
                Err(current) => header = current,
            }
        }
    }

    /// Destroys dead chunks whose delete epoch is past the clock's safe
    /// bound.
    ///
    /// Single-collector contract. Workers never traverse the chain (they
    /// touch only the tail), so this sweep is the sole reader of interior
    /// `next` pointers and may rewrite them without CAS. A dead chunk found
    /// unstamped (its count hit zero while it was still the tail) is stamped
    /// now and picked up by a later sweep, which preserves the full grace
    /// period.
    pub fn collect(&self) {
        let safe_epoch = self.clock.safe_epoch();
        let tail = self.tail.load(Ordering::Acquire);

        let mut pred: *mut Chunk = ptr::null_mut();
        let mut current = self.head.load(Ordering::Relaxed);

        while !current.is_null() && current != tail {
            let chunk = unsafe { &*current };
            let (refs, _) = unpack(chunk.header.load(Ordering::Acquire));

            if refs == 0 {
                let delete_epoch = chunk.delete_epoch.load(Ordering::Acquire);
                if delete_epoch == EPOCH_UNSET {
                    chunk
                        .delete_epoch
                        .store(self.clock.current_epoch(), Ordering::Release);
                } else if delete_epoch < safe_epoch {
                    let next = chunk.next.load(Ordering::Acquire);
                    if pred.is_null() {
                        self.head.store(next, Ordering::Relaxed);
                    } else {
                        unsafe {
                            (*pred).next.store(next, Ordering::Relaxed);
                        }
                    }
                    // SAFETY: unlinked, empty, and past every live reader.
                    unsafe {
                        drop(Box::from_raw(current));
                    }
                    self.chunks_freed.fetch_add(1, Ordering::Relaxed);
                    current = next;
                    continue;
                }
            }

            pred = current;
            current = chunk.next.load(Ordering::Acquire);
        }
    }

    /// Chunks allocated over the pool's lifetime, counting the initial one.
    pub fn chunks_created(&self) -> u64 {
        self.chunks_created.load(Ordering::Relaxed)
    }

    /// Chunks destroyed by [`VarLenPool::collect`] so far.
    pub fn chunks_freed(&self) -> u64 {
        self.chunks_freed.load(Ordering::Relaxed)
    }
}

impl<E: EpochClock> Drop for VarLenPool<E> {
    fn drop(&mut self) {
        // Single-threaded by contract; free the whole chain regardless of
        // refcounts.
        let mut current = *self.head.get_mut();
        let mut leaked = 0u64;
        while !current.is_null() {
            let chunk = unsafe { Box::from_raw(current) };
            let (refs, _) = unpack(chunk.header.load(Ordering::Relaxed));
            leaked += refs as u64;
            current = chunk.next.load(Ordering::Relaxed);
        }
        if leaked > 0 {
            debug!("pool dropped with {leaked} live allocations");
        }
    }
}
