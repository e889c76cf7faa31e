//! The destroy-callback seam between a manager and its garbage type.

/// Types that an epoch manager can retire and later destroy.
///
/// The manager calls [`Reclaim::reclaim`] exactly once per retired pointer,
/// no sooner than the epoch rules allow. The default implementation frees a
/// `Box` allocation; override it for payloads with non-trivial destruction
/// (nodes that own chains of further allocations, arena-backed records, and
/// so on).
///
/// # Safety
///
/// Implementors must ensure `reclaim` fully releases the allocation behind
/// `ptr` and touches nothing else. Callers of `reclaim` guarantee the pointer
/// came from the matching allocation path and that it is called once.
pub unsafe trait Reclaim: Sized {
    /// Destroys the pointed-to value and releases its memory.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid, uniquely owned by the caller, and never used
    /// again.
    unsafe fn reclaim(ptr: *mut Self) {
        // SAFETY: per the contract, ptr is a unique Box allocation.
        unsafe {
            drop(Box::from_raw(ptr));
        }
    }
}
