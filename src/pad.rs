//! Cache-line padding for contended atomics.

use core::ops::{Deref, DerefMut};

// Cache line sizes per architecture.
// aarch64: 128B (Apple M-series / Neoverse prefetch pairs), s390x: 256B.
// Fallback: 64B (x86_64 and most others).

#[cfg(target_arch = "s390x")]
#[repr(align(256))]
/// Pads its contents to one cache line so that writes to it never share a
/// line with a neighbor.
pub struct CachePadded<T> {
    value: T,
}

#[cfg(target_arch = "aarch64")]
#[repr(align(128))]
/// Pads its contents to one cache line so that writes to it never share a
/// line with a neighbor.
pub struct CachePadded<T> {
    value: T,
}

#[cfg(not(any(target_arch = "s390x", target_arch = "aarch64")))]
#[repr(align(64))]
/// Pads its contents to one cache line so that writes to it never share a
/// line with a neighbor.
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    /// Wraps `value` in its own cache line.
    pub const fn new(value: T) -> Self {
        Self { value }
    }

    /// Consumes the wrapper, returning the inner value.
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Default> Default for CachePadded<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for CachePadded<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("CachePadded").field(&self.value).finish()
    }
}
