//! Lock-free LIFO stack that detaches popped nodes for retirement.

use crate::reclaim::Reclaim;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

/// A node of [`AtomicStack`].
///
/// While linked, the node is owned by the stack. A successful `pop` detaches
/// it and transfers ownership to the caller, who must hand it to an epoch
/// manager rather than free it directly: concurrent poppers may still hold
/// the pointer.
pub struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

impl<T> Node<T> {
    /// The value stored in this node.
    pub fn value(&self) -> &T {
        &self.value
    }
}

// SAFETY: a detached node is a plain Box allocation.
unsafe impl<T> Reclaim for Node<T> {}

// SAFETY: the raw next pointer is only navigated under the stack's CAS
// protocol; moving or sharing a node moves or shares its value.
unsafe impl<T: Send> Send for Node<T> {}
unsafe impl<T: Sync> Sync for Node<T> {}

/// A lock-free stack supporting concurrent push and pop.
///
/// The stack never frees a node after linking it; `pop` returns the detached
/// node so the caller can route it through an epoch manager. ABA on the head
/// pointer is possible in principle and is prevented by the manager holding
/// popped nodes until all concurrent readers have left their epoch.
pub struct AtomicStack<T> {
    head: AtomicPtr<Node<T>>,
}

unsafe impl<T: Send> Send for AtomicStack<T> {}
unsafe impl<T: Send> Sync for AtomicStack<T> {}

impl<T> AtomicStack<T> {
    /// Creates an empty stack.
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pushes `value` onto the stack.
    ///
    /// Allocates a node, points it at the current head and installs it with
    /// CAS, re-reading the head on every failed attempt.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // The node is unpublished until the CAS succeeds.
            unsafe {
                (*node).next = head;
            }

            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Pops the most recently pushed node, or `None` if the stack is empty.
    ///
    /// Ownership of the returned node transfers to the caller. The caller
    /// must retire it through an epoch manager; freeing it inline invites
    /// use-after-free in concurrent poppers that read the same head.
    pub fn pop(&self) -> Option<NonNull<Node<T>>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head.is_null() {
                return None;
            }

            // Reading `next` through a snapshot is only sound because popped
            // nodes stay allocated until their retirement epoch is swept.
            let next = unsafe { (*head).next };

            match self.head.compare_exchange_weak(
                head,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return NonNull::new(head),
                Err(current) => head = current,
            }
        }
    }

    /// Whether the stack currently has no linked nodes.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T> Default for AtomicStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for AtomicStack<T> {
    fn drop(&mut self) {
        // Nodes still linked at destruction are stack-owned.
        let mut current = *self.head.get_mut();
        while !current.is_null() {
            let next = unsafe { (*current).next };
            unsafe {
                drop(Box::from_raw(current));
            }
            current = next;
        }
    }
}
