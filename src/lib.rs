//! Lowtide: epoch-based safe memory reclamation for lock-free data structures.
//!
//! A worker thread that operates on a lock-free structure can never free a
//! node it unlinks, because another thread may still be reading it. Lowtide
//! solves this with epochs: workers publish which epoch they are in, removed
//! nodes are retired to a manager stamped with the epoch of removal, and a
//! collector frees a retired node only once every worker has provably moved
//! past that epoch.
//!
//! # What's in the crate
//!
//! - [`GlobalWriteEm`]: epoch manager that reference-counts the current epoch
//!   node. Workers bracket each operation with [`GlobalWriteEm::join_epoch`]
//!   (the returned guard leaves on drop).
//! - [`LocalWriteEm`]: epoch manager whose fast path is a single write into a
//!   cache-line-private per-core slot ([`LocalWriteEm::announce`]). The
//!   collector frees garbage older than the minimum announced epoch.
//! - [`AtomicStack`]: lock-free Treiber stack whose `pop` detaches the node
//!   and hands ownership to the caller for retirement.
//! - [`VarLenPool`]: lock-free bump allocator over a chain of chunks, with
//!   per-chunk reference counts and epoch-gated chunk reclamation.
//!
//! # Example
//!
//! ```rust
//! use lowtide::{AtomicStack, LocalWriteEm, Node};
//! use std::sync::Arc;
//!
//! let em: Arc<LocalWriteEm<Node<u64>>> = Arc::new(LocalWriteEm::new(1));
//! let stack = AtomicStack::new();
//!
//! em.announce(0);
//! stack.push(7);
//!
//! em.announce(0);
//! let node = stack.pop().unwrap();
//! assert_eq!(*unsafe { node.as_ref() }.value(), 7);
//! // The node is unlinked; hand it to the manager instead of freeing it.
//! unsafe { em.retire(node.as_ptr()).unwrap() };
//!
//! // Drive the collector by hand (or use `start_collector`).
//! em.announce(0);
//! em.tick();
//! ```

#![warn(missing_docs)]

mod collector;
mod error;
mod global;
mod local;
mod pad;
mod pool;
mod reclaim;
mod stack;

pub use error::Error;
pub use global::{EpochGuard, GlobalWriteEm};
pub use local::LocalWriteEm;
pub use pad::CachePadded;
pub use pool::{EpochClock, VarLenPool};
pub use reclaim::Reclaim;
pub use stack::{AtomicStack, Node};
