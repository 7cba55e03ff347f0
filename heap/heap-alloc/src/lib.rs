//! # Segment Heap Allocator
//!
//! A self-contained dynamic memory allocator over a single contiguous byte
//! segment supplied by the host. It services `allocate`, `reallocate`, and
//! `deallocate` requests with no system calls, no growth, and no bookkeeping
//! outside the segment itself.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Heap façade ([`Heap`])              │
//! │    • init / allocate / reallocate / deallocate      │
//! │    • split-or-take placement                        │
//! │    • two-sided coalescing                           │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │            Free index ([`FreeIndex`])               │
//! │    • best-fit lookup-and-remove                     │
//! │    • red-black tree ([`RbIndex`], primary)          │
//! │    • segregated lists ([`SegListIndex`], alt)       │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │     Block layout ([`BlockPtr`], [`HeaderWord`])     │
//! │    • bit-packed 64-bit header/footer codec          │
//! │    • in-block free links, tail sentinel             │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Block layout ([`BlockPtr`], [`HeaderWord`])
//!
//! Every block starts with one bit-packed header word carrying the block
//! size, its allocation status, the left neighbor's allocation status, and —
//! while the block sits in the tree index — its node color. Free blocks
//! mirror the header into a footer so the right neighbor can coalesce
//! leftward, and lend their first three payload words to the free index as
//! link storage. The final 32 bytes of the segment hold a sentinel block that
//! terminates the linear walk and doubles as the tree's NIL node.
//!
//! ### Free index ([`RbIndex`] / [`SegListIndex`])
//!
//! An ordered multiset of free blocks keyed by size. The primary
//! implementation is a red-black tree whose nodes are the free blocks
//! themselves, giving O(log N) best-fit without any memory of its own. A
//! segregated size-class list index substitutes behind the same trait for
//! comparison work.
//!
//! ### Heap façade ([`Heap`])
//!
//! One allocator value per segment — no process-wide state. Placement either
//! splits a free tail off the chosen block or consumes it whole when the
//! surplus could not stand as a block of its own. Deallocation coalesces
//! with both physical neighbors before re-indexing.
//!
//! ### Audit & dump
//!
//! [`Heap::audit`] walks the segment and cross-checks every invariant
//! (tiling, coalescing, footer mirroring, neighbor bits, index agreement,
//! red-black structure); [`Heap::write_dump`] renders the block map and index
//! for the interactive inspector. Both live off the hot path.
//!
//! ## Usage
//!
//! ```rust
//! use core::ptr::NonNull;
//! use heap_alloc::RbHeap;
//!
//! let mut backing = vec![0u64; 1024]; // 8 KiB, 8-byte aligned
//! let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
//! let mut heap = unsafe { RbHeap::init(base, 8192) }.unwrap();
//!
//! let p = heap.allocate(100).unwrap();
//! let p = unsafe { heap.reallocate(Some(p), 500) }.unwrap();
//! unsafe { heap.deallocate(Some(p)) };
//! assert!(heap.validate());
//! ```
//!
//! ## Concurrency Model
//!
//! Single-threaded and non-reentrant: every operation runs to completion,
//! takes no locks, and must not be entered from a signal handler. The host
//! owns the segment's storage; the allocator only indexes it.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod audit;
mod block;
mod dump;
mod heap;
mod index;
mod rb;
mod seg_list;

pub use audit::{HeapAuditError, HeapReport};
pub use block::{BlockPtr, Dir, HeaderWord, MIN_BLOCK, SENTINEL_BYTES, block_size_for};
pub use dump::DumpStyle;
pub use heap::{Heap, InitError, RbHeap, SegListHeap};
pub use index::{FreeIndex, IndexAudit, IndexAuditError};
pub use rb::RbIndex;
pub use seg_list::{CLASS_COUNT, SegListIndex};
