//! # Helix Buffer Heaps
//!
//! Physically-addressed buffer allocation with deferred release and
//! pressure-driven reclaim.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          HeapFactory                                │
//! │   HeapType tag ──▶ (backend constructor, backend destructor)        │
//! └──────────────────────────────┬──────────────────────────────────────┘
//!                                │ create_heap / destroy_heap
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                             Heap                                    │
//! │                                                                     │
//! │  ┌──────────────┐  push   ┌──────────────────┐  pop   ┌──────────┐  │
//! │  │ BufferHandle │ ──────▶ │ DeferredFreeList │ ─────▶ │  Worker  │  │
//! │  │ (last drop)  │         │ free_lock, size  │        │ nice 19  │  │
//! │  └──────────────┘         └────────┬─────────┘        └────┬─────┘  │
//! │                                    │ pop (forced)          │        │
//! │                           ┌────────┴─────────┐             │        │
//! │  MemoryPressure ────────▶ │   ReclaimHook    │             │        │
//! │                           └────────┬─────────┘             │        │
//! │                                    ▼                       ▼        │
//! │                      destroy: BulkZeroer ──▶ HeapBackend::free      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - The free list's byte tally always equals the sum of the queued buffer
//!   sizes; both change only under `free_lock`.
//! - Every released buffer is destroyed at most once, whether the worker or
//!   a reclaim pass unlinks it.
//! - Transient mappings made while zeroing never exceed
//!   [`MAX_CHUNK_PAGES`] pages.
//! - A heap is torn down once: worker joined, reclaim hook unregistered,
//!   queue drained, then the backend destructor runs.
//!
//! ## Example
//!
//! ```
//! use helix_bufheap::{BufferFlags, HeapFactory, HeapParams, PAGE_SIZE};
//!
//! let factory = HeapFactory::hosted();
//! let heap = factory.create_heap(&HeapParams::system(0, "system")).unwrap();
//!
//! let buffer = heap.allocate(4 * PAGE_SIZE, BufferFlags::CACHED).unwrap();
//! assert_eq!(buffer.size(), 4 * PAGE_SIZE);
//! drop(buffer);
//!
//! factory.destroy_heap(&heap).unwrap();
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

// =============================================================================
// MODULE DECLARATIONS
// =============================================================================

/// Addresses, extents and page constants
pub mod types;

/// Error types
pub mod error;

/// Buffers and buffer handles
pub mod buffer;

/// Backend strategy trait and the host backend
pub mod backend;

/// Platform mapping adapters
pub mod mapper;

/// Bulk zeroing
pub mod zero;

/// Suspend-aware condition variable
pub mod condition;

/// Deferred-free list
pub mod free_list;

/// Deferred-free worker
pub mod worker;

/// Memory-pressure registry and reclaim hook
pub mod reclaim;

/// Heaps
pub mod heap;

/// Heap type dispatch
pub mod factory;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use backend::{AllocRequest, BackendCaps, HeapBackend, HostPageBackend, HostPageConfig};
pub use buffer::{Buffer, BufferFlags, BufferHandle, BufferId, PrivateFlags};
pub use condition::{Condition, WakeReason};
pub use error::{Error, Result};
pub use factory::{BackendConstructor, BackendDestructor, BackendOps, HeapFactory, HeapParams, HeapType};
pub use free_list::DeferredFreeList;
pub use heap::{Heap, HeapConfig, HeapFlags, HeapState, HeapStats};
pub use mapper::{AddressSpaceId, DeviceDomain, DirectMap, HostMapper, MemoryMapper, UserRegion};
pub use reclaim::{MemoryPressure, ReclaimHook, Shrinker, ShrinkerId};
pub use types::{Extent, ExtentList, PhysAddr, VirtAddr, MAX_CHUNK_PAGES, PAGE_SIZE};
pub use worker::DeferredFreeWorker;
pub use zero::{BulkZeroer, ZeroPath, ZeroReport};
