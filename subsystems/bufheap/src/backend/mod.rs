//! # Heap Backends
//!
//! A backend is the strategy that sources and returns physical pages for one
//! heap: a contiguous region, a page pool, a carveout, a DMA window. The
//! heap layer owns deferral, reclaim and zeroing; the backend only deals in
//! extent lists.
//!
//! Not every backend can give memory back under pressure. Callers ask
//! [`HeapBackend::capabilities`] instead of probing for an optional hook.

pub mod host;

use core::fmt;

use crate::buffer::BufferFlags;
use crate::error::Result;
use crate::types::ExtentList;

pub use host::{HostPageBackend, HostPageConfig};

// =============================================================================
// CAPABILITIES
// =============================================================================

bitflags::bitflags! {
    /// What a backend supports
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BackendCaps: u32 {
        /// Implements [`HeapBackend::shrink`]
        const SHRINK = 1 << 0;
        /// Freed pages must be zeroed before the backend sees them again
        const ZERO_ON_FREE = 1 << 1;
    }
}

// =============================================================================
// ALLOCATION REQUEST
// =============================================================================

/// Parameters of one backend allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    /// Requested length, already page aligned
    pub size: u64,
    /// Required alignment of the first extent
    pub align: u64,
    /// Buffer flags
    pub flags: BufferFlags,
}

// =============================================================================
// BACKEND TRAIT
// =============================================================================

/// Page source behind a heap
pub trait HeapBackend: Send + Sync + fmt::Debug {
    /// Supported operations
    fn capabilities(&self) -> BackendCaps;

    /// Produce extents covering `request.size` bytes
    fn allocate(&self, request: &AllocRequest) -> Result<ExtentList>;

    /// Take back extents from a destroyed buffer
    ///
    /// With `return_to_system` set the backend must not keep the pages in any
    /// internal cache; they were reclaimed under memory pressure.
    fn free(&self, extents: ExtentList, return_to_system: bool) -> Result<()>;

    /// Release up to `requested_pages` cached pages, returning how many were
    /// released. `requested_pages == 0` is a query: return how many could be.
    fn shrink(&self, _requested_pages: u64) -> u64 {
        0
    }

    /// Called once by the heap destructor after every buffer is gone
    fn teardown(&self) {}

    /// Whether [`shrink`](Self::shrink) does anything
    fn can_shrink(&self) -> bool {
        self.capabilities().contains(BackendCaps::SHRINK)
    }
}
