//! # Host Page Backend
//!
//! Pooled-page backend over process memory, for hosted builds and tests.
//!
//! Buffers are built from high-order chunks while the remaining size allows,
//! then single pages. Freed chunks and pages are cached in per-order pools
//! up to a configured limit, unless the free comes from reclaim, in which
//! case they go straight back to the system allocator.

use core::sync::atomic::{AtomicU64, Ordering};
use std::alloc::{self, Layout};

use log::{debug, warn};
use spin::Mutex;

use super::{AllocRequest, BackendCaps, HeapBackend};
use crate::error::{Error, Result};
use crate::types::{Extent, ExtentList, PhysAddr, PAGE_SHIFT, PAGE_SIZE};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Host backend configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPageConfig {
    /// Order of the large chunks (pages = `1 << large_order`)
    pub large_order: u32,
    /// Most pages kept cached across both pools
    pub max_pool_pages: u64,
    /// Most pages held from the system at once, `None` for no limit
    pub capacity_pages: Option<u64>,
    /// Ask the heap to zero pages before they return to the pools
    pub zero_on_free: bool,
}

impl HostPageConfig {
    /// Small pool, no capacity limit
    pub const fn small() -> Self {
        Self {
            large_order: 4,
            max_pool_pages: 256,
            capacity_pages: None,
            zero_on_free: true,
        }
    }

    /// Capacity-limited configuration
    pub const fn with_capacity(pages: u64) -> Self {
        Self {
            capacity_pages: Some(pages),
            ..Self::small()
        }
    }

    const fn large_bytes(&self) -> u64 {
        PAGE_SIZE << self.large_order
    }
}

impl Default for HostPageConfig {
    fn default() -> Self {
        Self::small()
    }
}

// =============================================================================
// PAGE POOL
// =============================================================================

#[derive(Debug)]
struct PagePool {
    chunk_bytes: u64,
    free: Mutex<Vec<PhysAddr>>,
}

impl PagePool {
    const fn new(chunk_bytes: u64) -> Self {
        Self {
            chunk_bytes,
            free: Mutex::new(Vec::new()),
        }
    }

    fn pages_per_chunk(&self) -> u64 {
        self.chunk_bytes >> PAGE_SHIFT
    }

    fn cached_pages(&self) -> u64 {
        self.free.lock().len() as u64 * self.pages_per_chunk()
    }
}

// =============================================================================
// HOST PAGE BACKEND
// =============================================================================

/// Pooled-page backend over process memory
#[derive(Debug)]
pub struct HostPageBackend {
    config: HostPageConfig,
    large: PagePool,
    small: PagePool,
    /// Pages currently held from the system, pooled or in buffers
    held_pages: AtomicU64,
    /// Pages handed back to the system by reclaim frees and shrink
    returned_pages: AtomicU64,
}

impl HostPageBackend {
    /// Create a backend
    pub fn new(config: HostPageConfig) -> Self {
        Self {
            large: PagePool::new(config.large_bytes()),
            small: PagePool::new(PAGE_SIZE),
            config,
            held_pages: AtomicU64::new(0),
            returned_pages: AtomicU64::new(0),
        }
    }

    /// Pages cached in the pools
    pub fn pooled_pages(&self) -> u64 {
        self.large.cached_pages() + self.small.cached_pages()
    }

    /// Pages held from the system
    pub fn held_pages(&self) -> u64 {
        self.held_pages.load(Ordering::Acquire)
    }

    /// Pages returned to the system so far
    pub fn returned_pages(&self) -> u64 {
        self.returned_pages.load(Ordering::Acquire)
    }

    fn pool_for(&self, len: u64) -> &PagePool {
        if len == self.large.chunk_bytes {
            &self.large
        } else {
            &self.small
        }
    }

    fn layout(len: u64) -> Result<Layout> {
        Layout::from_size_align(len as usize, PAGE_SIZE as usize)
            .map_err(|_| Error::InvalidParameter("chunk layout"))
    }

    /// Take a chunk from `pool`, falling back to the system allocator
    fn take_chunk(&self, pool: &PagePool) -> Result<PhysAddr> {
        if let Some(addr) = pool.free.lock().pop() {
            return Ok(addr);
        }

        let pages = pool.pages_per_chunk();
        if let Some(cap) = self.config.capacity_pages {
            let reserved = self
                .held_pages
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                    (held + pages <= cap).then_some(held + pages)
                });
            if reserved.is_err() {
                return Err(Error::OutOfMemory);
            }
        } else {
            self.held_pages.fetch_add(pages, Ordering::AcqRel);
        }

        let layout = Self::layout(pool.chunk_bytes)?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            self.held_pages.fetch_sub(pages, Ordering::AcqRel);
            return Err(Error::OutOfMemory);
        }
        Ok(PhysAddr::new(ptr as u64))
    }

    /// Give a chunk back to the system allocator
    fn release_chunk(&self, addr: PhysAddr, len: u64) {
        match Self::layout(len) {
            Ok(layout) => {
                // SAFETY: every chunk was produced by `take_chunk` with the
                // same layout and is no longer referenced by any buffer.
                unsafe { alloc::dealloc(addr.raw() as usize as *mut u8, layout) };
                let pages = len >> PAGE_SHIFT;
                self.held_pages.fetch_sub(pages, Ordering::AcqRel);
                self.returned_pages.fetch_add(pages, Ordering::AcqRel);
            },
            Err(e) => warn!("host backend: leaking chunk {}: {}", addr, e),
        }
    }

    /// Drain up to `budget` pages from `pool`
    fn drain_pool(&self, pool: &PagePool, budget: u64) -> u64 {
        let mut freed = 0;
        while freed < budget {
            let Some(addr) = pool.free.lock().pop() else {
                break;
            };
            self.release_chunk(addr, pool.chunk_bytes);
            freed += pool.pages_per_chunk();
        }
        freed
    }
}

impl HeapBackend for HostPageBackend {
    fn capabilities(&self) -> BackendCaps {
        let mut caps = BackendCaps::SHRINK;
        if self.config.zero_on_free {
            caps |= BackendCaps::ZERO_ON_FREE;
        }
        caps
    }

    fn allocate(&self, request: &AllocRequest) -> Result<ExtentList> {
        if request.align > PAGE_SIZE {
            return Err(Error::InvalidParameter("host backend aligns to pages only"));
        }

        let mut extents = ExtentList::new();
        let mut remaining = request.size;
        while remaining > 0 {
            let pool = if remaining >= self.large.chunk_bytes {
                &self.large
            } else {
                &self.small
            };
            match self.take_chunk(pool) {
                Ok(addr) => {
                    extents.push_unmerged(Extent::new(addr, pool.chunk_bytes));
                    remaining = remaining.saturating_sub(pool.chunk_bytes);
                },
                Err(e) => {
                    self.free(extents, false)?;
                    return Err(e);
                },
            }
        }
        Ok(extents)
    }

    fn free(&self, extents: ExtentList, return_to_system: bool) -> Result<()> {
        for extent in extents.into_vec() {
            let pool = self.pool_for(extent.len);
            let pooled = self.pooled_pages();
            if !return_to_system && pooled + extent.page_count() <= self.config.max_pool_pages {
                pool.free.lock().push(extent.base);
            } else {
                self.release_chunk(extent.base, extent.len);
            }
        }
        Ok(())
    }

    fn shrink(&self, requested_pages: u64) -> u64 {
        if requested_pages == 0 {
            return self.pooled_pages();
        }
        let mut freed = self.drain_pool(&self.small, requested_pages);
        if freed < requested_pages {
            freed += self.drain_pool(&self.large, requested_pages - freed);
        }
        debug!("host backend: shrink returned {} pages", freed);
        freed
    }

    fn teardown(&self) {
        let freed = self.drain_pool(&self.small, u64::MAX) + self.drain_pool(&self.large, u64::MAX);
        debug!("host backend: teardown released {} pooled pages", freed);
    }
}

impl Drop for HostPageBackend {
    fn drop(&mut self) {
        self.teardown();
        let held = self.held_pages();
        if held > 0 {
            warn!("host backend: dropped with {} pages still in buffers", held);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
