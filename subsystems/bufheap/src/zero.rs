//! # Bulk Zeroer
//!
//! Clears a buffer's backing pages before they can reach a new owner.
//!
//! ## Paths
//!
//! ```text
//!   direct map available?
//!        │
//!   yes ─┼──▶ for each extent: memset(phys + offset, 0, len)
//!        │
//!   no  ─┴──▶ for each batch of ≤ MAX_CHUNK_PAGES pages:
//!                 map_pages(batch) ─▶ memset ─▶ unmap_pages
//! ```
//!
//! The chunked path bounds transient virtual address use to
//! `MAX_CHUNK_PAGES * PAGE_SIZE` whatever the buffer size. Batches already
//! zeroed when a later mapping fails are not rolled back.

use log::{error, trace};

use crate::error::{Error, Result};
use crate::mapper::{DirectMap, MemoryMapper};
use crate::types::{ExtentList, PhysAddr, MAX_CHUNK_PAGES, PAGE_SIZE};

// =============================================================================
// REPORT
// =============================================================================

/// Which path a zeroing pass took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroPath {
    /// Written through the platform's linear map
    Direct,
    /// Written through transient per-batch mappings
    Chunked,
}

/// Outcome of a successful zeroing pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZeroReport {
    /// Path taken
    pub path: ZeroPath,
    /// Pages zeroed
    pub pages: u64,
    /// Transient map/unmap cycles performed
    pub chunks: usize,
}

// =============================================================================
// BULK ZEROER
// =============================================================================

/// Zeroes extent lists through a [`MemoryMapper`]
#[derive(Debug, Clone, Copy)]
pub struct BulkZeroer<'a> {
    mapper: &'a dyn MemoryMapper,
    max_chunk: usize,
}

impl<'a> BulkZeroer<'a> {
    /// Create a zeroer using the platform mapper
    pub fn new(mapper: &'a dyn MemoryMapper) -> Self {
        Self {
            mapper,
            max_chunk: MAX_CHUNK_PAGES,
        }
    }

    /// Zero every byte covered by `extents`
    ///
    /// `cached` selects the attribute of transient mappings so the writes go
    /// through the same cache policy the buffer is mapped with elsewhere.
    pub fn zero(&self, extents: &ExtentList, cached: bool) -> Result<ZeroReport> {
        match self.mapper.direct_map() {
            Some(map) => Ok(self.zero_direct(map, extents)),
            None => self.zero_chunked(extents, cached),
        }
    }

    fn zero_direct(&self, map: DirectMap, extents: &ExtentList) -> ZeroReport {
        for extent in extents {
            let va = map.virt(extent.base);
            // SAFETY: the mapper contract guarantees the direct map covers
            // the extent, and the caller owns the extent exclusively.
            unsafe { core::ptr::write_bytes(va.as_mut_ptr(), 0, extent.len as usize) };
        }

        ZeroReport {
            path: ZeroPath::Direct,
            pages: extents.page_count(),
            chunks: 0,
        }
    }

    fn zero_chunked(&self, extents: &ExtentList, cached: bool) -> Result<ZeroReport> {
        let total_pages = extents.page_count();
        let mut batch: Vec<PhysAddr> = Vec::with_capacity(self.max_chunk.min(total_pages as usize));
        let mut zeroed_pages = 0u64;
        let mut chunks = 0usize;

        let mut pages = extents.pages().peekable();
        while pages.peek().is_some() {
            batch.clear();
            batch.extend(pages.by_ref().take(self.max_chunk));

            self.zero_batch(&batch, cached).map_err(|e| {
                error!(
                    "bulk zero: chunk {} failed after {}/{} pages: {}",
                    chunks, zeroed_pages, total_pages, e
                );
                Error::ZeroFailure {
                    zeroed_pages,
                    total_pages,
                }
            })?;

            zeroed_pages += batch.len() as u64;
            chunks += 1;
        }

        trace!("bulk zero: {} pages in {} chunks", zeroed_pages, chunks);
        Ok(ZeroReport {
            path: ZeroPath::Chunked,
            pages: zeroed_pages,
            chunks,
        })
    }

    fn zero_batch(&self, batch: &[PhysAddr], cached: bool) -> Result<()> {
        let va = self.mapper.map_pages(batch, cached)?;
        // SAFETY: map_pages returned a writable mapping of exactly
        // `batch.len()` pages, released right below.
        unsafe {
            core::ptr::write_bytes(va.as_mut_ptr(), 0, batch.len() * PAGE_SIZE as usize);
        }
        self.mapper.unmap_pages(va, batch.len());
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
