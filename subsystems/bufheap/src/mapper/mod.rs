//! # Mapping Adapters
//!
//! The heap never programs page tables or IOMMUs itself. Every mapping it
//! needs, whether a kernel view of a buffer, a user view, a device view, or
//! the transient views used by the bulk zeroer, goes through a
//! [`MemoryMapper`] supplied by the platform.

pub mod host;

use core::fmt;

use crate::error::{Error, Result};
use crate::types::{ExtentList, PhysAddr, VirtAddr};

pub use host::HostMapper;

// =============================================================================
// DIRECT MAP
// =============================================================================

/// Linear mapping of all physical memory into the kernel address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectMap {
    /// `virt = phys + offset`
    pub offset: u64,
}

impl DirectMap {
    /// Identity direct map
    pub const IDENTITY: DirectMap = DirectMap { offset: 0 };

    /// Translate a physical address through the linear map
    #[inline]
    pub const fn virt(&self, phys: PhysAddr) -> VirtAddr {
        VirtAddr::new(phys.raw().wrapping_add(self.offset))
    }
}

// =============================================================================
// MAPPING TARGETS
// =============================================================================

/// Identifier of a user address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressSpaceId(pub u32);

/// A user virtual range to populate with a buffer's pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserRegion {
    /// Target address space
    pub space: AddressSpaceId,
    /// First user virtual address
    pub start: VirtAddr,
    /// Length of the range in bytes
    pub len: u64,
    /// Byte offset into the buffer the range starts at
    pub offset: u64,
}

/// An IOMMU domain a device accesses buffers through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceDomain(pub u32);

// =============================================================================
// MAPPER TRAIT
// =============================================================================

/// Platform mapping primitives consumed by the heap
///
/// # Safety
///
/// Implementors guarantee that every address returned by [`direct_map`],
/// [`map_pages`] and [`map_kernel`] is writable for the full length of the
/// memory it was asked to cover, until the matching unmap call. The bulk
/// zeroer writes through these addresses without further checks.
///
/// [`direct_map`]: MemoryMapper::direct_map
/// [`map_pages`]: MemoryMapper::map_pages
/// [`map_kernel`]: MemoryMapper::map_kernel
pub unsafe trait MemoryMapper: Send + Sync + fmt::Debug {
    /// Linear map covering all physical memory, if the platform has one
    fn direct_map(&self) -> Option<DirectMap>;

    /// Create a contiguous transient mapping over `pages`
    fn map_pages(&self, pages: &[PhysAddr], cached: bool) -> Result<VirtAddr>;

    /// Destroy a mapping created by [`map_pages`](Self::map_pages)
    fn unmap_pages(&self, vaddr: VirtAddr, page_count: usize);

    /// Create the long-lived kernel mapping of a buffer
    fn map_kernel(&self, extents: &ExtentList, cached: bool) -> Result<VirtAddr>;

    /// Destroy a mapping created by [`map_kernel`](Self::map_kernel)
    fn unmap_kernel(&self, vaddr: VirtAddr);

    /// Populate a user range with the buffer's pages
    fn map_user(&self, _extents: &ExtentList, _region: &UserRegion) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Map the buffer into a device's IOMMU domain
    fn map_device(&self, _extents: &ExtentList, _domain: DeviceDomain) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Remove the buffer from a device's IOMMU domain
    fn unmap_device(&self, _extents: &ExtentList, _domain: DeviceDomain) {}
}
