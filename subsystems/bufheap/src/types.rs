//! # Buffer Heap Types
//!
//! Address and extent types shared by every heap component.
//!
//! A buffer's backing memory is described as an ordered list of physical
//! extents. Extents are page aligned and page granular; the same list is
//! handed to the backend on free, to the mapper on map, and to the bulk
//! zeroer before the pages are reused.

use core::fmt;

use static_assertions::const_assert;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Page size used for all extent arithmetic
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`]
pub const PAGE_SHIFT: u32 = 12;

/// Maximum number of pages mapped at once by the chunked zeroing path
pub const MAX_CHUNK_PAGES: usize = 1024;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(1u64 << PAGE_SHIFT == PAGE_SIZE);
const_assert!(MAX_CHUNK_PAGES > 0);

/// Number of whole pages covering `bytes`
#[inline]
pub const fn pages_for(bytes: u64) -> u64 {
    (bytes + PAGE_SIZE - 1) >> PAGE_SHIFT
}

/// Round `bytes` up to the page size
#[inline]
pub const fn page_align(bytes: u64) -> u64 {
    pages_for(bytes) << PAGE_SHIFT
}

// =============================================================================
// PHYSICAL ADDRESS
// =============================================================================

/// Physical memory address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Create a new physical address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check page alignment
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// VIRTUAL ADDRESS
// =============================================================================

/// Kernel virtual address returned by a mapping adapter
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Create a new virtual address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// View as a mutable byte pointer
    #[inline]
    pub fn as_mut_ptr(self) -> *mut u8 {
        self.0 as usize as *mut u8
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr(0x{:016x})", self.0)
    }
}

// =============================================================================
// EXTENT
// =============================================================================

/// A physically contiguous run of pages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    /// Physical base address
    pub base: PhysAddr,
    /// Length in bytes
    pub len: u64,
}

impl Extent {
    /// Create a new extent
    #[inline]
    pub const fn new(base: PhysAddr, len: u64) -> Self {
        Self { base, len }
    }

    /// One past the last byte
    #[inline]
    pub const fn end(&self) -> PhysAddr {
        self.base.offset(self.len)
    }

    /// Number of pages covered
    #[inline]
    pub const fn page_count(&self) -> u64 {
        pages_for(self.len)
    }

    /// Iterate the physical address of each page
    pub fn pages(&self) -> impl Iterator<Item = PhysAddr> + '_ {
        (0..self.page_count()).map(move |i| self.base.offset(i << PAGE_SHIFT))
    }
}

// =============================================================================
// EXTENT LIST
// =============================================================================

/// Ordered list of extents backing one buffer
///
/// Ownership of the list is ownership of the pages: it moves from the backend
/// into the buffer, and back into the backend on free. It is never cloned.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExtentList {
    extents: Vec<Extent>,
}

impl ExtentList {
    /// Create an empty list
    pub const fn new() -> Self {
        Self {
            extents: Vec::new(),
        }
    }

    /// Create an empty list with room for `n` extents
    pub fn with_capacity(n: usize) -> Self {
        Self {
            extents: Vec::with_capacity(n),
        }
    }

    /// Append an extent, merging it into the tail when physically adjacent
    pub fn push(&mut self, extent: Extent) {
        if let Some(last) = self.extents.last_mut() {
            if last.end() == extent.base {
                last.len += extent.len;
                return;
            }
        }
        self.extents.push(extent);
    }

    /// Append an extent without merging
    pub fn push_unmerged(&mut self, extent: Extent) {
        self.extents.push(extent);
    }

    /// Extents in order
    pub fn as_slice(&self) -> &[Extent] {
        &self.extents
    }

    /// Iterate extents
    pub fn iter(&self) -> core::slice::Iter<'_, Extent> {
        self.extents.iter()
    }

    /// Number of extents
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Sum of extent lengths
    pub fn total_bytes(&self) -> u64 {
        self.extents.iter().map(|e| e.len).sum()
    }

    /// Sum of extent page counts
    pub fn page_count(&self) -> u64 {
        self.extents.iter().map(Extent::page_count).sum()
    }

    /// Iterate every page of every extent, in order
    pub fn pages(&self) -> impl Iterator<Item = PhysAddr> + '_ {
        self.extents.iter().flat_map(Extent::pages)
    }

    /// Whether the list forms one physically contiguous run
    pub fn is_contiguous(&self) -> bool {
        self.extents.windows(2).all(|w| w[0].end() == w[1].base)
    }

    /// Consume the list
    pub fn into_vec(self) -> Vec<Extent> {
        self.extents
    }
}

impl FromIterator<Extent> for ExtentList {
    fn from_iter<I: IntoIterator<Item = Extent>>(iter: I) -> Self {
        let mut list = ExtentList::new();
        for extent in iter {
            list.push(extent);
        }
        list
    }
}

impl<'a> IntoIterator for &'a ExtentList {
    type Item = &'a Extent;
    type IntoIter = core::slice::Iter<'a, Extent>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// =============================================================================
// TESTS
// =============================================================================
