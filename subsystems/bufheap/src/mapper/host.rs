//! # Host Mapper
//!
//! Identity mapper for hosted builds, where "physical" addresses handed out by
//! [`HostPageBackend`](crate::backend::host::HostPageBackend) are ordinary
//! process addresses. There is no page table to program, so only physically
//! contiguous page sets can be given a single contiguous view.

use spin::Mutex;

use super::{DeviceDomain, DirectMap, MemoryMapper, UserRegion};
use crate::error::{Error, Result};
use crate::types::{ExtentList, PhysAddr, VirtAddr, PAGE_SIZE};

/// Identity mapper over process memory
#[derive(Debug, Default)]
pub struct HostMapper {
    /// Device attachments, keyed by domain and first page
    devices: Mutex<Vec<(DeviceDomain, PhysAddr)>>,
    /// User regions populated so far
    user_regions: Mutex<Vec<UserRegion>>,
}

impl HostMapper {
    /// Create a new host mapper
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live device attachments
    pub fn device_mappings(&self) -> usize {
        self.devices.lock().len()
    }

    /// User regions populated so far
    pub fn user_regions(&self) -> Vec<UserRegion> {
        self.user_regions.lock().clone()
    }

    fn first_page(extents: &ExtentList) -> Result<PhysAddr> {
        extents
            .iter()
            .next()
            .map(|e| e.base)
            .ok_or(Error::MapFailure("empty extent list"))
    }
}

// SAFETY: every address returned is the identity of memory owned by the
// caller's extents, which stays allocated until the caller frees it.
unsafe impl MemoryMapper for HostMapper {
    fn direct_map(&self) -> Option<DirectMap> {
        Some(DirectMap::IDENTITY)
    }

    fn map_pages(&self, pages: &[PhysAddr], _cached: bool) -> Result<VirtAddr> {
        let first = *pages.first().ok_or(Error::MapFailure("no pages"))?;
        let contiguous = pages
            .windows(2)
            .all(|w| w[1].raw() == w[0].raw() + PAGE_SIZE);
        if !contiguous {
            return Err(Error::MapFailure("host mapper cannot stitch pages"));
        }
        Ok(VirtAddr::new(first.raw()))
    }

    fn unmap_pages(&self, _vaddr: VirtAddr, _page_count: usize) {}

    fn map_kernel(&self, extents: &ExtentList, _cached: bool) -> Result<VirtAddr> {
        if !extents.is_contiguous() {
            return Err(Error::MapFailure("host mapper cannot stitch extents"));
        }
        Ok(VirtAddr::new(Self::first_page(extents)?.raw()))
    }

    fn unmap_kernel(&self, _vaddr: VirtAddr) {}

    fn map_user(&self, _extents: &ExtentList, region: &UserRegion) -> Result<()> {
        self.user_regions.lock().push(*region);
        Ok(())
    }

    fn map_device(&self, extents: &ExtentList, domain: DeviceDomain) -> Result<()> {
        let first = Self::first_page(extents)?;
        self.devices.lock().push((domain, first));
        Ok(())
    }

    fn unmap_device(&self, extents: &ExtentList, domain: DeviceDomain) {
        if let Ok(first) = Self::first_page(extents) {
            let mut devices = self.devices.lock();
            if let Some(pos) = devices.iter().position(|&d| d == (domain, first)) {
                devices.swap_remove(pos);
            }
        }
    }
}
