//! # Buffer Heap
//!
//! A heap wraps one backend and adds everything around it: deferred release,
//! the background worker, pressure reclaim, zero-on-free and the mapping
//! adapters.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                              Heap                                  │
//! │                                                                    │
//! │   allocate ──▶ Backend::allocate ──▶ BufferHandle ──▶ caller       │
//! │                                                                    │
//! │   last handle drop ──▶ DeferredFreeList::push ──▶ notify           │
//! │                               │                                    │
//! │              ┌────────────────┴─────────────────┐                  │
//! │              ▼                                  ▼                  │
//! │     DeferredFreeWorker                    ReclaimHook              │
//! │     (pop, destroy, forever)     (pop, destroy(force), bounded)     │
//! │              └────────────────┬─────────────────┘                  │
//! │                               ▼                                    │
//! │              destroy: unmap leftovers ─▶ zero ─▶ Backend::free     │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Teardown
//!
//! Close the free list, unregister the reclaim hook, stop and join the
//! worker, drain what is left on the caller's thread, then close the backend
//! gate and run the backend destructor. A second teardown is rejected.

use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use parking_lot::RwLock;
use spin::Mutex;

use crate::backend::{AllocRequest, BackendCaps, HeapBackend};
use crate::buffer::{Buffer, BufferFlags, BufferHandle, PrivateFlags};
use crate::error::{Error, Result};
use crate::factory::{BackendOps, HeapParams, HeapType};
use crate::free_list::DeferredFreeList;
use crate::mapper::{DeviceDomain, MemoryMapper, UserRegion};
use crate::reclaim::{MemoryPressure, ReclaimHook, Shrinker, ShrinkerId};
use crate::types::{page_align, VirtAddr, PAGE_SIZE};
use crate::worker::DeferredFreeWorker;
use crate::zero::BulkZeroer;

// =============================================================================
// HEAP FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Heap behaviour flags from platform data
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeapFlags: u32 {
        /// Release through the deferred-free list and worker
        const DEFER_FREE = 1 << 0;
    }
}

impl Default for HeapFlags {
    fn default() -> Self {
        HeapFlags::DEFER_FREE
    }
}

// =============================================================================
// HEAP CONFIGURATION
// =============================================================================

/// Runtime knobs for one heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Nice value the worker runs at (19 is the lowest priority)
    pub worker_nice: i32,
    /// Drain the free list and retry once when the backend is out of memory
    pub retry_after_drain: bool,
}

impl HeapConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            worker_nice: 19,
            retry_after_drain: true,
        }
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// HEAP STATE
// =============================================================================

/// Lifecycle state of a heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeapState {
    /// Serving allocations
    Live = 0,
    /// Teardown in progress
    TearingDown = 1,
    /// Backend released
    Destroyed = 2,
}

impl HeapState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => HeapState::Live,
            1 => HeapState::TearingDown,
            _ => HeapState::Destroyed,
        }
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Snapshot of heap counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Successful allocations
    pub allocations: u64,
    /// Bytes held by live buffers
    pub live_bytes: u64,
    /// Buffers released through the deferred-free list
    pub deferred: u64,
    /// Buffers torn down and returned to the backend
    pub destroyed: u64,
    /// Bytes freed by reclaim drains
    pub reclaimed_bytes: u64,
    /// Allocations that succeeded only after draining
    pub drain_retries: u64,
    /// Buffers whose zeroing failed
    pub zero_failures: u64,
    /// Backend frees that reported an error
    pub free_failures: u64,
    /// Buffers whose pages were kept out of reuse
    pub leaked: u64,
}

#[derive(Debug, Default)]
struct HeapCounters {
    allocations: AtomicU64,
    live_bytes: AtomicU64,
    deferred: AtomicU64,
    destroyed: AtomicU64,
    reclaimed_bytes: AtomicU64,
    drain_retries: AtomicU64,
    zero_failures: AtomicU64,
    free_failures: AtomicU64,
    leaked: AtomicU64,
}

impl HeapCounters {
    fn snapshot(&self) -> HeapStats {
        HeapStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            reclaimed_bytes: self.reclaimed_bytes.load(Ordering::Relaxed),
            drain_retries: self.drain_retries.load(Ordering::Relaxed),
            zero_failures: self.zero_failures.load(Ordering::Relaxed),
            free_failures: self.free_failures.load(Ordering::Relaxed),
            leaked: self.leaked.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// SHARED HEAP CORE
// =============================================================================

/// Heap state shared by the owner, the worker, the reclaim hook and buffers
pub(crate) struct HeapShared {
    pub(crate) id: u32,
    pub(crate) name: &'static str,
    pub(crate) heap_type: HeapType,
    pub(crate) flags: HeapFlags,
    /// Minimum alignment of every allocation
    align: u64,
    pub(crate) backend: Box<dyn HeapBackend>,
    mapper: Arc<dyn MemoryMapper>,
    pub(crate) free_list: DeferredFreeList,
    /// `true` while the backend may be called; cleared before its destructor
    backend_gate: RwLock<bool>,
    state: AtomicU8,
    stats: HeapCounters,
}

impl HeapShared {
    fn new(params: &HeapParams, backend: Box<dyn HeapBackend>, mapper: Arc<dyn MemoryMapper>) -> Self {
        Self {
            id: params.id,
            name: params.name,
            heap_type: params.heap_type,
            flags: params.flags,
            align: params.align.max(PAGE_SIZE),
            backend,
            mapper,
            free_list: DeferredFreeList::new(),
            backend_gate: RwLock::new(true),
            state: AtomicU8::new(HeapState::Live as u8),
            stats: HeapCounters::default(),
        }
    }

    pub(crate) fn state(&self) -> HeapState {
        HeapState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn defers_free(&self) -> bool {
        self.flags.contains(HeapFlags::DEFER_FREE)
    }

    /// Forward a shrink request (0 = count query) while the backend is open
    pub(crate) fn shrink_backend(&self, requested_pages: u64) -> u64 {
        if !self.backend.can_shrink() {
            return 0;
        }
        let gate = self.backend_gate.read_recursive();
        if !*gate {
            return 0;
        }
        self.backend.shrink(requested_pages)
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    fn allocate(
        self: &Arc<Self>,
        size: u64,
        align: u64,
        flags: BufferFlags,
        config: &HeapConfig,
    ) -> Result<BufferHandle> {
        if size == 0 {
            return Err(Error::InvalidParameter("zero-sized allocation"));
        }
        if !align.is_power_of_two() {
            return Err(Error::InvalidParameter("alignment must be a power of two"));
        }
        if self.state() != HeapState::Live {
            return Err(Error::HeapDestroyed);
        }

        let request = AllocRequest {
            size: page_align(size),
            align: align.max(self.align),
            flags,
        };

        let gate = self.backend_gate.read_recursive();
        if !*gate {
            return Err(Error::HeapDestroyed);
        }
        let extents = match self.backend.allocate(&request) {
            Err(e) if e.is_pressure() && self.defers_free() && config.retry_after_drain => {
                let drained = self.drain(0, false);
                debug!(
                    "{}: out of memory, drained {} bytes and retrying",
                    self.name, drained
                );
                let extents = self.backend.allocate(&request)?;
                self.stats.drain_retries.fetch_add(1, Ordering::Relaxed);
                extents
            },
            other => other?,
        };
        drop(gate);

        self.stats.allocations.fetch_add(1, Ordering::Relaxed);
        self.stats.live_bytes.fetch_add(request.size, Ordering::Relaxed);

        let buffer = Buffer::new(request.size, flags, extents, Arc::downgrade(self));
        #[cfg(feature = "debug")]
        trace!("{}: buffer {} extents {:?}", self.name, buffer.id(), buffer.extents());
        trace!("{}: allocated buffer {} ({} bytes)", self.name, buffer.id(), buffer.size());
        Ok(BufferHandle::new(buffer))
    }

    // -------------------------------------------------------------------------
    // Release / destroy
    // -------------------------------------------------------------------------

    /// Take back a buffer whose last owner is gone
    pub(crate) fn release(&self, buffer: Buffer) {
        self.stats.live_bytes.fetch_sub(buffer.size(), Ordering::Relaxed);

        let buffer = if self.defers_free() {
            match self.free_list.push(buffer) {
                Ok(()) => {
                    self.stats.deferred.fetch_add(1, Ordering::Relaxed);
                    return;
                },
                Err(buffer) => buffer,
            }
        } else {
            buffer
        };

        // Deferral is off or the heap is tearing down: destroy inline.
        let _ = self.destroy(buffer, false);
    }

    /// Tear a buffer down and hand its extents back to the backend
    ///
    /// Zero failure keeps the pages out of circulation and is returned so a
    /// reclaim drain can stop. Backend free failure is only logged.
    pub(crate) fn destroy(&self, mut buffer: Buffer, return_to_system: bool) -> Result<()> {
        if return_to_system {
            buffer.mark_shrinker_free();
        }

        let gate = self.backend_gate.read_recursive();
        if !*gate {
            warn!(
                "{}: buffer {} outlived its heap, leaking {} bytes",
                self.name,
                buffer.id(),
                buffer.size()
            );
            self.stats.leaked.fetch_add(1, Ordering::Relaxed);
            return Err(Error::HeapDestroyed);
        }

        self.drop_mappings(&buffer);

        let needs_zero = self.backend.capabilities().contains(BackendCaps::ZERO_ON_FREE)
            || buffer.flags().contains(BufferFlags::SECURE);
        if needs_zero {
            if let Err(e) = BulkZeroer::new(&*self.mapper).zero(buffer.extents(), buffer.is_cached()) {
                error!(
                    "{}: buffer {} could not be zeroed ({}), withholding {} bytes",
                    self.name,
                    buffer.id(),
                    e,
                    buffer.size()
                );
                self.stats.zero_failures.fetch_add(1, Ordering::Relaxed);
                self.stats.leaked.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        }

        let id = buffer.id();
        let return_to_system = buffer.private_flags().contains(PrivateFlags::SHRINKER_FREE);
        if let Err(e) = self.backend.free(buffer.into_extents(), return_to_system) {
            error!("{}: backend free of buffer {} failed: {}", self.name, id, e);
            self.stats.free_failures.fetch_add(1, Ordering::Relaxed);
        }
        drop(gate);

        self.stats.destroyed.fetch_add(1, Ordering::Relaxed);
        trace!("{}: destroyed buffer {}", self.name, id);
        Ok(())
    }

    /// Remove mappings a buffer still holds at destroy time
    fn drop_mappings(&self, buffer: &Buffer) {
        let mut mapping = buffer.mapping.lock();
        if mapping.kmap_count > 0 {
            warn!(
                "{}: buffer {} destroyed with {} kernel mapping users",
                self.name,
                buffer.id(),
                mapping.kmap_count
            );
            if let Some(vaddr) = mapping.vaddr.take() {
                self.mapper.unmap_kernel(vaddr);
            }
            mapping.kmap_count = 0;
        }
        for domain in mapping.devices.drain(..) {
            warn!(
                "{}: buffer {} destroyed while attached to {:?}",
                self.name,
                buffer.id(),
                domain
            );
            self.mapper.unmap_device(buffer.extents(), domain);
        }
    }

    /// Pop and destroy buffers until `budget` bytes are freed (0 = all)
    ///
    /// Buffers are drained whole, so the result may exceed `budget` by less
    /// than one buffer. Stops at the first destroy failure.
    pub(crate) fn drain(&self, budget: u64, return_to_system: bool) -> u64 {
        self.drain_with(budget, return_to_system, true)
    }

    /// Destroy every queued buffer, carrying on past buffers that fail
    ///
    /// Failed buffers are withheld and counted as leaked by `destroy`.
    fn drain_all(&self) -> u64 {
        self.drain_with(0, false, false)
    }

    fn drain_with(&self, budget: u64, return_to_system: bool, stop_on_error: bool) -> u64 {
        let mut freed = 0u64;
        while budget == 0 || freed < budget {
            // Nothing is unlinked once the backend is gone.
            let gate = self.backend_gate.read_recursive();
            if !*gate {
                break;
            }
            let Some(buffer) = self.free_list.pop_front() else {
                break;
            };
            let size = buffer.size();
            let result = self.destroy(buffer, return_to_system);
            drop(gate);
            match result {
                Ok(()) => freed += size,
                Err(e) if stop_on_error => {
                    debug!("{}: drain stopped after {} bytes: {}", self.name, freed, e);
                    break;
                },
                Err(_) => {},
            }
        }
        if return_to_system {
            self.stats.reclaimed_bytes.fetch_add(freed, Ordering::Relaxed);
        }
        freed
    }

    // -------------------------------------------------------------------------
    // Mapping adapters
    // -------------------------------------------------------------------------

    fn check_owner(self: &Arc<Self>, buffer: &Buffer) -> Result<()> {
        if buffer.heap_ptr() != Arc::as_ptr(self) {
            return Err(Error::InvalidParameter("buffer belongs to another heap"));
        }
        Ok(())
    }

    fn map_kernel(self: &Arc<Self>, buffer: &Buffer) -> Result<VirtAddr> {
        self.check_owner(buffer)?;
        let mut mapping = buffer.mapping.lock();
        if let Some(vaddr) = mapping.vaddr {
            mapping.kmap_count += 1;
            return Ok(vaddr);
        }
        let vaddr = self.mapper.map_kernel(buffer.extents(), buffer.is_cached())?;
        mapping.vaddr = Some(vaddr);
        mapping.kmap_count = 1;
        Ok(vaddr)
    }

    fn unmap_kernel(self: &Arc<Self>, buffer: &Buffer) -> Result<()> {
        self.check_owner(buffer)?;
        let mut mapping = buffer.mapping.lock();
        if mapping.kmap_count == 0 {
            return Err(Error::InvalidParameter("buffer has no kernel mapping"));
        }
        mapping.kmap_count -= 1;
        if mapping.kmap_count == 0 {
            if let Some(vaddr) = mapping.vaddr.take() {
                self.mapper.unmap_kernel(vaddr);
            }
        }
        Ok(())
    }

    fn map_user(self: &Arc<Self>, buffer: &Buffer, region: &UserRegion) -> Result<()> {
        self.check_owner(buffer)?;
        if region.len == 0 {
            return Err(Error::InvalidParameter("empty user region"));
        }
        let end = region
            .offset
            .checked_add(region.len)
            .ok_or(Error::InvalidParameter("user region overflows"))?;
        if end > buffer.size() {
            return Err(Error::InvalidParameter("user region exceeds buffer"));
        }
        // Serialise against destroy tearing mappings down.
        let _mapping = buffer.mapping.lock();
        self.mapper.map_user(buffer.extents(), region)
    }

    fn map_device(self: &Arc<Self>, buffer: &Buffer, domain: DeviceDomain) -> Result<()> {
        self.check_owner(buffer)?;
        let mut mapping = buffer.mapping.lock();
        if mapping.devices.contains(&domain) {
            return Err(Error::InvalidParameter("buffer already attached to domain"));
        }
        self.mapper.map_device(buffer.extents(), domain)?;
        mapping.devices.push(domain);
        Ok(())
    }

    fn unmap_device(self: &Arc<Self>, buffer: &Buffer, domain: DeviceDomain) -> Result<()> {
        self.check_owner(buffer)?;
        let mut mapping = buffer.mapping.lock();
        let pos = mapping
            .devices
            .iter()
            .position(|&d| d == domain)
            .ok_or(Error::InvalidParameter("buffer not attached to domain"))?;
        mapping.devices.swap_remove(pos);
        self.mapper.unmap_device(buffer.extents(), domain);
        Ok(())
    }
}

impl fmt::Debug for HeapShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapShared")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("heap_type", &self.heap_type)
            .field("state", &self.state())
            .field("free_list_size", &self.free_list.size())
            .finish()
    }
}

// =============================================================================
// HEAP
// =============================================================================

/// A buffer heap
pub struct Heap {
    shared: Arc<HeapShared>,
    config: HeapConfig,
    ops: Arc<BackendOps>,
    pressure: Arc<MemoryPressure>,
    worker: Mutex<Option<DeferredFreeWorker>>,
    hook: Mutex<Option<ShrinkerId>>,
}

impl Heap {
    /// Wrap a freshly constructed backend: spawn the worker, register the
    /// reclaim hook
    pub(crate) fn start(
        params: &HeapParams,
        backend: Box<dyn HeapBackend>,
        ops: Arc<BackendOps>,
        mapper: Arc<dyn MemoryMapper>,
        pressure: Arc<MemoryPressure>,
    ) -> Result<Self> {
        let shared = Arc::new(HeapShared::new(params, backend, mapper));

        let worker = if shared.defers_free() {
            match DeferredFreeWorker::spawn(shared.clone(), params.config.worker_nice) {
                Ok(worker) => Some(worker),
                Err(e) => {
                    (ops.destroy)(&*shared.backend);
                    return Err(e);
                },
            }
        } else {
            None
        };

        let hook = if shared.defers_free() || shared.backend.can_shrink() {
            Some(pressure.register(Arc::new(ReclaimHook::new(shared.clone()))))
        } else {
            None
        };

        info!(
            "{}: heap {} ({}) online, deferred free {}",
            shared.name,
            shared.id,
            shared.heap_type.name(),
            if worker.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            shared,
            config: params.config,
            ops,
            pressure,
            worker: Mutex::new(worker),
            hook: Mutex::new(hook),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<HeapShared> {
        &self.shared
    }

    /// Heap id from platform data
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Heap name
    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// Backend type
    pub fn heap_type(&self) -> HeapType {
        self.shared.heap_type
    }

    /// Heap flags
    pub fn flags(&self) -> HeapFlags {
        self.shared.flags
    }

    /// Lifecycle state
    pub fn state(&self) -> HeapState {
        self.shared.state()
    }

    /// Backend capabilities
    pub fn capabilities(&self) -> BackendCaps {
        self.shared.backend.capabilities()
    }

    /// Counter snapshot
    pub fn stats(&self) -> HeapStats {
        self.shared.stats.snapshot()
    }

    /// Allocate a buffer of at least `size` bytes at the heap's alignment
    pub fn allocate(&self, size: u64, flags: BufferFlags) -> Result<BufferHandle> {
        self.shared.allocate(size, PAGE_SIZE, flags, &self.config)
    }

    /// Allocate with an explicit alignment of the first extent, never below
    /// the heap's own
    pub fn allocate_aligned(&self, size: u64, align: u64, flags: BufferFlags) -> Result<BufferHandle> {
        self.shared.allocate(size, align, flags, &self.config)
    }

    /// Bytes waiting on the deferred-free list
    pub fn free_list_size(&self) -> u64 {
        self.shared.free_list.size()
    }

    /// Buffers waiting on the deferred-free list
    pub fn free_list_len(&self) -> usize {
        self.shared.free_list.len()
    }

    /// Destroy queued buffers until `budget` bytes are freed (0 = all)
    pub fn drain_free_list(&self, budget: u64) -> u64 {
        self.shared.drain(budget, false)
    }

    /// Like [`drain_free_list`](Self::drain_free_list), but pages bypass
    /// backend caches and go back to the system
    pub fn shrink_free_list(&self, budget: u64) -> u64 {
        self.shared.drain(budget, true)
    }

    /// Run the reclaim hook directly; returns the reclaimable estimate
    pub fn reclaim(&self, requested_pages: u64, may_block: bool) -> u64 {
        ReclaimHook::for_heap(self).reclaim(requested_pages, may_block)
    }

    /// Map the buffer into the kernel, sharing an existing mapping
    pub fn map_kernel(&self, buffer: &BufferHandle) -> Result<VirtAddr> {
        self.shared.map_kernel(buffer)
    }

    /// Drop one kernel mapping user
    pub fn unmap_kernel(&self, buffer: &BufferHandle) -> Result<()> {
        self.shared.unmap_kernel(buffer)
    }

    /// Map (part of) the buffer into a user address space
    pub fn map_user(&self, buffer: &BufferHandle, region: &UserRegion) -> Result<()> {
        self.shared.map_user(buffer, region)
    }

    /// Attach the buffer to a device domain
    pub fn map_device(&self, buffer: &BufferHandle, domain: DeviceDomain) -> Result<()> {
        self.shared.map_device(buffer, domain)
    }

    /// Detach the buffer from a device domain
    pub fn unmap_device(&self, buffer: &BufferHandle, domain: DeviceDomain) -> Result<()> {
        self.shared.unmap_device(buffer, domain)
    }

    /// Park the worker for a system suspend
    pub fn suspend(&self) {
        self.shared.free_list.condition().suspend();
    }

    /// Release the worker after a system suspend
    pub fn resume(&self) {
        self.shared.free_list.condition().resume();
    }

    /// Stop the worker, unregister reclaim, drain, release the backend
    pub(crate) fn teardown(&self) -> Result<()> {
        self.shared
            .state
            .compare_exchange(
                HeapState::Live as u8,
                HeapState::TearingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| Error::HeapDestroyed)?;

        self.shared.free_list.close();
        let hook = self.hook.lock().take();
        if let Some(id) = hook {
            self.pressure.unregister(id);
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.stop();
        }

        let leaked_before = self.shared.stats.leaked.load(Ordering::Relaxed);
        let drained = self.shared.drain_all();
        let withheld = self.shared.stats.leaked.load(Ordering::Relaxed) - leaked_before;
        if withheld > 0 {
            warn!("{}: {} buffers withheld at teardown", self.name(), withheld);
        }

        {
            let mut gate = self.shared.backend_gate.write();
            *gate = false;
            (self.ops.destroy)(&*self.shared.backend);
        }
        self.shared
            .state
            .store(HeapState::Destroyed as u8, Ordering::Release);

        info!(
            "{}: heap {} destroyed, drained {} bytes at teardown",
            self.name(),
            self.id(),
            drained
        );
        Ok(())
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("shared", &self.shared)
            .field("config", &self.config)
            .finish()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if self.state() == HeapState::Live {
            let _ = self.teardown();
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use core::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::factory::HeapFactory;
    use crate::mapper::{AddressSpaceId, HostMapper};
    use crate::types::{Extent, ExtentList, PhysAddr};
    use crate::zero::tests::RecordingMapper;

    /// Shared record of what the backend was asked to do
    #[derive(Debug, Default)]
    struct Tally {
        next_base: AtomicU64,
        /// Allocations left to fail with `OutOfMemory`
        oom: AtomicU64,
        fail_free: AtomicBool,
        frees: Mutex<Vec<(PhysAddr, bool)>>,
        last_align: AtomicU64,
    }

    impl Tally {
        fn frees(&self) -> Vec<(PhysAddr, bool)> {
            self.frees.lock().clone()
        }
    }

    /// Backend handing out fake, never-dereferenced addresses
    #[derive(Debug)]
    struct CountingBackend {
        tally: Arc<Tally>,
        caps: BackendCaps,
    }

    impl HeapBackend for CountingBackend {
        fn capabilities(&self) -> BackendCaps {
            self.caps
        }

        fn allocate(&self, request: &AllocRequest) -> Result<ExtentList> {
            let oom = self
                .tally
                .oom
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            if oom.is_ok() {
                return Err(Error::OutOfMemory);
            }
            self.tally.last_align.store(request.align, Ordering::Release);
            let base = 0x4000_0000 + self.tally.next_base.fetch_add(request.size, Ordering::AcqRel);
            Ok(core::iter::once(Extent::new(PhysAddr::new(base), request.size)).collect())
        }

        fn free(&self, extents: ExtentList, return_to_system: bool) -> Result<()> {
            if self.tally.fail_free.load(Ordering::Acquire) {
                return Err(Error::InvalidParameter("rejected"));
            }
            if let Some(first) = extents.iter().next() {
                self.tally.frees.lock().push((first.base, return_to_system));
            }
            Ok(())
        }
    }

    fn factory(mapper: Arc<dyn MemoryMapper>, caps: BackendCaps) -> (HeapFactory, Arc<Tally>) {
        let tally = Arc::new(Tally::default());
        let factory = HeapFactory::new(mapper, Arc::new(MemoryPressure::new()));
        let ctor_tally = tally.clone();
        factory.register(
            HeapType::Carveout,
            BackendOps::with_default_teardown(Box::new(move |_: &HeapParams| {
                Ok(Box::new(CountingBackend {
                    tally: ctor_tally.clone(),
                    caps,
                }) as Box<dyn HeapBackend>)
            })),
        );
        (factory, tally)
    }

    fn params(id: u32, flags: HeapFlags) -> HeapParams {
        HeapParams::region(HeapType::Carveout, id, "test", PhysAddr::new(0x4000_0000), 0).with_flags(flags)
    }

    fn first_base(buffer: &Buffer) -> PhysAddr {
        buffer.extents().iter().next().unwrap().base
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        done()
    }

    #[test]
    fn test_reclaim_drains_oldest_first() {
        let (factory, tally) = factory(Arc::new(RecordingMapper::default()), BackendCaps::empty());
        let heap = factory.create_heap(&params(1, HeapFlags::DEFER_FREE)).unwrap();
        heap.suspend();

        let buffers: Vec<_> = [4096, 8192, 4096]
            .iter()
            .map(|&s| heap.allocate(s, BufferFlags::empty()).unwrap())
            .collect();
        let oldest = first_base(&buffers[0]);
        drop(buffers);
        assert_eq!(heap.free_list_size(), 16384);

        // Three pages stay on the list, the backend has nothing cached.
        assert_eq!(heap.reclaim(1, true), 3);
        assert_eq!(heap.free_list_size(), 12288);
        assert_eq!(tally.frees(), vec![(oldest, true)]);
        assert_eq!(heap.stats().reclaimed_bytes, 4096);

        heap.resume();
        assert!(wait_until(|| tally.frees().len() == 3));
        assert!(tally.frees()[1..].iter().all(|&(_, forced)| !forced));
        assert_eq!(heap.free_list_size(), 0);
    }

    #[test]
    fn test_worker_destroys_released_buffers() {
        let (factory, tally) = factory(Arc::new(RecordingMapper::default()), BackendCaps::empty());
        let heap = factory.create_heap(&params(1, HeapFlags::DEFER_FREE)).unwrap();

        for _ in 0..10 {
            drop(heap.allocate(PAGE_SIZE, BufferFlags::CACHED).unwrap());
        }
        assert!(wait_until(|| tally.frees().len() == 10));

        let stats = heap.stats();
        assert_eq!(stats.allocations, 10);
        assert_eq!(stats.deferred, 10);
        assert!(wait_until(|| heap.stats().destroyed == 10));
        assert_eq!(stats.live_bytes, 0);
    }

    #[test]
    fn test_shared_handle_releases_on_last_drop() {
        let (factory, tally) = factory(Arc::new(RecordingMapper::default()), BackendCaps::empty());
        let heap = factory.create_heap(&params(1, HeapFlags::empty())).unwrap();

        let handle = heap.allocate(PAGE_SIZE, BufferFlags::empty()).unwrap();
        let clone = handle.clone();
        drop(handle);
        assert!(tally.frees().is_empty());
        drop(clone);
        assert_eq!(tally.frees().len(), 1);
    }

    #[test]
    fn test_synchronous_release_without_deferral() {
        let (factory, tally) = factory(Arc::new(RecordingMapper::default()), BackendCaps::empty());
        let heap = factory.create_heap(&params(1, HeapFlags::empty())).unwrap();
        // Nothing to defer and nothing to shrink: no reclaim hook.
        assert!(factory.pressure().is_empty());

        drop(heap.allocate(3 * PAGE_SIZE, BufferFlags::empty()).unwrap());
        assert_eq!(tally.frees().len(), 1);
        assert_eq!(heap.stats().deferred, 0);
        assert_eq!(heap.free_list_len(), 0);
    }

    #[test]
    fn test_out_of_memory_drains_and_retries() {
        let (factory, tally) = factory(Arc::new(RecordingMapper::default()), BackendCaps::empty());
        let heap = factory.create_heap(&params(1, HeapFlags::DEFER_FREE)).unwrap();
        heap.suspend();

        drop(heap.allocate(PAGE_SIZE, BufferFlags::empty()).unwrap());
        drop(heap.allocate(PAGE_SIZE, BufferFlags::empty()).unwrap());
        assert_eq!(heap.free_list_len(), 2);

        tally.oom.store(1, Ordering::Release);
        let retried = heap.allocate(PAGE_SIZE, BufferFlags::empty()).unwrap();
        assert_eq!(heap.free_list_len(), 0);
        assert_eq!(tally.frees().len(), 2);
        assert_eq!(heap.stats().drain_retries, 1);

        tally.oom.store(2, Ordering::Release);
        assert_eq!(
            heap.allocate(PAGE_SIZE, BufferFlags::empty()).map(|_| ()),
            Err(Error::OutOfMemory)
        );
        drop(retried);
        heap.resume();
    }

    #[test]
    fn test_retry_disabled_by_config() {
        let (factory, tally) = factory(Arc::new(RecordingMapper::default()), BackendCaps::empty());
        let config = HeapConfig {
            retry_after_drain: false,
            ..HeapConfig::new()
        };
        let heap = factory
            .create_heap(&params(1, HeapFlags::DEFER_FREE).with_config(config))
            .unwrap();

        tally.oom.store(1, Ordering::Release);
        assert_eq!(
            heap.allocate(PAGE_SIZE, BufferFlags::empty()).map(|_| ()),
            Err(Error::OutOfMemory)
        );
        assert_eq!(heap.stats().drain_retries, 0);
    }

    #[test]
    fn test_zero_failure_withholds_pages() {
        let mapper = Arc::new(RecordingMapper::failing_at(0));
        let (factory, tally) = factory(mapper, BackendCaps::ZERO_ON_FREE);
        let heap = factory.create_heap(&params(1, HeapFlags::empty())).unwrap();

        drop(heap.allocate(2 * PAGE_SIZE, BufferFlags::empty()).unwrap());
        assert!(tally.frees().is_empty());

        let stats = heap.stats();
        assert_eq!(stats.zero_failures, 1);
        assert_eq!(stats.leaked, 1);
        assert_eq!(stats.destroyed, 0);
    }

    #[test]
    fn test_drain_stops_at_zero_failure() {
        let mapper = Arc::new(RecordingMapper::failing_at(0));
        let (factory, tally) = factory(mapper, BackendCaps::ZERO_ON_FREE);
        let heap = factory.create_heap(&params(1, HeapFlags::DEFER_FREE)).unwrap();
        heap.suspend();

        drop(heap.allocate(PAGE_SIZE, BufferFlags::empty()).unwrap());
        drop(heap.allocate(PAGE_SIZE, BufferFlags::empty()).unwrap());

        // Each pass stops at the first buffer that cannot be zeroed.
        assert_eq!(heap.shrink_free_list(0), 0);
        assert_eq!(heap.free_list_len(), 1);
        assert_eq!(heap.shrink_free_list(0), 0);
        assert_eq!(heap.free_list_len(), 0);

        assert!(tally.frees().is_empty());
        assert_eq!(heap.stats().leaked, 2);
        heap.resume();
    }

    #[test]
    fn test_secure_buffers_are_zeroed() {
        let mapper = Arc::new(RecordingMapper::default());
        let (factory, _tally) = factory(mapper.clone(), BackendCaps::empty());
        let heap = factory.create_heap(&params(1, HeapFlags::empty())).unwrap();

        drop(heap.allocate(PAGE_SIZE, BufferFlags::empty()).unwrap());
        assert!(mapper.requests.lock().is_empty());

        drop(heap.allocate(2 * PAGE_SIZE, BufferFlags::SECURE).unwrap());
        assert_eq!(*mapper.requests.lock(), vec![2]);
    }

    #[test]
    fn test_backend_free_failure_is_counted() {
        let (factory, tally) = factory(Arc::new(RecordingMapper::default()), BackendCaps::empty());
        let heap = factory.create_heap(&params(1, HeapFlags::empty())).unwrap();
        tally.fail_free.store(true, Ordering::Release);

        drop(heap.allocate(PAGE_SIZE, BufferFlags::empty()).unwrap());
        let stats = heap.stats();
        assert_eq!(stats.free_failures, 1);
        assert_eq!(stats.destroyed, 1);
    }

    #[test]
    fn test_kernel_mapping_refcount() {
        let mapper = Arc::new(RecordingMapper::default());
        let (factory, _tally) = factory(mapper.clone(), BackendCaps::empty());
        let heap = factory.create_heap(&params(1, HeapFlags::empty())).unwrap();
        let buffer = heap.allocate(PAGE_SIZE, BufferFlags::CACHED).unwrap();

        let a = heap.map_kernel(&buffer).unwrap();
        let b = heap.map_kernel(&buffer).unwrap();
        assert_eq!(a, b);
        assert_eq!(buffer.kmap_count(), 2);
        assert_eq!(mapper.requests.lock().len(), 1);

        heap.unmap_kernel(&buffer).unwrap();
        heap.unmap_kernel(&buffer).unwrap();
        assert_eq!(buffer.kmap_count(), 0);
        assert!(matches!(heap.unmap_kernel(&buffer), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_destroy_removes_leftover_mappings() {
        let mapper = Arc::new(HostMapper::new());
        let (factory, tally) = factory(mapper.clone(), BackendCaps::empty());
        let heap = factory.create_heap(&params(1, HeapFlags::empty())).unwrap();
        let buffer = heap.allocate(PAGE_SIZE, BufferFlags::empty()).unwrap();

        heap.map_kernel(&buffer).unwrap();
        heap.map_device(&buffer, DeviceDomain(1)).unwrap();
        assert!(matches!(
            heap.map_device(&buffer, DeviceDomain(1)),
            Err(Error::InvalidParameter(_))
        ));
        assert_eq!(mapper.device_mappings(), 1);

        drop(buffer);
        assert_eq!(mapper.device_mappings(), 0);
        assert_eq!(tally.frees().len(), 1);
    }

    #[test]
    fn test_device_detach() {
        let mapper = Arc::new(HostMapper::new());
        let (factory, _tally) = factory(mapper.clone(), BackendCaps::empty());
        let heap = factory.create_heap(&params(1, HeapFlags::empty())).unwrap();
        let buffer = heap.allocate(PAGE_SIZE, BufferFlags::empty()).unwrap();

        heap.map_device(&buffer, DeviceDomain(2)).unwrap();
        heap.unmap_device(&buffer, DeviceDomain(2)).unwrap();
        assert_eq!(mapper.device_mappings(), 0);
        assert!(matches!(
            heap.unmap_device(&buffer, DeviceDomain(2)),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_user_mapping_bounds() {
        let mapper = Arc::new(HostMapper::new());
        let (factory, _tally) = factory(mapper.clone(), BackendCaps::empty());
        let heap = factory.create_heap(&params(1, HeapFlags::empty())).unwrap();
        let buffer = heap.allocate(2 * PAGE_SIZE, BufferFlags::empty()).unwrap();

        let region = |offset, len| UserRegion {
            space: AddressSpaceId(1),
            start: VirtAddr::new(0x7000_0000),
            len,
            offset,
        };
        heap.map_user(&buffer, &region(PAGE_SIZE, PAGE_SIZE)).unwrap();
        for bad in [region(PAGE_SIZE, 2 * PAGE_SIZE), region(0, 0), region(u64::MAX, 2)] {
            assert!(matches!(heap.map_user(&buffer, &bad), Err(Error::InvalidParameter(_))));
        }
        assert_eq!(mapper.user_regions().len(), 1);
    }

    #[test]
    fn test_foreign_buffer_rejected() {
        let (factory, _tally) = factory(Arc::new(RecordingMapper::default()), BackendCaps::empty());
        let one = factory.create_heap(&params(1, HeapFlags::empty())).unwrap();
        let two = factory.create_heap(&params(2, HeapFlags::empty())).unwrap();

        let buffer = one.allocate(PAGE_SIZE, BufferFlags::empty()).unwrap();
        assert!(matches!(two.map_kernel(&buffer), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_invalid_sizes() {
        let (factory, _tally) = factory(Arc::new(RecordingMapper::default()), BackendCaps::empty());
        let heap = factory.create_heap(&params(1, HeapFlags::empty())).unwrap();

        assert!(matches!(
            heap.allocate(0, BufferFlags::empty()),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            heap.allocate_aligned(PAGE_SIZE, 3 * PAGE_SIZE, BufferFlags::empty()),
            Err(Error::InvalidParameter(_))
        ));
        // Sizes round up to whole pages.
        assert_eq!(heap.allocate(1, BufferFlags::empty()).unwrap().size(), PAGE_SIZE);
    }

    #[test]
    fn test_reclaim_needs_permission_to_block() {
        let (factory, tally) = factory(Arc::new(RecordingMapper::default()), BackendCaps::empty());
        let heap = factory.create_heap(&params(1, HeapFlags::DEFER_FREE)).unwrap();
        heap.suspend();

        drop(heap.allocate(PAGE_SIZE, BufferFlags::empty()).unwrap());
        assert_eq!(heap.reclaim(4, false), 1);
        assert_eq!(heap.reclaim(0, true), 1);
        assert!(tally.frees().is_empty());
        heap.resume();
    }

    #[test]
    fn test_teardown_drains_queue() {
        let (factory, tally) = factory(Arc::new(RecordingMapper::default()), BackendCaps::empty());
        let heap = factory.create_heap(&params(1, HeapFlags::DEFER_FREE)).unwrap();
        heap.suspend();

        for _ in 0..3 {
            drop(heap.allocate(PAGE_SIZE, BufferFlags::empty()).unwrap());
        }
        assert_eq!(heap.free_list_len(), 3);

        factory.destroy_heap(&heap).unwrap();
        assert_eq!(tally.frees().len(), 3);
        assert_eq!(heap.stats().destroyed, 3);
        assert!(factory.pressure().is_empty());
    }

    #[test]
    fn test_teardown_continues_past_zero_failure() {
        let mapper = Arc::new(RecordingMapper::failing_once());
        let (factory, tally) = factory(mapper, BackendCaps::ZERO_ON_FREE);
        let heap = factory.create_heap(&params(1, HeapFlags::DEFER_FREE)).unwrap();
        heap.suspend();

        let buffers: Vec<_> = (0..3)
            .map(|_| heap.allocate(PAGE_SIZE, BufferFlags::empty()).unwrap())
            .collect();
        let survivors: Vec<_> = buffers[1..].iter().map(|b| first_base(b)).collect();
        drop(buffers);
        assert_eq!(heap.free_list_len(), 3);

        factory.destroy_heap(&heap).unwrap();
        assert_eq!(heap.free_list_len(), 0);
        assert_eq!(
            tally.frees(),
            survivors.into_iter().map(|base| (base, false)).collect::<Vec<_>>()
        );

        let stats = heap.stats();
        assert_eq!(stats.zero_failures, 1);
        assert_eq!(stats.leaked, 1);
        assert_eq!(stats.destroyed, 2);
    }

    #[test]
    fn test_heap_alignment_applies_to_allocations() {
        let (factory, tally) = factory(Arc::new(RecordingMapper::default()), BackendCaps::empty());
        let aligned = HeapParams {
            align: 16 * PAGE_SIZE,
            ..params(1, HeapFlags::empty())
        };
        let heap = factory.create_heap(&aligned).unwrap();

        let _small = heap.allocate(PAGE_SIZE, BufferFlags::empty()).unwrap();
        assert_eq!(tally.last_align.load(Ordering::Acquire), 16 * PAGE_SIZE);

        let _large = heap
            .allocate_aligned(PAGE_SIZE, 64 * PAGE_SIZE, BufferFlags::empty())
            .unwrap();
        assert_eq!(tally.last_align.load(Ordering::Acquire), 64 * PAGE_SIZE);
    }

    #[test]
    fn test_drain_after_backend_closed_unlinks_nothing() {
        let (factory, tally) = factory(Arc::new(RecordingMapper::default()), BackendCaps::empty());
        let heap = factory.create_heap(&params(1, HeapFlags::DEFER_FREE)).unwrap();
        let shared = heap.shared().clone();
        factory.destroy_heap(&heap).unwrap();

        // A stale reclaim pass finds the gate closed before popping.
        let hook = ReclaimHook::new(shared);
        assert_eq!(hook.scan(4, true), 0);
        assert!(tally.frees().is_empty());
        assert_eq!(heap.stats().leaked, 0);
    }

    #[test]
    fn test_release_after_teardown_leaks() {
        let (factory, tally) = factory(Arc::new(RecordingMapper::default()), BackendCaps::empty());
        let heap = factory.create_heap(&params(1, HeapFlags::DEFER_FREE)).unwrap();
        let buffer = heap.allocate(PAGE_SIZE, BufferFlags::empty()).unwrap();

        factory.destroy_heap(&heap).unwrap();
        drop(buffer);
        assert!(tally.frees().is_empty());
        assert_eq!(heap.stats().leaked, 1);
        assert_eq!(heap.free_list_len(), 0);
    }
}
