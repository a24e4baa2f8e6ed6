//! # Heap Factory
//!
//! Platform setup code describes each heap with [`HeapParams`] and asks the
//! factory to build it. The factory looks the heap's [`HeapType`] up in its
//! dispatch table, runs the registered backend constructor, and starts the
//! heap (free list, worker, reclaim hook). [`HeapFactory::destroy_heap`]
//! undoes all of it.
//!
//! Hosted builds get [`HeapFactory::hosted`], which registers the pooled-page
//! [`HostPageBackend`] for [`HeapType::System`]. Every other tag is bound by
//! platform code through [`HeapFactory::register`].

use core::fmt;
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use spin::Mutex;

use crate::backend::{HeapBackend, HostPageBackend, HostPageConfig};
use crate::error::{Error, Result};
use crate::heap::{Heap, HeapConfig, HeapFlags, HeapState};
use crate::mapper::{HostMapper, MemoryMapper};
use crate::reclaim::MemoryPressure;
use crate::types::{PhysAddr, PAGE_SIZE};

// =============================================================================
// HEAP TYPE
// =============================================================================

/// Backend type tag from platform data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum HeapType {
    /// Pooled discontiguous pages
    System = 0,
    /// Physically contiguous pages from the page allocator
    SystemContig = 1,
    /// Reserved carveout region
    Carveout = 2,
    /// Fixed-size chunks from a reserved region
    Chunk = 3,
    /// DMA / CMA window
    Dma = 4,
    /// Vendor secure heap
    Secure = 5,
}

impl HeapType {
    /// Number of tags
    pub const COUNT: usize = 6;

    /// All tags in table order
    pub const ALL: [HeapType; Self::COUNT] = [
        HeapType::System,
        HeapType::SystemContig,
        HeapType::Carveout,
        HeapType::Chunk,
        HeapType::Dma,
        HeapType::Secure,
    ];

    /// Raw tag value
    pub const fn raw(self) -> u32 {
        self as u32
    }

    /// Human-readable name
    pub const fn name(self) -> &'static str {
        match self {
            HeapType::System => "system",
            HeapType::SystemContig => "system-contig",
            HeapType::Carveout => "carveout",
            HeapType::Chunk => "chunk",
            HeapType::Dma => "dma",
            HeapType::Secure => "secure",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u32> for HeapType {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        HeapType::ALL
            .get(raw as usize)
            .copied()
            .ok_or(Error::InvalidConfig("unknown heap type tag"))
    }
}

impl fmt::Display for HeapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// HEAP PARAMETERS
// =============================================================================

/// Platform description of one heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapParams {
    /// Backend type
    pub heap_type: HeapType,
    /// Platform heap id, unique among live heaps of a factory
    pub id: u32,
    /// Name used in logs and the worker thread name
    pub name: &'static str,
    /// Base of the backing region, for region-based backends
    pub base: PhysAddr,
    /// Size of the backing region in bytes, 0 for unbounded
    pub size: u64,
    /// Minimum buffer alignment
    pub align: u64,
    /// Heap flags
    pub flags: HeapFlags,
    /// Runtime knobs
    pub config: HeapConfig,
}

impl HeapParams {
    /// Unbounded system heap with deferred free
    pub const fn system(id: u32, name: &'static str) -> Self {
        Self {
            heap_type: HeapType::System,
            id,
            name,
            base: PhysAddr::new(0),
            size: 0,
            align: PAGE_SIZE,
            flags: HeapFlags::DEFER_FREE,
            config: HeapConfig::new(),
        }
    }

    /// Region-backed heap of the given type
    pub const fn region(heap_type: HeapType, id: u32, name: &'static str, base: PhysAddr, size: u64) -> Self {
        Self {
            heap_type,
            base,
            size,
            ..Self::system(id, name)
        }
    }

    /// Same parameters with different heap flags
    pub const fn with_flags(mut self, flags: HeapFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Same parameters with a different runtime configuration
    pub const fn with_config(mut self, config: HeapConfig) -> Self {
        self.config = config;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("heap name is empty"));
        }
        if !self.align.is_power_of_two() {
            return Err(Error::InvalidConfig("heap alignment is not a power of two"));
        }
        if !self.base.is_page_aligned() {
            return Err(Error::InvalidConfig("heap base is not page aligned"));
        }
        if self.size % PAGE_SIZE != 0 {
            return Err(Error::InvalidConfig("heap size is not page aligned"));
        }
        Ok(())
    }
}

impl Default for HeapParams {
    fn default() -> Self {
        Self::system(0, "system")
    }
}

// =============================================================================
// DISPATCH TABLE
// =============================================================================

/// Builds a backend from platform parameters
pub type BackendConstructor = Box<dyn Fn(&HeapParams) -> Result<Box<dyn HeapBackend>> + Send + Sync>;

/// Releases backend resources at heap teardown
pub type BackendDestructor = Box<dyn Fn(&dyn HeapBackend) + Send + Sync>;

/// Constructor/destructor pair bound to one heap type
pub struct BackendOps {
    /// Constructor
    pub create: BackendConstructor,
    /// Destructor
    pub destroy: BackendDestructor,
}

impl BackendOps {
    /// Pair a constructor with a destructor
    pub fn new(create: BackendConstructor, destroy: BackendDestructor) -> Self {
        Self { create, destroy }
    }

    /// Constructor only; the destructor calls [`HeapBackend::teardown`]
    pub fn with_default_teardown(create: BackendConstructor) -> Self {
        Self::new(create, Box::new(|backend: &dyn HeapBackend| backend.teardown()))
    }
}

impl fmt::Debug for BackendOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendOps").finish_non_exhaustive()
    }
}

// =============================================================================
// HEAP FACTORY
// =============================================================================

/// Builds and destroys heaps by type tag
pub struct HeapFactory {
    mapper: Arc<dyn MemoryMapper>,
    pressure: Arc<MemoryPressure>,
    table: Mutex<[Option<Arc<BackendOps>>; HeapType::COUNT]>,
    heaps: Mutex<Vec<Weak<Heap>>>,
}

impl HeapFactory {
    /// Empty factory over the given mapper and pressure registry
    pub fn new(mapper: Arc<dyn MemoryMapper>, pressure: Arc<MemoryPressure>) -> Self {
        Self {
            mapper,
            pressure,
            table: Mutex::new(Default::default()),
            heaps: Mutex::new(Vec::new()),
        }
    }

    /// Factory for hosted builds: identity mapper, host page backend for
    /// [`HeapType::System`]
    pub fn hosted() -> Self {
        let factory = Self::new(Arc::new(HostMapper::new()), Arc::new(MemoryPressure::new()));
        factory.register(
            HeapType::System,
            BackendOps::with_default_teardown(Box::new(|params: &HeapParams| {
                let config = match params.size {
                    0 => HostPageConfig::small(),
                    size => HostPageConfig::with_capacity(size / PAGE_SIZE),
                };
                Ok(Box::new(HostPageBackend::new(config)) as Box<dyn HeapBackend>)
            })),
        );
        factory
    }

    /// Bind a heap type to a backend; returns the previous binding
    pub fn register(&self, heap_type: HeapType, ops: BackendOps) -> Option<Arc<BackendOps>> {
        debug!("factory: backend registered for {}", heap_type);
        self.table.lock()[heap_type.index()].replace(Arc::new(ops))
    }

    /// The pressure registry heaps register their reclaim hooks with
    pub fn pressure(&self) -> &Arc<MemoryPressure> {
        &self.pressure
    }

    /// Build a heap from a raw platform type tag
    pub fn create_heap_tagged(&self, tag: u32, params: HeapParams) -> Result<Arc<Heap>> {
        let heap_type = HeapType::try_from(tag)?;
        self.create_heap(&HeapParams { heap_type, ..params })
    }

    /// Build and start a heap
    pub fn create_heap(&self, params: &HeapParams) -> Result<Arc<Heap>> {
        params.validate()?;
        let ops = self.table.lock()[params.heap_type.index()]
            .clone()
            .ok_or(Error::InvalidConfig("no backend registered for heap type"))?;
        if self.find(params.id).is_some() {
            return Err(Error::InvalidConfig("heap id already in use"));
        }

        let backend = (ops.create)(params)?;
        let heap = Arc::new(Heap::start(
            params,
            backend,
            ops,
            self.mapper.clone(),
            self.pressure.clone(),
        )?);

        {
            let mut heaps = self.heaps.lock();
            heaps.retain(|h| h.strong_count() > 0);
            let duplicate = heaps
                .iter()
                .filter_map(Weak::upgrade)
                .any(|h| h.id() == params.id && h.state() == HeapState::Live);
            if !duplicate {
                heaps.push(Arc::downgrade(&heap));
            }
            drop(heaps);
            if duplicate {
                // Lost a race with a concurrent create of the same id.
                let _ = heap.teardown();
                return Err(Error::InvalidConfig("heap id already in use"));
            }
        }

        info!(
            "factory: created {} heap {} '{}'",
            params.heap_type, params.id, params.name
        );
        Ok(heap)
    }

    /// Stop a heap's worker, unregister its reclaim hook, drain it and
    /// release its backend
    ///
    /// A heap can be destroyed once; later calls fail with
    /// [`Error::HeapDestroyed`].
    pub fn destroy_heap(&self, heap: &Heap) -> Result<()> {
        heap.teardown().map_err(|e| {
            warn!("factory: rejected destroy of heap {}: {}", heap.id(), e);
            e
        })?;
        self.heaps
            .lock()
            .retain(|h| h.upgrade().map_or(false, |h| h.state() == HeapState::Live));
        Ok(())
    }

    /// Live heap with the given id
    pub fn find(&self, id: u32) -> Option<Arc<Heap>> {
        self.live_heaps().into_iter().find(|h| h.id() == id)
    }

    /// Heaps created by this factory and not yet destroyed
    pub fn live_heaps(&self) -> Vec<Arc<Heap>> {
        self.heaps
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|h| h.state() == HeapState::Live)
            .collect()
    }

    /// Park every heap's worker ahead of a system suspend
    pub fn suspend_all(&self) {
        let heaps = self.live_heaps();
        for heap in &heaps {
            heap.suspend();
        }
        debug!("factory: suspended {} heaps", heaps.len());
    }

    /// Release every heap's worker after resume
    pub fn resume_all(&self) {
        let heaps = self.live_heaps();
        for heap in &heaps {
            heap.resume();
        }
        debug!("factory: resumed {} heaps", heaps.len());
    }
}

impl fmt::Debug for HeapFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapFactory")
            .field("mapper", &self.mapper)
            .field("pressure", &self.pressure)
            .field("heaps", &self.live_heaps().len())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferFlags;

    #[test]
    fn test_tag_round_trip() {
        for ty in HeapType::ALL {
            assert_eq!(HeapType::try_from(ty.raw()), Ok(ty));
        }
        assert_eq!(
            HeapType::try_from(42),
            Err(Error::InvalidConfig("unknown heap type tag"))
        );
    }

    #[test]
    fn test_unregistered_type_rejected() {
        let factory = HeapFactory::hosted();
        let params = HeapParams::region(HeapType::Carveout, 7, "carveout", PhysAddr::new(0x8000_0000), 0x10_0000);
        assert!(matches!(factory.create_heap(&params), Err(Error::InvalidConfig(_))));
        assert!(matches!(
            factory.create_heap_tagged(99, HeapParams::default()),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_params_validation() {
        let factory = HeapFactory::hosted();
        let bad_align = HeapParams {
            align: 3 * PAGE_SIZE,
            ..HeapParams::system(1, "sys")
        };
        assert!(matches!(factory.create_heap(&bad_align), Err(Error::InvalidConfig(_))));
        assert!(matches!(
            factory.create_heap(&HeapParams::system(1, "")),
            Err(Error::InvalidConfig(_))
        ));
        let bad_base = HeapParams::region(HeapType::System, 1, "sys", PhysAddr::new(0x8000_0800), 0);
        assert_eq!(
            factory.create_heap(&bad_base).map(|_| ()),
            Err(Error::InvalidConfig("heap base is not page aligned"))
        );
    }

    #[test]
    fn test_create_destroy_lifecycle() {
        let factory = HeapFactory::hosted();
        let heap = factory.create_heap(&HeapParams::system(1, "sys")).unwrap();
        assert_eq!(factory.pressure().len(), 1);
        assert!(factory.find(1).is_some());
        assert!(matches!(
            factory.create_heap(&HeapParams::system(1, "sys2")),
            Err(Error::InvalidConfig(_))
        ));

        let buffer = heap.allocate(3 * PAGE_SIZE, BufferFlags::empty()).unwrap();
        drop(buffer);

        factory.destroy_heap(&heap).unwrap();
        assert_eq!(heap.state(), HeapState::Destroyed);
        assert!(factory.pressure().is_empty());
        assert!(factory.find(1).is_none());
        assert_eq!(heap.free_list_len(), 0);
        assert_eq!(factory.destroy_heap(&heap), Err(Error::HeapDestroyed));
        assert_eq!(
            heap.allocate(PAGE_SIZE, BufferFlags::empty()).map(|_| ()),
            Err(Error::HeapDestroyed)
        );
    }

    #[test]
    fn test_custom_backend_destructor_runs_once() {
        use core::sync::atomic::{AtomicUsize, Ordering};

        static DTOR_CALLS: AtomicUsize = AtomicUsize::new(0);

        let factory = HeapFactory::hosted();
        factory.register(
            HeapType::Dma,
            BackendOps::new(
                Box::new(|_: &HeapParams| {
                    Ok(Box::new(HostPageBackend::new(HostPageConfig::small())) as Box<dyn HeapBackend>)
                }),
                Box::new(|backend: &dyn HeapBackend| {
                    backend.teardown();
                    DTOR_CALLS.fetch_add(1, Ordering::SeqCst);
                }),
            ),
        );
        let params = HeapParams::region(HeapType::Dma, 3, "dma", PhysAddr::new(0), 0);
        let heap = factory.create_heap(&params).unwrap();
        factory.destroy_heap(&heap).unwrap();
        let _ = factory.destroy_heap(&heap);
        drop(heap);
        assert_eq!(DTOR_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_id_reusable_after_destroy() {
        let factory = HeapFactory::hosted();
        let first = factory.create_heap(&HeapParams::system(4, "sys")).unwrap();
        factory.destroy_heap(&first).unwrap();
        let second = factory.create_heap(&HeapParams::system(4, "sys")).unwrap();
        assert_eq!(second.state(), HeapState::Live);
    }
}
