//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use helix_bufheap::{
    AllocRequest, BackendCaps, BackendOps, Extent, ExtentList, HeapBackend, HeapFactory, HeapParams,
    HeapType, HostMapper, MemoryPressure, PhysAddr, Result,
};
use parking_lot::Mutex;

/// What a [`CountingBackend`] has been asked to do
#[derive(Debug, Default)]
pub struct Tally {
    next_base: AtomicU64,
    frees: Mutex<Vec<(PhysAddr, bool)>>,
}

impl Tally {
    /// Every free so far, with its return-to-system flag
    pub fn frees(&self) -> Vec<(PhysAddr, bool)> {
        self.frees.lock().clone()
    }

    /// Number of frees
    pub fn free_count(&self) -> usize {
        self.frees.lock().len()
    }

    /// Whether any extent was freed twice
    pub fn has_duplicates(&self) -> bool {
        let frees = self.frees.lock();
        let unique: HashSet<_> = frees.iter().map(|(base, _)| base.raw()).collect();
        unique.len() != frees.len()
    }
}

/// Backend handing out unique, never-dereferenced addresses
#[derive(Debug)]
pub struct CountingBackend {
    tally: Arc<Tally>,
}

impl HeapBackend for CountingBackend {
    fn capabilities(&self) -> BackendCaps {
        BackendCaps::empty()
    }

    fn allocate(&self, request: &AllocRequest) -> Result<ExtentList> {
        let base = 0x1_0000_0000 + self.tally.next_base.fetch_add(request.size, Ordering::AcqRel);
        Ok(std::iter::once(Extent::new(PhysAddr::new(base), request.size)).collect())
    }

    fn free(&self, extents: ExtentList, return_to_system: bool) -> Result<()> {
        let mut frees = self.tally.frees.lock();
        for extent in extents.iter() {
            frees.push((extent.base, return_to_system));
        }
        Ok(())
    }
}

/// Factory with [`CountingBackend`] bound to [`HeapType::Carveout`]
pub fn counting_factory() -> (HeapFactory, Arc<Tally>) {
    let tally = Arc::new(Tally::default());
    let factory = HeapFactory::new(Arc::new(HostMapper::new()), Arc::new(MemoryPressure::new()));
    let ctor_tally = tally.clone();
    factory.register(
        HeapType::Carveout,
        BackendOps::with_default_teardown(Box::new(move |_: &HeapParams| {
            Ok(Box::new(CountingBackend {
                tally: ctor_tally.clone(),
            }) as Box<dyn HeapBackend>)
        })),
    );
    (factory, tally)
}

/// Carveout heap parameters
pub fn carveout(id: u32) -> HeapParams {
    HeapParams::region(HeapType::Carveout, id, "carveout", PhysAddr::new(0x1_0000_0000), 0)
}

/// Poll `done` for up to five seconds
pub fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    done()
}
