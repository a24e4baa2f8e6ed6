//! # Pressure Reclaim
//!
//! Memory pressure is reported to a [`MemoryPressure`] registry, which asks
//! each registered [`Shrinker`] how much it could give back and then to give
//! some of it back. Every heap with a deferred-free list or a shrinkable
//! backend registers a [`ReclaimHook`].
//!
//! ## Scan
//!
//! ```text
//!   requested pages ──▶ drain free list (force, whole buffers)
//!                               │ freed < requested?
//!                               ▼
//!                        Backend::shrink(remaining)
//! ```
//!
//! Buffers drained here are flagged so the backend returns their pages to
//! the system instead of pooling them.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use spin::Mutex;

use crate::heap::{Heap, HeapShared};
use crate::types::PAGE_SIZE;

// =============================================================================
// SHRINKER TRAIT
// =============================================================================

/// A cache that can give memory back under pressure
pub trait Shrinker: Send + Sync + fmt::Debug {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Pages that could be freed right now
    fn count(&self) -> u64;

    /// Try to free `requested_pages`; returns pages freed
    ///
    /// `may_block` is false when the caller cannot sleep, in which case
    /// nothing that may block is attempted.
    fn scan(&self, requested_pages: u64, may_block: bool) -> u64;

    /// Scan, then report what is still reclaimable
    fn reclaim(&self, requested_pages: u64, may_block: bool) -> u64 {
        self.scan(requested_pages, may_block);
        self.count()
    }
}

/// Registration handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShrinkerId(u32);

// =============================================================================
// MEMORY PRESSURE REGISTRY
// =============================================================================

/// Registry of shrinkers driven by memory pressure
#[derive(Default)]
pub struct MemoryPressure {
    shrinkers: Mutex<Vec<(ShrinkerId, Arc<dyn Shrinker>)>>,
    next_id: AtomicU32,
}

impl MemoryPressure {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a shrinker
    pub fn register(&self, shrinker: Arc<dyn Shrinker>) -> ShrinkerId {
        let id = ShrinkerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!("pressure: registered shrinker {}", shrinker.name());
        self.shrinkers.lock().push((id, shrinker));
        id
    }

    /// Remove a shrinker; returns whether it was registered
    pub fn unregister(&self, id: ShrinkerId) -> bool {
        let mut shrinkers = self.shrinkers.lock();
        match shrinkers.iter().position(|(i, _)| *i == id) {
            Some(pos) => {
                let (_, shrinker) = shrinkers.remove(pos);
                debug!("pressure: unregistered shrinker {}", shrinker.name());
                true
            },
            None => false,
        }
    }

    /// Registered shrinkers
    pub fn len(&self) -> usize {
        self.shrinkers.lock().len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.shrinkers.lock().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Shrinker>> {
        self.shrinkers.lock().iter().map(|(_, s)| s.clone()).collect()
    }

    /// Reclaimable pages across every shrinker
    pub fn count_all(&self) -> u64 {
        self.snapshot().iter().map(|s| s.count()).sum()
    }

    /// Ask shrinkers in registration order for `requested_pages`
    ///
    /// Returns pages freed. Shrinkers run outside the registry lock.
    pub fn shrink(&self, requested_pages: u64, may_block: bool) -> u64 {
        let mut freed = 0;
        for shrinker in self.snapshot() {
            if freed >= requested_pages {
                break;
            }
            let got = shrinker.scan(requested_pages - freed, may_block);
            trace!("pressure: {} freed {} pages", shrinker.name(), got);
            freed += got;
        }
        debug!("pressure: {}/{} pages reclaimed", freed, requested_pages);
        freed
    }
}

impl fmt::Debug for MemoryPressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPressure")
            .field("shrinkers", &self.len())
            .finish()
    }
}

// =============================================================================
// RECLAIM HOOK
// =============================================================================

/// Shrinker bound to one heap
#[derive(Debug)]
pub struct ReclaimHook {
    heap: Arc<HeapShared>,
}

impl ReclaimHook {
    pub(crate) fn new(heap: Arc<HeapShared>) -> Self {
        Self { heap }
    }

    /// Hook for `heap`, for callers driving reclaim themselves
    pub fn for_heap(heap: &Heap) -> Self {
        Self::new(heap.shared().clone())
    }
}

impl Shrinker for ReclaimHook {
    fn name(&self) -> &str {
        self.heap.name
    }

    fn count(&self) -> u64 {
        self.heap.free_list.size() / PAGE_SIZE + self.heap.shrink_backend(0)
    }

    fn scan(&self, requested_pages: u64, may_block: bool) -> u64 {
        if requested_pages == 0 || !may_block {
            return 0;
        }

        let budget = requested_pages.saturating_mul(PAGE_SIZE);
        let drained = if self.heap.defers_free() {
            self.heap.drain(budget, true)
        } else {
            0
        };
        let mut freed = drained / PAGE_SIZE;

        let remaining = requested_pages.saturating_sub(freed);
        if remaining > 0 {
            freed += self.heap.shrink_backend(remaining);
        }

        debug!(
            "{}: reclaim freed {} pages ({} from free list) of {} requested",
            self.heap.name,
            freed,
            drained / PAGE_SIZE,
            requested_pages
        );
        freed
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use core::sync::atomic::AtomicU64;

    use super::*;

    #[derive(Debug)]
    struct FixedCache {
        name: &'static str,
        pages: AtomicU64,
    }

    impl FixedCache {
        fn new(name: &'static str, pages: u64) -> Arc<Self> {
            Arc::new(Self {
                name,
                pages: AtomicU64::new(pages),
            })
        }
    }

    impl Shrinker for FixedCache {
        fn name(&self) -> &str {
            self.name
        }

        fn count(&self) -> u64 {
            self.pages.load(Ordering::Acquire)
        }

        fn scan(&self, requested: u64, _may_block: bool) -> u64 {
            let have = self.pages.load(Ordering::Acquire);
            let take = have.min(requested);
            self.pages.store(have - take, Ordering::Release);
            take
        }
    }

    #[test]
    fn test_registry_order_and_stop() {
        let pressure = MemoryPressure::new();
        let a = FixedCache::new("a", 5);
        let b = FixedCache::new("b", 10);
        let c = FixedCache::new("c", 10);
        pressure.register(a.clone());
        pressure.register(b.clone());
        pressure.register(c.clone());

        assert_eq!(pressure.count_all(), 25);
        assert_eq!(pressure.shrink(8, true), 8);
        assert_eq!(a.count(), 0);
        assert_eq!(b.count(), 7);
        assert_eq!(c.count(), 10);
    }

    #[test]
    fn test_unregister() {
        let pressure = MemoryPressure::new();
        let id = pressure.register(FixedCache::new("a", 1));
        assert_eq!(pressure.len(), 1);
        assert!(pressure.unregister(id));
        assert!(!pressure.unregister(id));
        assert!(pressure.is_empty());
        assert_eq!(pressure.shrink(4, true), 0);
    }

    #[test]
    fn test_default_reclaim_reports_remaining() {
        let cache = FixedCache::new("a", 6);
        assert_eq!(cache.reclaim(4, true), 2);
    }
}
