//! # Buffers
//!
//! A [`Buffer`] is one allocation: its size, its creation flags and the
//! extents the backend handed out. Callers hold it through a
//! [`BufferHandle`]; when the last handle is dropped the buffer goes back to
//! its heap, which defers the teardown to the heap's worker.
//!
//! ## Lifecycle
//!
//! ```text
//!   Backend::allocate ──▶ Buffer ──▶ BufferHandle (clone, clone, ...)
//!                                          │ last drop
//!                                          ▼
//!                                  Deferred-Free List
//!                                          │ pop_front (worker or reclaim)
//!                                          ▼
//!                          zero? ──▶ Backend::free ──▶ dropped
//! ```

use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::Deref;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::warn;
use parking_lot::Mutex;

use crate::heap::HeapShared;
use crate::mapper::DeviceDomain;
use crate::types::{ExtentList, VirtAddr};

// =============================================================================
// FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Caller-visible buffer flags, fixed at allocation
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        /// CPU mappings are cached rather than write-combined
        const CACHED = 1 << 0;
        /// Contents must never be observed by another owner
        const SECURE = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Heap-internal buffer flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PrivateFlags: u32 {
        /// Freed by reclaim: bypass backend pooling, return pages to the system
        const SHRINKER_FREE = 1 << 0;
    }
}

// =============================================================================
// BUFFER ID
// =============================================================================

/// Unique buffer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub u64);

impl BufferId {
    /// Allocate the next identifier
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// =============================================================================
// MAPPING STATE
// =============================================================================

/// Mappings currently held on a buffer
#[derive(Debug, Default)]
pub(crate) struct MappingState {
    /// Kernel mapping users
    pub(crate) kmap_count: u32,
    /// Kernel mapping, present while `kmap_count > 0`
    pub(crate) vaddr: Option<VirtAddr>,
    /// Device domains the buffer is attached to
    pub(crate) devices: Vec<DeviceDomain>,
}

// =============================================================================
// BUFFER
// =============================================================================

/// One allocation record
pub struct Buffer {
    id: BufferId,
    size: u64,
    flags: BufferFlags,
    private_flags: PrivateFlags,
    extents: ExtentList,
    heap: Weak<HeapShared>,
    pub(crate) mapping: Mutex<MappingState>,
}

impl Buffer {
    pub(crate) fn new(
        size: u64,
        flags: BufferFlags,
        extents: ExtentList,
        heap: Weak<HeapShared>,
    ) -> Self {
        Self {
            id: BufferId::next(),
            size,
            flags,
            private_flags: PrivateFlags::empty(),
            extents,
            heap,
            mapping: Mutex::new(MappingState::default()),
        }
    }

    /// Buffer identifier
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Creation flags
    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    /// Heap-internal flags
    pub fn private_flags(&self) -> PrivateFlags {
        self.private_flags
    }

    /// Backing extents
    pub fn extents(&self) -> &ExtentList {
        &self.extents
    }

    /// Whether CPU mappings are cached
    pub fn is_cached(&self) -> bool {
        self.flags.contains(BufferFlags::CACHED)
    }

    /// Active kernel mapping users
    pub fn kmap_count(&self) -> u32 {
        self.mapping.lock().kmap_count
    }

    pub(crate) fn mark_shrinker_free(&mut self) {
        self.private_flags.insert(PrivateFlags::SHRINKER_FREE);
    }

    pub(crate) fn into_extents(self) -> ExtentList {
        self.extents
    }

    /// Identity of the owning heap, for ownership checks
    pub(crate) fn heap_ptr(&self) -> *const HeapShared {
        self.heap.as_ptr()
    }

    /// Return the buffer to its heap once no owner is left
    fn release(self) {
        match self.heap.upgrade() {
            Some(heap) => heap.release(self),
            None => warn!(
                "buffer {}: released after its heap was dropped, leaking {} bytes",
                self.id, self.size
            ),
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .field("private_flags", &self.private_flags)
            .field("extents", &self.extents.len())
            .finish()
    }
}

// =============================================================================
// BUFFER HANDLE
// =============================================================================

/// Shared owner of a buffer
///
/// Clones share one buffer. Dropping the last clone hands the buffer back to
/// its heap.
#[derive(Debug, Clone)]
pub struct BufferHandle(Arc<BufferOwner>);

#[derive(Debug)]
struct BufferOwner {
    buffer: ManuallyDrop<Buffer>,
}

impl BufferHandle {
    pub(crate) fn new(buffer: Buffer) -> Self {
        Self(Arc::new(BufferOwner {
            buffer: ManuallyDrop::new(buffer),
        }))
    }

    /// Number of live handles to this buffer
    pub fn owners(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl Deref for BufferHandle {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        &self.0.buffer
    }
}

impl Drop for BufferOwner {
    fn drop(&mut self) {
        // SAFETY: `buffer` is never touched again after this take.
        let buffer = unsafe { ManuallyDrop::take(&mut self.buffer) };
        buffer.release();
    }
}

// =============================================================================
// TESTS
// =============================================================================
