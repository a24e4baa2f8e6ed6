//! # Deferred-Free List
//!
//! Released buffers wait here until the heap's worker, or reclaim under
//! memory pressure, tears them down. Releasing is O(1) for the caller; the
//! O(size) work of zeroing and returning pages happens later, elsewhere.
//!
//! The queue and its byte tally sit behind one spinlock (`free_lock`).
//! Nothing that can sleep runs under it: a buffer is unlinked first and only
//! then zeroed or freed, by whichever consumer unlinked it.

use std::collections::VecDeque;

use log::trace;
use spin::Mutex;

use crate::buffer::Buffer;
use crate::condition::{Condition, WakeReason};

#[derive(Debug, Default)]
struct FreeListInner {
    queue: VecDeque<Buffer>,
    /// Sum of `size()` over `queue`
    size: u64,
    /// Set at heap teardown; pushes are refused from then on
    closed: bool,
}

/// FIFO of released buffers with a running byte tally
#[derive(Debug, Default)]
pub struct DeferredFreeList {
    free_lock: Mutex<FreeListInner>,
    signal: Condition,
}

impl DeferredFreeList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a released buffer and wake the consumer
    ///
    /// Only fails once the list is closed, handing the buffer back so the
    /// caller can tear it down itself.
    pub fn push(&self, buffer: Buffer) -> Result<(), Buffer> {
        let id = buffer.id();
        {
            let mut inner = self.free_lock.lock();
            if inner.closed {
                return Err(buffer);
            }
            inner.size += buffer.size();
            inner.queue.push_back(buffer);
        }
        trace!("free list: queued buffer {}", id);
        self.signal.notify();
        Ok(())
    }

    /// Unlink the oldest buffer
    pub fn pop_front(&self) -> Option<Buffer> {
        let mut inner = self.free_lock.lock();
        let buffer = inner.queue.pop_front()?;
        inner.size -= buffer.size();
        Some(buffer)
    }

    /// Bytes currently queued
    pub fn size(&self) -> u64 {
        self.free_lock.lock().size
    }

    /// Buffers currently queued
    pub fn len(&self) -> usize {
        self.free_lock.lock().queue.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.free_lock.lock().queue.is_empty()
    }

    /// Block until a buffer is queued, a suspend begins, or shutdown
    pub fn wait_for_work(&self) -> WakeReason {
        self.signal.wait(|| !self.is_empty())
    }

    /// Refuse further pushes
    pub fn close(&self) {
        self.free_lock.lock().closed = true;
    }

    /// Wait primitive shared with the worker
    pub fn condition(&self) -> &Condition {
        &self.signal
    }
}
