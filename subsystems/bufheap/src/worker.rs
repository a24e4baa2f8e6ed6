//! # Deferred-Free Worker
//!
//! One low-priority thread per deferring heap. It sleeps on the free list's
//! condition and destroys buffers one at a time, oldest first, so the cost
//! of zeroing and returning pages never lands on the thread that released
//! the last handle.
//!
//! Each buffer is unlinked under the free-list lock and destroyed with no
//! lock held, so reclaim can drain the same list concurrently and every
//! buffer is still destroyed exactly once.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};

use crate::condition::WakeReason;
use crate::error::{Error, Result};
use crate::heap::HeapShared;

/// Background thread draining one heap's deferred-free list
#[derive(Debug)]
pub struct DeferredFreeWorker {
    heap: Arc<HeapShared>,
    handle: Option<JoinHandle<u64>>,
}

impl DeferredFreeWorker {
    /// Start the worker for `heap` at the given nice value
    pub(crate) fn spawn(heap: Arc<HeapShared>, nice: i32) -> Result<Self> {
        let name = format!("bufheap-{}", heap.name);
        let worker_heap = heap.clone();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                if let Err(e) = lower_priority(nice) {
                    warn!("{}: worker keeps default priority: {}", worker_heap.name, e);
                }
                run(&worker_heap)
            })
            .map_err(|e| {
                error!("{}: cannot spawn deferred-free worker: {}", heap.name, e);
                Error::OutOfMemory
            })?;

        Ok(Self {
            heap,
            handle: Some(handle),
        })
    }

    /// Shut the condition down and wait for the thread to exit
    ///
    /// Returns how many buffers the worker destroyed over its life.
    pub(crate) fn stop(mut self) -> u64 {
        self.heap.free_list.condition().shutdown();
        let destroyed = match self.handle.take().map(JoinHandle::join) {
            Some(Ok(n)) => n,
            Some(Err(_)) => {
                error!("{}: deferred-free worker panicked", self.heap.name);
                0
            },
            None => 0,
        };
        debug!("{}: worker stopped after {} buffers", self.heap.name, destroyed);
        destroyed
    }
}

impl Drop for DeferredFreeWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.heap.free_list.condition().shutdown();
        }
    }
}

/// Worker body
fn run(heap: &HeapShared) -> u64 {
    info!("{}: deferred-free worker started", heap.name);
    let mut destroyed = 0u64;
    loop {
        match heap.free_list.wait_for_work() {
            WakeReason::Shutdown => break,
            WakeReason::Suspend => {
                debug!("{}: worker parked for suspend", heap.name);
                if heap.free_list.condition().park_while_suspended() == WakeReason::Shutdown {
                    break;
                }
                debug!("{}: worker resumed", heap.name);
            },
            WakeReason::Signalled => {
                // Reclaim may have taken it between the wake and the pop.
                let Some(buffer) = heap.free_list.pop_front() else {
                    continue;
                };
                if heap.destroy(buffer, false).is_ok() {
                    destroyed += 1;
                }
            },
        }
    }
    debug!("{}: deferred-free worker exiting", heap.name);
    destroyed
}

#[cfg(target_os = "linux")]
fn lower_priority(nice: i32) -> std::io::Result<()> {
    // SAFETY: gettid has no preconditions; setpriority only touches the
    // calling thread's scheduling attributes.
    let result = unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        libc::setpriority(libc::PRIO_PROCESS, tid, nice)
    };
    if result == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn lower_priority(_nice: i32) -> std::io::Result<()> {
    Ok(())
}
