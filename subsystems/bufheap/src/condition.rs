//! # Suspend-Aware Condition
//!
//! The wait primitive the deferred-free worker sleeps on. Besides the usual
//! "work arrived" wakeup it carries two system-level signals, each reported
//! as its own [`WakeReason`]:
//!
//! - **suspend**: the system is going to sleep; waiters park until resume
//!   without consuming work, so nothing queued is lost across the pause.
//! - **shutdown**: the owner is being torn down; waiters return for good.
//!
//! Priority when several apply: shutdown, then suspend, then work.

use parking_lot::{Condvar, Mutex};

/// Why a wait returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The readiness predicate holds
    Signalled,
    /// A system suspend is in progress
    Suspend,
    /// The condition was shut down
    Shutdown,
}

#[derive(Debug, Default)]
struct ConditionState {
    suspended: bool,
    shutdown: bool,
    /// Waiters currently parked for a suspend
    parked: usize,
}

/// Condition variable with suspend and shutdown as distinct wake reasons
#[derive(Debug, Default)]
pub struct Condition {
    state: Mutex<ConditionState>,
    cvar: Condvar,
}

impl Condition {
    /// Create a new condition
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `ready()` holds, a suspend begins, or shutdown
    ///
    /// `ready` is evaluated with the condition's internal lock held, so a
    /// producer that makes it true and then calls [`notify`](Self::notify)
    /// can never be missed.
    pub fn wait(&self, ready: impl Fn() -> bool) -> WakeReason {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return WakeReason::Shutdown;
            }
            if state.suspended {
                return WakeReason::Suspend;
            }
            if ready() {
                return WakeReason::Signalled;
            }
            self.cvar.wait(&mut state);
        }
    }

    /// Park until the current suspend ends
    ///
    /// Returns [`WakeReason::Shutdown`] if shut down while parked, otherwise
    /// [`WakeReason::Signalled`].
    pub fn park_while_suspended(&self) -> WakeReason {
        let mut state = self.state.lock();
        state.parked += 1;
        while state.suspended && !state.shutdown {
            self.cvar.wait(&mut state);
        }
        state.parked -= 1;
        if state.shutdown {
            WakeReason::Shutdown
        } else {
            WakeReason::Signalled
        }
    }

    /// Wake one waiter to re-check its predicate
    pub fn notify(&self) {
        let _state = self.state.lock();
        self.cvar.notify_one();
    }

    /// Begin a system suspend
    pub fn suspend(&self) {
        self.state.lock().suspended = true;
        self.cvar.notify_all();
    }

    /// End a system suspend
    pub fn resume(&self) {
        self.state.lock().suspended = false;
        self.cvar.notify_all();
    }

    /// Waiters currently parked for a suspend
    pub fn parked(&self) -> usize {
        self.state.lock().parked
    }

    /// Release every waiter permanently
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cvar.notify_all();
    }
}
