//! Per-request completion signal.
//!
//! Each short-lived request parks on one of these while its response is in
//! flight. The slot has its own small lock so the waiter can block *after*
//! releasing the device-wide lock; completion from the dispatcher (which
//! holds the device lock) never blocks. First completion wins; later
//! completions and the failure broadcast are no-ops once the slot is done.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::Result;

/// A one-shot completion slot carrying the request outcome.
#[derive(Debug)]
pub(crate) struct ReplySlot<T> {
    state: Mutex<SlotState<T>>,
    cond: Condvar,
}

#[derive(Debug)]
struct SlotState<T> {
    done: bool,
    outcome: Option<Result<T>>,
}

impl<T> ReplySlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                done: false,
                outcome: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Whether the slot has already been completed.
    pub(crate) fn is_done(&self) -> bool {
        self.state.lock().done
    }

    /// Complete the slot with `outcome` and wake the waiter. Ignored if the
    /// slot is already done.
    pub(crate) fn complete(&self, outcome: Result<T>) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        state.done = true;
        state.outcome = Some(outcome);
        self.cond.notify_all();
    }

    /// Block until completed or `timeout` expires. `None` means timeout;
    /// the slot stays armed, so a late completion is still absorbed (and
    /// then discarded with the slot).
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let mut state = self.state.lock();
        while !state.done {
            if self.cond.wait_for(&mut state, timeout).timed_out() && !state.done {
                return None;
            }
        }
        state.outcome.take()
    }
}
