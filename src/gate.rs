// src/gate.rs

//! The open/close gate guarding channels and connections.
//!
//! Any number of threads may be inside the gate at once; at most one
//! thread performs the open/close transition. `close` atomically bars new
//! entries and waits for the inside-count to drain; if it cannot drain in
//! time the gate stays barred and the last thread to exit reports that a
//! pending close can now be completed (the owner finishes it with
//! [`Gate::finish_close`]). Entries by the thread that closed the gate
//! remain allowed afterwards.
//!
//! Lock order elsewhere in the crate: connection gate, then channel gate,
//! then the request-registry lock. The gate itself never blocks while
//! holding anything else.

use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct GateState {
    /// Threads currently inside.
    entered: usize,
    /// A close has been requested; new entries are barred.
    closing: bool,
    /// The close completed.
    closed: bool,
    /// Thread that completed the close; it alone may re-enter.
    closer: Option<ThreadId>,
    /// Re-entries by the closer after the close.
    closer_entries: usize,
}

/// Many-threads-inside / one-thread-closing gate.
#[derive(Debug, Default)]
pub struct Gate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Gate {
    pub fn new() -> Self {
        Gate::default()
    }

    /// Enter the gate. Fails immediately when a close is in progress or
    /// complete, unless the calling thread is the one that closed it.
    pub fn enter(&self) -> bool {
        let mut state = self.state.lock();
        if state.closing || state.closed {
            if state.closer == Some(thread::current().id()) {
                state.closer_entries += 1;
                return true;
            }
            return false;
        }
        state.entered += 1;
        true
    }

    /// Exit the gate. Returns true when this exit drained the gate while a
    /// close was pending: the caller is responsible for completing that
    /// close (see [`Gate::finish_close`]).
    pub fn exit(&self) -> bool {
        let mut state = self.state.lock();
        if state.closer == Some(thread::current().id()) && state.closer_entries > 0 {
            state.closer_entries -= 1;
            return false;
        }
        debug_assert!(state.entered > 0, "gate exit without matching enter");
        state.entered = state.entered.saturating_sub(1);
        if state.entered == 0 && state.closing && !state.closed {
            self.cond.notify_all();
            return true;
        }
        false
    }

    /// Bar new entries and wait up to `timeout` for the inside-count to
    /// drain. On success the gate is closed and the calling thread becomes
    /// its closer. On timeout the gate stays barred (entries keep failing)
    /// and false is returned.
    pub fn close(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return true;
        }
        state.closing = true;
        let deadline = Instant::now() + timeout;
        while state.entered > 0 {
            if timeout.is_zero() || self.cond.wait_until(&mut state, deadline).timed_out() {
                if state.entered > 0 {
                    return false;
                }
                break;
            }
        }
        // A racing closer may have completed the close while we waited.
        if !state.closed {
            state.closed = true;
            state.closer = Some(thread::current().id());
        }
        true
    }

    /// Complete a close that timed out, once the gate has drained. Returns
    /// false if threads are still inside or no close is pending.
    pub fn finish_close(&self) -> bool {
        let mut state = self.state.lock();
        if state.closing && !state.closed && state.entered == 0 {
            state.closed = true;
            state.closer = Some(thread::current().id());
            true
        } else {
            false
        }
    }

    /// Release a closed (or barred) gate.
    pub fn open(&self) {
        let mut state = self.state.lock();
        state.closing = false;
        state.closed = false;
        state.closer = None;
        state.closer_entries = 0;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// True once a close has been requested, even if not yet complete.
    pub fn is_barred(&self) -> bool {
        let state = self.state.lock();
        state.closing || state.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn enter_exit_counts() {
        let gate = Gate::new();
        assert!(gate.enter());
        assert!(gate.enter());
        assert!(!gate.exit());
        assert!(!gate.exit());
        assert!(gate.close(Duration::ZERO));
        assert!(gate.is_closed());
    }

    #[test]
    fn close_bars_new_entries() {
        let gate = Gate::new();
        assert!(gate.close(Duration::ZERO));
        assert!(!gate.enter());
    }

    #[test]
    fn closer_may_reenter() {
        let gate = Gate::new();
        assert!(gate.close(Duration::ZERO));
        assert!(gate.enter());
        assert!(!gate.exit());
        assert!(gate.is_closed());
    }

    #[test]
    fn close_times_out_and_last_exit_reports() {
        let gate = Gate::new();
        assert!(gate.enter());
        assert!(!gate.close(Duration::from_millis(10)));
        assert!(gate.is_barred());
        assert!(!gate.is_closed());
        // New entries fail while the close is pending.
        assert!(!gate.enter());
        // The last exit reports the drain; the owner completes the close.
        assert!(gate.exit());
        assert!(gate.finish_close());
        assert!(gate.is_closed());
    }

    #[test]
    fn close_waits_for_draining_threads() {
        let gate = Arc::new(Gate::new());
        assert!(gate.enter());

        let worker = {
            let gate = gate.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                gate.exit();
            })
        };

        assert!(gate.close(Duration::from_secs(5)));
        assert!(gate.is_closed());
        worker.join().unwrap();
    }

    #[test]
    fn open_releases_closed_gate() {
        let gate = Gate::new();
        assert!(gate.close(Duration::ZERO));
        assert!(!gate.enter());
        gate.open();
        assert!(gate.enter());
        assert!(!gate.exit());
    }

    #[test]
    fn close_is_idempotent() {
        let gate = Gate::new();
        assert!(gate.close(Duration::ZERO));
        assert!(gate.close(Duration::ZERO));
    }
}
