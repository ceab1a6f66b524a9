//! Shutdown gate for public entry points.
//!
//! Client and stream each hold a counting gate. Every public entry point
//! acquires on entry and releases on exit; teardown locks the gate (no new
//! acquisitions), broadcasts the object's condvars so blocked waiters
//! observe shutdown, then waits until in-flight calls drain.

use parking_lot::{Condvar, Mutex};

use crate::error::{StreamError, StreamResult};
use crate::time::{ticks_to_duration, Ticks};

struct GateState {
    in_flight: u32,
    locked: bool,
}

/// Counting entry gate with a drain wait.
pub struct EntryGate {
    state: Mutex<GateState>,
    drained: Condvar,
}

impl EntryGate {
    /// Creates an open gate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                in_flight: 0,
                locked: false,
            }),
            drained: Condvar::new(),
        }
    }

    /// Registers an entry. Fails once the gate is locked for teardown.
    pub fn enter(&self) -> StreamResult<EntryPermit<'_>> {
        let mut state = self.state.lock();
        if state.locked {
            return Err(StreamError::StreamHasBeenStopped);
        }
        state.in_flight += 1;
        Ok(EntryPermit { gate: self })
    }

    /// Locks the gate so no further entries are admitted.
    pub fn lock(&self) {
        self.state.lock().locked = true;
    }

    /// Waits until all in-flight entries have exited.
    pub fn wait_until_clear(&self, timeout: Ticks) -> StreamResult<()> {
        let mut state = self.state.lock();
        while state.in_flight > 0 {
            if self
                .drained
                .wait_for(&mut state, ticks_to_duration(timeout))
                .timed_out()
            {
                return Err(StreamError::OperationTimedOut);
            }
        }
        Ok(())
    }
}

impl Default for EntryGate {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII permit returned by [`EntryGate::enter`].
pub struct EntryPermit<'a> {
    gate: &'a EntryGate,
}

impl Drop for EntryPermit<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.gate.drained.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TICKS_PER_SECOND;

    #[test]
    fn locked_gate_rejects_entries() {
        let gate = EntryGate::new();
        let permit = gate.enter().unwrap();
        gate.lock();
        assert!(gate.enter().is_err());
        drop(permit);
        gate.wait_until_clear(TICKS_PER_SECOND).unwrap();
    }

    #[test]
    fn wait_until_clear_times_out_with_stuck_entry() {
        let gate = EntryGate::new();
        let _permit = gate.enter().unwrap();
        gate.lock();
        assert!(matches!(
            gate.wait_until_clear(TICKS_PER_SECOND / 100),
            Err(StreamError::OperationTimedOut)
        ));
    }

    #[test]
    fn drain_wakes_waiter() {
        let gate = std::sync::Arc::new(EntryGate::new());
        let permit = gate.enter().unwrap();
        gate.lock();
        let waiter = {
            let gate = gate.clone();
            std::thread::spawn(move || gate.wait_until_clear(5 * TICKS_PER_SECOND))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(permit);
        waiter.join().unwrap().unwrap();
    }
}
