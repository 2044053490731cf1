//! Events
//!
//! Based on Mach4 kern/sched_prim.c assert_wait/thread_wakeup
//!
//! A notification event stays signaled until cleared and releases every
//! waiter. `pulse` wakes current waiters without leaving the event set;
//! waiters that must not miss a pulse record `generation()` while holding
//! the lock that orders them against the pulser, then call `wait_past`.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct EventState {
    /// Event is signaled
    signaled: bool,
    /// Bumped on every set or pulse
    generation: u64,
}

/// A notification event
#[derive(Debug, Default)]
pub struct Event {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl Event {
    /// Create a new non-signaled event
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the event and wake all waiters
    pub fn set(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.signaled = true;
        state.generation = state.generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Return the event to the non-signaled state
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.signaled = false;
    }

    /// Wake all current waiters without leaving the event signaled
    pub fn pulse(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.generation = state.generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Check whether the event is signaled
    pub fn is_set(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .signaled
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }

    /// Block until the event is signaled
    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while !state.signaled {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the event is signaled or `timeout` elapses
    ///
    /// Returns true if the event was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (state, _) = self
            .cond
            .wait_timeout_while(state, timeout, |s| !s.signaled)
            .unwrap_or_else(PoisonError::into_inner);
        state.signaled
    }

    /// Block until the generation moves past `seen` or the event is signaled
    pub fn wait_past(&self, seen: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while !state.signaled && state.generation == seen {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_event_set_clear() {
        let event = Event::new();
        assert!(!event.is_set());

        event.set();
        assert!(event.is_set());
        event.wait();

        event.clear();
        assert!(!event.is_set());
        assert!(!event.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_event_wakes_waiter() {
        let event = Arc::new(Event::new());
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait())
        };

        event.set();
        waiter.join().unwrap();
    }

    #[test]
    fn test_pulse_releases_generation_waiter() {
        let event = Arc::new(Event::new());
        let seen = event.generation();

        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait_past(seen))
        };

        event.pulse();
        waiter.join().unwrap();
        assert!(!event.is_set());
        assert_eq!(event.generation(), seen + 1);
    }
}
