//! Wait-Token Zone
//!
//! Based on Mach4 kern/zalloc.c by Avadis Tevanian, Jr.
//!
//! A zone of fixed, reusable wait tokens. A token carries a reference count
//! and a notification event, and lets any number of threads block until an
//! in-progress deletion completes.
//!
//! Allocation and return are asymmetric:
//! - `try_allocate` pops the free list under the zone's allocation spinlock
//! - `release` drops a reference and, on the last one, pushes the token back
//!   with a single compare-exchange and no lock
//!
//! Only one thread pops at a time, and a token still linked on the free list
//! can never be pushed again. Together these rule out ABA on the list head.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::kern::event::Event;

// ============================================================================
// Constants
// ============================================================================

/// Largest zone a `WaitToken` index can address
pub const MAX_WAIT_TOKENS: usize = u16::MAX as usize;

/// Free list terminator
const FREE_LIST_END: u32 = u32::MAX;

// ============================================================================
// Zone Statistics
// ============================================================================

/// Zone statistics for debugging and monitoring
#[derive(Debug, Default)]
pub struct ZoneStats {
    /// Total allocations from this zone
    pub alloc_count: AtomicU64,
    /// Total returns to this zone
    pub free_count: AtomicU64,
    /// Current tokens in use
    pub in_use: AtomicU32,
    /// Maximum tokens ever in use
    pub max_in_use: AtomicU32,
    /// Failed allocation attempts
    pub failures: AtomicU32,
}

impl ZoneStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_alloc(&self) {
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
        let in_use = self.in_use.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.max_in_use.fetch_max(in_use, Ordering::Relaxed);
    }

    pub fn record_free(&self) {
        self.free_count.fetch_add(1, Ordering::Relaxed);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Wait Token
// ============================================================================

/// Handle to a token in a `TokenZone`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitToken(u16);

impl WaitToken {
    /// Index of the token in its zone
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One token in the zone
#[derive(Debug)]
struct TokenSlot {
    /// Threads holding this token
    ref_count: AtomicU32,
    /// Next free token while on the free list
    next: AtomicU32,
    /// Signaled when the awaited deletion completes
    event: Event,
}

// ============================================================================
// Token Zone
// ============================================================================

/// A fixed zone of reusable wait tokens
#[derive(Debug)]
pub struct TokenZone {
    /// Zone name (for debugging)
    name: &'static str,
    /// Token storage
    slots: Vec<TokenSlot>,
    /// Free list head
    head: AtomicU32,
    /// Serializes poppers
    alloc_lock: Mutex<()>,
    /// Zone statistics
    pub stats: ZoneStats,
}

impl TokenZone {
    /// Create a zone of `size` tokens, all free
    pub fn new(name: &'static str, size: usize) -> Self {
        let size = size.clamp(1, MAX_WAIT_TOKENS);
        let slots = (0..size)
            .map(|i| TokenSlot {
                ref_count: AtomicU32::new(0),
                next: AtomicU32::new(if i + 1 < size {
                    (i + 1) as u32
                } else {
                    FREE_LIST_END
                }),
                event: Event::new(),
            })
            .collect();

        Self {
            name,
            slots,
            head: AtomicU32::new(0),
            alloc_lock: Mutex::new(()),
            stats: ZoneStats::new(),
        }
    }

    /// Take a token off the free list with one reference
    ///
    /// Returns `None` when the zone is exhausted; callers back off and retry.
    pub fn try_allocate(&self) -> Option<WaitToken> {
        let _serialize = self.alloc_lock.lock();

        loop {
            let head = self.head.load(Ordering::Acquire);
            if head == FREE_LIST_END {
                self.stats.record_failure();
                return None;
            }

            let slot = &self.slots[head as usize];
            let next = slot.next.load(Ordering::Relaxed);
            if self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.event.clear();
                slot.ref_count.store(1, Ordering::Release);
                self.stats.record_alloc();
                return Some(WaitToken(head as u16));
            }
        }
    }

    /// Add a reference for another waiter
    pub fn reference(&self, token: WaitToken) {
        self.slots[token.index()]
            .ref_count
            .fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference, returning the token to the zone on the last
    pub fn release(&self, token: WaitToken) {
        let slot = &self.slots[token.index()];
        if slot.ref_count.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let index = token.index() as u32;
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            slot.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, index, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        self.stats.record_free();
    }

    /// Wake every thread waiting on the token
    pub fn signal(&self, token: WaitToken) {
        self.slots[token.index()].event.set();
    }

    /// Block until the token is signaled
    pub fn wait(&self, token: WaitToken) {
        self.slots[token.index()].event.wait();
    }

    /// Current reference count of a token
    pub fn ref_count(&self, token: WaitToken) -> u32 {
        self.slots[token.index()].ref_count.load(Ordering::Acquire)
    }

    /// Tokens currently handed out
    pub fn in_use(&self) -> u32 {
        self.stats.in_use.load(Ordering::Relaxed)
    }

    /// Total tokens in the zone
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Get zone name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_allocate_until_exhausted() {
        let zone = TokenZone::new("test", 2);

        let a = zone.try_allocate().unwrap();
        let b = zone.try_allocate().unwrap();
        assert_ne!(a, b);
        assert!(zone.try_allocate().is_none());
        assert_eq!(zone.stats.failures.load(Ordering::Relaxed), 1);

        zone.release(a);
        let c = zone.try_allocate().unwrap();
        assert_eq!(c, a);
        zone.release(b);
        zone.release(c);
        assert_eq!(zone.in_use(), 0);
    }

    #[test]
    fn test_last_reference_returns_token() {
        let zone = TokenZone::new("test", 1);
        let token = zone.try_allocate().unwrap();

        zone.reference(token);
        assert_eq!(zone.ref_count(token), 2);

        zone.release(token);
        assert!(zone.try_allocate().is_none());

        zone.release(token);
        assert!(zone.try_allocate().is_some());
    }

    #[test]
    fn test_signal_wakes_all_holders() {
        let zone = Arc::new(TokenZone::new("test", 4));
        let token = zone.try_allocate().unwrap();
        zone.reference(token);

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let zone = Arc::clone(&zone);
                thread::spawn(move || {
                    zone.wait(token);
                    zone.release(token);
                })
            })
            .collect();

        zone.signal(token);
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(zone.in_use(), 0);
    }

    #[test]
    fn test_concurrent_allocate_release() {
        let zone = Arc::new(TokenZone::new("test", 8));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let zone = Arc::clone(&zone);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Some(token) = zone.try_allocate() {
                            zone.release(token);
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(zone.in_use(), 0);

        let mut held = Vec::new();
        while let Some(token) = zone.try_allocate() {
            held.push(token);
        }
        assert_eq!(held.len(), 8);
    }
}
