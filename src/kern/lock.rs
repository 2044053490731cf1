//! Locking Primitives
//!
//! Based on Mach4 kern/lock.h/c by Avadis Tevanian, Jr. and Michael Wayne Young
//!
//! Provides the sleeping lock that guards the page cache. Every shared count,
//! list link and prototype entry touched by the lifecycle manager lives behind
//! one `AuditedLock`. The lock is never recursive and is never held across I/O
//! or an event wait, so it records:
//! - which thread currently owns it
//! - how many times it was acquired and released
//!
//! Callers that must give the lock up in the middle of a walk use
//! `AuditedGuard::unlocked`, which releases, runs the closure and re-acquires.
//! Anything read before the call must be re-validated afterwards.

use std::cell::Cell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::kern::fatal::{consistency_violation, Bugcheck};

// ============================================================================
// Thread Identity
// ============================================================================

/// Next token handed to a thread the first time it touches an audited lock
static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Owner value of an unheld lock
const NO_OWNER: u64 = 0;

thread_local! {
    static THREAD_TOKEN: Cell<u64> = const { Cell::new(NO_OWNER) };
}

/// Token identifying the calling thread
fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|token| {
        if token.get() == NO_OWNER {
            token.set(NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed));
        }
        token.get()
    })
}

// ============================================================================
// Lock Audit
// ============================================================================

/// Acquire/release accounting for an audited lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockAudit {
    /// Times the lock was acquired
    pub acquisitions: u64,
    /// Times the lock was released
    pub releases: u64,
    /// Lock is held by the thread taking the audit
    pub held_by_current_thread: bool,
}

impl LockAudit {
    /// Every acquisition has a matching release
    pub fn balanced(&self) -> bool {
        self.acquisitions == self.releases
    }
}

// ============================================================================
// Audited Lock
// ============================================================================

/// A sleeping mutual-exclusion lock that tracks its owner
pub struct AuditedLock<T> {
    /// Protected data
    data: Mutex<T>,
    /// Token of the owning thread, `NO_OWNER` when free
    owner: AtomicU64,
    /// Acquisition count
    acquisitions: AtomicU64,
    /// Release count
    releases: AtomicU64,
    /// Lock name (for debugging)
    name: &'static str,
}

impl<T> AuditedLock<T> {
    /// Create a new unlocked lock
    pub fn new(name: &'static str, data: T) -> Self {
        Self {
            data: Mutex::new(data),
            owner: AtomicU64::new(NO_OWNER),
            acquisitions: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            name,
        }
    }

    /// Acquire the lock, sleeping until available
    ///
    /// Re-acquiring on the owning thread is a consistency violation: the
    /// underlying mutex would otherwise deadlock silently.
    pub fn lock(&self) -> AuditedGuard<'_, T> {
        let me = current_thread_token();
        if self.owner.load(Ordering::Acquire) == me {
            consistency_violation(
                Bugcheck::RecursiveLock,
                format_args!("{} acquired recursively", self.name),
            );
        }

        // Poison is ignored: a consistency stop aborts before unwinding, and
        // unit tests that catch one still need the data.
        let inner = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        self.owner.store(me, Ordering::Release);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);

        AuditedGuard {
            lock: self,
            inner: Some(inner),
        }
    }

    /// Check whether the calling thread holds the lock
    pub fn held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == current_thread_token()
    }

    /// Check whether any thread holds the lock
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Acquire) != NO_OWNER
    }

    /// Snapshot the acquire/release accounting
    pub fn audit(&self) -> LockAudit {
        LockAudit {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            held_by_current_thread: self.held_by_current_thread(),
        }
    }

    /// Get lock name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> fmt::Debug for AuditedLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditedLock")
            .field("name", &self.name)
            .field("locked", &self.is_locked())
            .finish()
    }
}

// ============================================================================
// Guard
// ============================================================================

/// RAII guard for an audited lock
pub struct AuditedGuard<'a, T> {
    lock: &'a AuditedLock<T>,
    inner: Option<MutexGuard<'a, T>>,
}

impl<'a, T> AuditedGuard<'a, T> {
    /// Release the lock, run `f`, and re-acquire
    ///
    /// This is a lock-drop point: state observed before the call may have
    /// moved by the time the guard is handed back.
    pub fn unlocked<R>(self, f: impl FnOnce() -> R) -> (AuditedGuard<'a, T>, R) {
        let lock = self.lock;
        drop(self);
        let result = f();
        (lock.lock(), result)
    }

    /// Lock this guard belongs to
    pub fn lock_ref(&self) -> &'a AuditedLock<T> {
        self.lock
    }
}

impl<'a, T> Deref for AuditedGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.inner.as_ref() {
            Some(inner) => inner,
            None => unreachable!("audited guard used after release"),
        }
    }
}

impl<'a, T> DerefMut for AuditedGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        match self.inner.as_mut() {
            Some(inner) => inner,
            None => unreachable!("audited guard used after release"),
        }
    }
}

impl<'a, T> Drop for AuditedGuard<'a, T> {
    fn drop(&mut self) {
        // Clear the owner before the mutex opens so a new owner is never overwritten
        self.lock.owner.store(NO_OWNER, Ordering::Release);
        self.lock.releases.fetch_add(1, Ordering::Relaxed);
        self.inner.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_audited_lock() {
        let lock = AuditedLock::new("test", 5u32);

        assert!(!lock.is_locked());
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.held_by_current_thread());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 6);

        let audit = lock.audit();
        assert_eq!(audit.acquisitions, 2);
        assert!(audit.balanced());
        assert!(!audit.held_by_current_thread);
    }

    #[test]
    fn test_unlocked_releases_and_reacquires() {
        let lock = AuditedLock::new("test", 0u32);
        let guard = lock.lock();

        let (guard, observed) = guard.unlocked(|| lock.is_locked());
        assert!(!observed);
        assert!(lock.held_by_current_thread());
        drop(guard);

        assert_eq!(lock.audit().acquisitions, 2);
        assert!(lock.audit().balanced());
    }

    #[test]
    fn test_owner_is_per_thread() {
        let lock = Arc::new(AuditedLock::new("test", ()));
        let guard = lock.lock();

        let other = Arc::clone(&lock);
        let seen = thread::spawn(move || other.held_by_current_thread())
            .join()
            .unwrap();
        assert!(!seen);
        drop(guard);
    }

    #[test]
    #[should_panic(expected = "acquired recursively")]
    fn test_recursive_acquire_is_fatal() {
        let lock = AuditedLock::new("test", ());
        let _first = lock.lock();
        let _second = lock.lock();
    }
}
