//! Fatal consistency stops
//!
//! Corruption of the page cache (a live translation in a prototype entry that
//! must never hold one, a dirty page where none may exist) has no safe
//! continuation. These stops log the violation and abort the process
//! whatever panic strategy the embedding build uses. Unit tests panic
//! instead so the harness can observe the stop.

use std::fmt;

/// Consistency violation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Bugcheck {
    /// Valid entry found in a file-backed or small-page descriptor
    ValidPrototypeEntry = 0x0,
    /// Modified page found while cleaning without dirty pages expected
    UnexpectedDirtyPage = 0x1,
    /// Deletion requested twice for the same object
    DeletionRestarted = 0x2,
    /// Valid entry found while trimming an unused shard
    ValidEntryInUnusedShard = 0x3,
    /// Swap reference found in a data-file shard
    ForeignEntryInUnusedShard = 0x4,
    /// Object state moved backwards
    StateRegression = 0x5,
    /// Reference count underflow
    ReferenceUnderflow = 0x6,
    /// Audited lock acquired by its owner
    RecursiveLock = 0x7,
}

impl Bugcheck {
    /// Get the numeric code
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for Bugcheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:x})", self, self.code())
    }
}

/// Stop on an unrecoverable page cache inconsistency
#[cold]
pub fn consistency_violation(check: Bugcheck, detail: fmt::Arguments<'_>) -> ! {
    log::error!("page cache consistency violation {}: {}", check, detail);
    terminate(check, detail)
}

#[cfg(not(test))]
fn terminate(_check: Bugcheck, _detail: fmt::Arguments<'_>) -> ! {
    std::process::abort()
}

#[cfg(test)]
fn terminate(check: Bugcheck, detail: fmt::Arguments<'_>) -> ! {
    panic!("consistency violation {}: {}", check, detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bugcheck_codes() {
        assert_eq!(Bugcheck::ValidPrototypeEntry.code(), 0);
        assert_eq!(Bugcheck::UnexpectedDirtyPage.code(), 1);
        assert_eq!(Bugcheck::ForeignEntryInUnusedShard.code(), 4);
    }

    #[test]
    #[should_panic(expected = "UnexpectedDirtyPage")]
    fn test_violation_panics() {
        consistency_violation(Bugcheck::UnexpectedDirtyPage, format_args!("page 3"));
    }
}
