//! External collaborators
//!
//! The lifecycle manager reaches the rest of the memory system only through
//! these traits. All of them are called with the page cache lock held except
//! where a method says otherwise; implementations must not call back into the
//! manager from a locked call.
//!
//! `memory` provides in-process implementations with fault injection.

pub mod memory;

use std::sync::Arc;

use crate::section::descriptor::{PageFrame, PrototypeEntry, SwapSlot};
use crate::section::error::IoStatus;
use crate::section::object::{FileId, ObjectId};

/// Pages reserved against the global commit limit
#[derive(Debug, PartialEq, Eq)]
pub struct CommitCharge {
    pages: u64,
}

impl CommitCharge {
    /// Create a charge; only allocators mint charges
    pub fn new(pages: u64) -> Self {
        Self { pages }
    }

    /// Pages covered by the charge
    pub fn pages(&self) -> u64 {
        self.pages
    }
}

/// Page frame database
pub trait PageFrameDatabase: Send + Sync {
    /// Allocate a resident frame for an entry whose backing is `original`,
    /// charging one share to the shard's `table` frame
    fn allocate(&self, original: PrototypeEntry, table: PageFrame) -> Option<PageFrame>;
    /// Detach the frame from its prototype entry
    fn mark_deleted(&self, frame: PageFrame);
    fn is_deleted(&self, frame: PageFrame) -> bool;
    fn increment_share_count(&self, frame: PageFrame);
    fn decrement_share_count(&self, frame: PageFrame);
    fn share_count(&self, frame: PageFrame) -> u32;
    /// I/O and other transient references, locked charges included
    fn reference_count(&self, frame: PageFrame) -> u32;
    fn is_on_free_list(&self, frame: PageFrame) -> bool;
    /// Remove from the standby or modified list
    fn unlink_from_list(&self, frame: PageFrame);
    fn insert_in_free_list(&self, frame: PageFrame);
    fn insert_in_standby_list(&self, frame: PageFrame);
    fn is_modified(&self, frame: PageFrame) -> bool;
    fn set_modified(&self, frame: PageFrame, modified: bool);
    /// Charge held while the frame is part of a write
    fn add_locked_charge(&self, frame: PageFrame);
    fn remove_locked_charge(&self, frame: PageFrame);
    /// Backing the entry had before the frame was made resident
    fn original_entry(&self, frame: PageFrame) -> PrototypeEntry;
}

/// Pageable pool holding page table shards
pub trait PrototypePool: Send + Sync {
    /// Allocate a table frame for a shard of `entries` prototype entries.
    /// Callable with or without the page cache lock.
    fn allocate_shard(&self, entries: usize) -> Option<PageFrame>;
    fn free_shard(&self, table: PageFrame);
    fn is_resident(&self, table: PageFrame) -> bool;
    /// Fault the table back in. Called without the page cache lock.
    fn ensure_resident(&self, table: PageFrame);
}

/// Swap space and commit accounting
pub trait SwapAllocator: Send + Sync {
    fn reserve(&self, pages: u64) -> Option<CommitCharge>;
    fn release(&self, charge: CommitCharge);
    fn allocate_slot(&self) -> Option<SwapSlot>;
    fn release_slot(&self, slot: SwapSlot);
    /// Release whatever swap `entry` references; no-op for other entries
    fn release_entry(&self, entry: PrototypeEntry) {
        if let Some(slot) = entry.swap_slot() {
            self.release_slot(slot);
        }
    }
    /// Grow swap space. Called without the page cache lock.
    fn grow(&self, pages: u64) -> bool;
    /// One bounded attempt to shrink swap space. Called without the page cache lock.
    fn contract(&self, pages: u64) -> bool;
}

/// File I/O; every method is called without the page cache lock
pub trait FileIo: Send + Sync {
    /// Synchronously write `frames` at `offset`, `bytes` long
    fn write(&self, file: FileId, frames: &[PageFrame], offset: u64, bytes: u64) -> IoStatus;
    /// Take the file system locks a flush needs
    fn acquire_for_flush(&self, file: FileId) -> IoStatus;
    fn release_after_flush(&self, file: FileId);
    /// File lives on a network redirector
    fn is_remote(&self, file: FileId) -> bool;
}

/// External page cache that holds views on mapped files
pub trait CacheTrimmer: Send + Sync {
    /// Ask for up to `views` inactive views to be unmapped. Called without the
    /// page cache lock. Returns true if anything was released.
    fn unmap_inactive_views(&self, views: u32) -> bool;
}

/// Purges the shared writable subset of global image objects
pub trait ImagePurger: Send + Sync {
    /// Called without the page cache lock
    fn purge_shared_subset(&self, object: ObjectId, file: FileId);
}

/// Every collaborator the manager needs
#[derive(Clone)]
pub struct Collaborators {
    pub frames: Arc<dyn PageFrameDatabase>,
    pub pool: Arc<dyn PrototypePool>,
    pub swap: Arc<dyn SwapAllocator>,
    pub files: Arc<dyn FileIo>,
    pub trimmer: Arc<dyn CacheTrimmer>,
    pub purger: Arc<dyn ImagePurger>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
