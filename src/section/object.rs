//! Backing Objects
//!
//! Based on Mach4 vm/vm_object.h/c
//!
//! A backing object describes one mappable backing store, either a file
//! region or anonymous swap-backed memory. Every count and flag here is
//! guarded by the page cache lock and changes only inside one critical
//! section. Deciding on several counters at once is not expressible with
//! independent atomics.
//!
//! Lifecycle:
//! - `Created` while the descriptor is being built
//! - `Active` once creation completes
//! - `Deleting` from the single transition that sets `being_deleted`
//! - `Freed` when the descriptor has been torn down

use std::fmt;

use crate::kern::fatal::{consistency_violation, Bugcheck};
use crate::kern::zalloc::WaitToken;
use crate::section::descriptor::BackingObjectDescriptor;

// ============================================================================
// Identifiers
// ============================================================================

/// Backing object identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub u64);

/// Backing file identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub u64);

// ============================================================================
// Object Flags
// ============================================================================

/// Backing object flags
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectFlags(u32);

impl ObjectFlags {
    /// Descriptor is being built
    pub const BEING_CREATED: Self = Self(0x0001);
    /// Deletion has started (set once, never cleared)
    pub const BEING_DELETED: Self = Self(0x0002);
    /// Shared subset is being purged
    pub const BEING_PURGED: Self = Self(0x0004);
    /// Flush and delete once the last reference goes away
    pub const DELETE_ON_CLOSE: Self = Self(0x0008);
    /// Executable image
    pub const IMAGE: Self = Self(0x0010);
    /// Detached from the file's object slot
    pub const FILE_POINTER_CLEARED: Self = Self(0x0020);
    /// Image with a shared writable subset
    pub const GLOBAL_MEMORY: Self = Self(0x0040);
    /// Modified page writer must not start new writes
    pub const NO_MODIFIED_WRITING: Self = Self(0x0080);
    /// A cleaner waits for in-flight modified writes
    pub const WAITING_FOR_WRITES: Self = Self(0x0100);

    /// Empty flags
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Get bits
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Check if contains flags
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Union with another flags
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Difference from another flags
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Set flags in place
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clear flags in place
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl core::ops::BitOr for ObjectFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for ObjectFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(ObjectFlags, &str); 9] = [
            (ObjectFlags::BEING_CREATED, "BEING_CREATED"),
            (ObjectFlags::BEING_DELETED, "BEING_DELETED"),
            (ObjectFlags::BEING_PURGED, "BEING_PURGED"),
            (ObjectFlags::DELETE_ON_CLOSE, "DELETE_ON_CLOSE"),
            (ObjectFlags::IMAGE, "IMAGE"),
            (ObjectFlags::FILE_POINTER_CLEARED, "FILE_POINTER_CLEARED"),
            (ObjectFlags::GLOBAL_MEMORY, "GLOBAL_MEMORY"),
            (ObjectFlags::NO_MODIFIED_WRITING, "NO_MODIFIED_WRITING"),
            (ObjectFlags::WAITING_FOR_WRITES, "WAITING_FOR_WRITES"),
        ];

        let mut list = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                list.entry(&format_args!("{}", name));
            }
        }
        list.finish()
    }
}

// ============================================================================
// Object State
// ============================================================================

/// Backing object lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum ObjectState {
    /// Descriptor under construction
    Created = 0,
    /// Steady state
    Active = 1,
    /// Deletion in progress
    Deleting = 2,
    /// Descriptor torn down
    Freed = 3,
}

// ============================================================================
// Backing Object
// ============================================================================

/// A reference-counted backing store
#[derive(Debug)]
pub struct BackingObject {
    /// Object identifier
    pub id: ObjectId,
    /// Section handles referencing the object
    pub section_references: u32,
    /// Mapped views
    pub mapped_views: u32,
    /// Sections created on behalf of users
    pub user_references: u32,
    /// Prototype entries holding a resident frame
    pub resident_page_references: u32,
    /// User sections opened for writing
    pub writable_user_references: u32,
    /// Modified page writes in flight
    pub modified_writes: u32,
    /// Flags
    pub flags: ObjectFlags,
    /// Backing file, `None` for swap-backed memory
    pub backing_file: Option<FileId>,
    /// Token of the threads waiting for deletion to finish
    pub wait_for_deletion: Option<WaitToken>,
    /// Prototype storage, released by the deletion protocol
    pub descriptor: Option<BackingObjectDescriptor>,
    /// Referenced since the eviction pass last pinned it
    pub accessed: bool,
    /// Linked on the unused object list
    pub on_unused: bool,
    /// Lifecycle state
    state: ObjectState,
}

impl BackingObject {
    /// Create an object in the `Created` state with one section reference
    pub fn new(id: ObjectId, backing_file: Option<FileId>, flags: ObjectFlags) -> Self {
        Self {
            id,
            section_references: 1,
            mapped_views: 0,
            user_references: 0,
            resident_page_references: 0,
            writable_user_references: 0,
            modified_writes: 0,
            flags: flags | ObjectFlags::BEING_CREATED,
            backing_file,
            wait_for_deletion: None,
            descriptor: None,
            accessed: false,
            on_unused: false,
            state: ObjectState::Created,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ObjectState {
        self.state
    }

    /// Advance the lifecycle state; moving backwards is fatal
    fn advance(&mut self, to: ObjectState) {
        if to < self.state {
            consistency_violation(
                Bugcheck::StateRegression,
                format_args!("{:?} moved from {:?} to {:?}", self.id, self.state, to),
            );
        }
        self.state = to;
    }

    /// Finish creation
    pub fn complete_creation(&mut self) {
        self.flags.remove(ObjectFlags::BEING_CREATED);
        self.advance(ObjectState::Active);
    }

    /// Enter deletion; happens exactly once per object
    pub fn begin_deletion(&mut self) {
        if self.is_being_deleted() {
            consistency_violation(
                Bugcheck::DeletionRestarted,
                format_args!("{:?} already being deleted", self.id),
            );
        }
        self.flags.insert(ObjectFlags::BEING_DELETED);
        self.advance(ObjectState::Deleting);
    }

    /// Descriptor torn down
    pub fn mark_freed(&mut self) {
        self.advance(ObjectState::Freed);
    }

    pub fn is_being_created(&self) -> bool {
        self.flags.contains(ObjectFlags::BEING_CREATED)
    }

    pub fn is_being_deleted(&self) -> bool {
        self.flags.contains(ObjectFlags::BEING_DELETED)
    }

    pub fn is_image(&self) -> bool {
        self.flags.contains(ObjectFlags::IMAGE)
    }

    /// New mappings and sections may reference the object
    pub fn accepts_references(&self) -> bool {
        !self.is_being_created() && !self.is_being_deleted()
    }

    /// No sections and no views
    pub fn is_unreferenced(&self) -> bool {
        self.mapped_views == 0 && self.section_references == 0
    }

    /// Decrement a count, treating underflow as corruption
    pub fn decrement(count: &mut u32, id: ObjectId, what: &str) {
        match count.checked_sub(1) {
            Some(value) => *count = value,
            None => consistency_violation(
                Bugcheck::ReferenceUnderflow,
                format_args!("{:?} {} underflow", id, what),
            ),
        }
    }
}

/// Point-in-time view of an object's counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub id: ObjectId,
    pub state: ObjectState,
    pub flags: ObjectFlags,
    pub section_references: u32,
    pub mapped_views: u32,
    pub user_references: u32,
    pub resident_page_references: u32,
    pub writable_user_references: u32,
    pub on_unused: bool,
    pub accessed: bool,
}

impl From<&BackingObject> for ObjectInfo {
    fn from(obj: &BackingObject) -> Self {
        Self {
            id: obj.id,
            state: obj.state,
            flags: obj.flags,
            section_references: obj.section_references,
            mapped_views: obj.mapped_views,
            user_references: obj.user_references,
            resident_page_references: obj.resident_page_references,
            writable_user_references: obj.writable_user_references,
            on_unused: obj.on_unused,
            accessed: obj.accessed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_flags() {
        let mut flags = ObjectFlags::IMAGE | ObjectFlags::GLOBAL_MEMORY;
        assert!(flags.contains(ObjectFlags::IMAGE));
        assert!(!flags.contains(ObjectFlags::BEING_DELETED));

        flags.insert(ObjectFlags::BEING_PURGED);
        flags.remove(ObjectFlags::IMAGE);
        assert_eq!(
            flags,
            ObjectFlags::GLOBAL_MEMORY.union(ObjectFlags::BEING_PURGED)
        );
        assert_eq!(
            flags.difference(ObjectFlags::BEING_PURGED),
            ObjectFlags::GLOBAL_MEMORY
        );
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut obj = BackingObject::new(ObjectId(1), Some(FileId(9)), ObjectFlags::empty());
        assert_eq!(obj.state(), ObjectState::Created);
        assert!(!obj.accepts_references());

        obj.complete_creation();
        assert_eq!(obj.state(), ObjectState::Active);
        assert!(obj.accepts_references());

        obj.begin_deletion();
        assert_eq!(obj.state(), ObjectState::Deleting);
        assert!(obj.is_being_deleted());
        assert!(!obj.accepts_references());

        obj.mark_freed();
        assert_eq!(obj.state(), ObjectState::Freed);
        assert!(obj.is_being_deleted());
    }

    #[test]
    #[should_panic(expected = "already being deleted")]
    fn test_deletion_is_once() {
        let mut obj = BackingObject::new(ObjectId(1), None, ObjectFlags::empty());
        obj.complete_creation();
        obj.begin_deletion();
        obj.begin_deletion();
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn test_count_underflow_is_fatal() {
        let mut obj = BackingObject::new(ObjectId(2), None, ObjectFlags::empty());
        BackingObject::decrement(&mut obj.mapped_views, obj.id, "mapped views");
    }
}
