//! Backing Object Registry
//!
//! Based on Mach4 vm/vm_object.c vm_object_deallocate
//!
//! Every release of a section reference or mapped view ends in `evaluate`,
//! which decides under the page cache lock whether the object is deleted,
//! parked on the unused list, cleaned inline, or left alone. Deletion work
//! never runs while the caller holds the lock: it is queued for the worker
//! or run after the lock is dropped.

use crate::kern::zalloc::WaitToken;
use crate::section::context::{CacheGuard, CacheState, LifecycleContext};
use crate::section::object::{BackingObject, FileId, ObjectFlags, ObjectId};

// ============================================================================
// Evaluation
// ============================================================================

/// What `evaluate` decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Still referenced, already deleting, or gone
    Untouched,
    /// Kept on the unused list for its resident pages
    Parked,
    /// Handed to the worker for deletion
    Queued,
    /// Flushed and deleted on the calling thread
    Cleaned,
}

/// Which slot of a file `check_or_wait` inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotKind {
    /// Image object only
    Image,
    /// Data object, falling back to the image object
    Both,
}

/// Result of `check_or_wait`
pub(crate) enum CheckOutcome<'a> {
    /// No object, or its deletion finished while we waited
    Gone,
    /// Referenced or still being created
    Busy,
    /// Unreferenced and not deleting; lock still held
    Acquired(CacheGuard<'a>, ObjectId),
}

impl LifecycleContext {
    /// Re-evaluate an object after one of its counts dropped
    ///
    /// Consumes the guard: the lock is released on return. An unreferenced
    /// object with no resident pages is detached from its file and queued
    /// for deletion. One with resident pages stays on the unused list unless
    /// it was marked delete-on-close, in which case it is cleaned here.
    pub(crate) fn evaluate(&self, mut guard: CacheGuard<'_>, id: ObjectId) -> Disposition {
        let mut purged = false;

        let disposition = loop {
            let Some(obj) = guard.objects.get_mut(&id) else {
                break Disposition::Untouched;
            };
            if obj.is_being_deleted() {
                break Disposition::Untouched;
            }

            if !obj.is_unreferenced() {
                if let Some(token) = obj.wait_for_deletion.take() {
                    self.tokens.signal(token);
                }
                break Disposition::Untouched;
            }

            let Some(file) = obj.backing_file else {
                obj.begin_deletion();
                self.detach_for_deletion(&mut guard, id);
                break Disposition::Queued;
            };

            if obj.resident_page_references == 0 {
                obj.begin_deletion();
                guard.clear_backing_object(id);
                self.detach_for_deletion(&mut guard, id);
                break Disposition::Queued;
            }

            if obj.flags.contains(ObjectFlags::GLOBAL_MEMORY) && !purged {
                purged = true;
                obj.flags.insert(ObjectFlags::BEING_PURGED);
                obj.mapped_views = 1;
                log::debug!("{:?} purging shared subset", id);

                let (relocked, ()) = guard.unlocked(|| {
                    self.collab.purger.purge_shared_subset(id, file);
                });
                guard = relocked;

                if let Some(obj) = guard.objects.get_mut(&id) {
                    obj.flags.remove(ObjectFlags::BEING_PURGED);
                    BackingObject::decrement(&mut obj.mapped_views, id, "mapped views");
                }
                continue;
            }

            if obj.flags.contains(ObjectFlags::DELETE_ON_CLOSE) {
                obj.mapped_views = 1;
                obj.begin_deletion();
                guard.remove_unused(id);
                break Disposition::Cleaned;
            }

            guard.insert_unused(id);
            break Disposition::Parked;
        };

        if self.stats.unused_peak.observe(guard.unused_count()) {
            log::trace!("unused cache peak {}", guard.unused_count());
        }
        let surplus = self.unused_surplus(&guard);
        drop(guard);

        if surplus {
            self.signals.set_cleanup();
        }
        if disposition == Disposition::Cleaned {
            log::debug!("{:?} delete-on-close, cleaning inline", id);
            self.clean(id, true);
        }
        disposition
    }

    /// Unlink a deleting object from the unused lists and queue it. Lock held.
    fn detach_for_deletion(&self, state: &mut CacheState, id: ObjectId) {
        state.remove_unused(id);
        state.remove_unused_shards_of(id);
        self.queue_deletion(id);
    }

    /// Drop one section reference and `user_references` user references
    pub(crate) fn release_section_reference(&self, id: ObjectId, user_references: u32) {
        self.release_section(id, user_references, 0);
    }

    /// Drop a section reference along with its user and writable shares
    pub(crate) fn release_section(&self, id: ObjectId, user_references: u32, writable: u32) {
        let mut guard = self.lock();
        let Some(obj) = guard.objects.get_mut(&id) else {
            log::warn!("release of unknown {:?}", id);
            return;
        };
        BackingObject::decrement(&mut obj.section_references, id, "section references");
        for _ in 0..user_references {
            BackingObject::decrement(&mut obj.user_references, id, "user references");
        }
        for _ in 0..writable {
            BackingObject::decrement(
                &mut obj.writable_user_references,
                id,
                "writable user references",
            );
        }
        self.evaluate(guard, id);
    }

    /// Queue an object whose last resident page or reference went away
    ///
    /// Lock held throughout. Returns true if the object was queued.
    pub(crate) fn check_for_deletion(&self, state: &mut CacheState, id: ObjectId) -> bool {
        let Some(obj) = state.objects.get_mut(&id) else {
            return false;
        };
        if obj.resident_page_references != 0
            || !obj.is_unreferenced()
            || obj.is_being_deleted()
            || obj.is_being_created()
        {
            return false;
        }

        obj.begin_deletion();
        state.clear_backing_object(id);
        self.detach_for_deletion(state, id);
        true
    }

    // ========================================================================
    // Check or Wait
    // ========================================================================

    /// Inspect a file's object, waiting out a deletion in progress
    ///
    /// The wait token is taken before the lock so that allocation never
    /// happens under it. If the object is being deleted the caller joins the
    /// waiters and returns `Gone` once the deletion completed.
    pub(crate) fn check_or_wait(
        &self,
        kind: SlotKind,
        file: FileId,
        delay_close: bool,
    ) -> CheckOutcome<'_> {
        let token = self.allocate_token();
        let mut guard = self.lock();

        let Some(id) = Self::slot_object(&guard, kind, file) else {
            self.tokens.release(token);
            return CheckOutcome::Gone;
        };
        let Some(obj) = guard.objects.get_mut(&id) else {
            self.tokens.release(token);
            return CheckOutcome::Gone;
        };

        if obj.section_references != 0 || obj.mapped_views != 0 || obj.is_being_created() {
            if delay_close {
                obj.flags.insert(ObjectFlags::DELETE_ON_CLOSE);
            }
            drop(guard);
            self.tokens.release(token);
            return CheckOutcome::Busy;
        }

        if obj.is_being_deleted() {
            let waiting_on = self.join_waiters(obj, token);
            self.stats.deletion_waits.inc();
            drop(guard);

            log::debug!("waiting for deletion of {:?}", id);
            self.tokens.wait(waiting_on);
            self.tokens.release(waiting_on);
            return CheckOutcome::Gone;
        }

        self.tokens.release(token);
        CheckOutcome::Acquired(guard, id)
    }

    /// Register `token` on a deleting object or share the one already there
    ///
    /// Returns the token to wait on; it carries one reference for the caller.
    pub(crate) fn join_waiters(&self, obj: &mut BackingObject, token: WaitToken) -> WaitToken {
        match obj.wait_for_deletion {
            Some(existing) => {
                self.tokens.reference(existing);
                self.tokens.release(token);
                existing
            }
            None => {
                obj.wait_for_deletion = Some(token);
                token
            }
        }
    }

    /// Object in the slot `kind` selects
    pub(crate) fn slot_object(
        state: &CacheState,
        kind: SlotKind,
        file: FileId,
    ) -> Option<ObjectId> {
        let slots = state.files.get(&file)?;
        match kind {
            SlotKind::Image => slots.image,
            SlotKind::Both => slots.data.or(slots.image),
        }
    }

    /// Block until the deletion of `id` completes
    ///
    /// Takes and returns the lock; a lock-drop point even if the object is
    /// no longer deleting when the lock is retaken.
    pub(crate) fn wait_for_deletion<'a>(
        &'a self,
        guard: CacheGuard<'a>,
        id: ObjectId,
    ) -> CacheGuard<'a> {
        let (mut guard, token) = guard.unlocked(|| self.allocate_token());

        let Some(obj) = guard
            .objects
            .get_mut(&id)
            .filter(|o| o.is_being_deleted())
        else {
            self.tokens.release(token);
            return guard;
        };

        let waiting_on = self.join_waiters(obj, token);
        self.stats.deletion_waits.inc();
        let (guard, ()) = guard.unlocked(|| {
            self.tokens.wait(waiting_on);
            self.tokens.release(waiting_on);
        });
        guard
    }
}
