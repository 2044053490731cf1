//! Unused Cache Eviction
//!
//! Based on Mach4 vm/vm_pageout.c vm_pageout_scan
//!
//! Run by the dereference worker when the unused lists exceed their budget
//! or a forced trim is pending. Unused shards are preferred over whole
//! objects. Every candidate is pinned, flushed with the lock dropped, and
//! rechecked: if anything touched it meanwhile it is requeued or released
//! instead of being torn down.

use crate::kern::fatal::{consistency_violation, Bugcheck};
use crate::section::clean::FlushMode;
use crate::section::context::{CacheGuard, CacheState, LifecycleContext, ShardRef};
use crate::section::descriptor::{DescriptorKind, PrototypeEntry};
use crate::section::error::IoStatus;
use crate::section::object::{BackingObject, FileId, ObjectFlags, ObjectId};

/// Result of one eviction step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Eviction {
    /// Both unused lists were empty
    Empty,
    /// Stale or ineligible entry dropped from its list
    Skipped,
    /// Put back on its list for a later pass
    Requeued,
    /// Referenced again during the flush and left alone
    Reclaimed,
    /// Shard storage released
    Trimmed,
    /// Object flushed and deleted
    Evicted,
}

/// Consecutive-failure counters of one pass
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    /// Requeues caused by in-flight modified writes
    paging_io: u32,
    /// Requeues caused by failed flushes
    flush_failures: u32,
}

impl LifecycleContext {
    /// Shrink the unused cache back under budget
    pub(crate) fn eviction_pass(&self) {
        self.stats.eviction_passes.inc();
        let mut backoff = Backoff::default();
        let mut loops: u32 = 0;
        let mut stalled: u32 = 0;
        let mut trimmer_released = false;

        loop {
            if self.signals.shutdown_requested() {
                log::debug!("eviction pass stopped by shutdown");
                break;
            }

            let mut guard = self.lock();
            if !self.unused_surplus(&guard) && guard.force_free == 0 {
                break;
            }

            loops += 1;
            if loops % self.config.drain_interval == 0 {
                drop(guard);
                let served = self.drain_deferred();
                log::trace!("eviction drained {} deferred requests inline", served);
                if loops >= self.config.trim_after_loops {
                    self.request_view_trim();
                }
                self.short_delay();
                continue;
            }

            if guard.unused_objects.is_empty() && guard.unused_shards.is_empty() {
                drop(guard);
                // Views released by the trimmer come back through unmap
                if !trimmer_released && self.request_view_trim() {
                    trimmer_released = true;
                    continue;
                }
                self.lock().force_free = 0;
                break;
            }

            if guard.force_free > 0 {
                guard.force_free -= 1;
            }
            match self.evict_next(guard, &mut backoff) {
                Eviction::Requeued => stalled += 1,
                _ => stalled = 0,
            }
            if stalled >= self.config.trim_after_loops.max(1) {
                log::debug!("eviction pass stalled after {} requeues", stalled);
                break;
            }
        }
    }

    /// Ask the external cache to drop inactive views
    fn request_view_trim(&self) -> bool {
        self.stats.trim_requests.inc();
        let released = self.collab.trimmer.unmap_inactive_views(self.config.trim_views);
        log::debug!("view trim requested, released: {}", released);
        released
    }

    /// Process the oldest unused shard, or else the oldest unused object
    pub(crate) fn evict_next<'a>(
        &'a self,
        mut guard: CacheGuard<'a>,
        backoff: &mut Backoff,
    ) -> Eviction {
        if let Some(shard_ref) = guard.unused_shards.pop_front() {
            if let Some(shard) = guard
                .descriptor_mut(shard_ref.object)
                .and_then(|d| d.shards.get_mut(shard_ref.shard))
            {
                shard.on_unused = false;
            }
            return self.trim_shard(guard, shard_ref, backoff);
        }
        if let Some(id) = guard.unused_objects.pop_front() {
            if let Some(obj) = guard.objects.get_mut(&id) {
                obj.on_unused = false;
            }
            return self.evict_object(guard, id, backoff);
        }
        Eviction::Empty
    }

    /// Take the file system locks and write back `shards`. Lock held on
    /// entry and return, dropped in between.
    fn flush_for_eviction<'a>(
        &'a self,
        guard: CacheGuard<'a>,
        id: ObjectId,
        file: FileId,
        shards: std::ops::Range<usize>,
    ) -> (CacheGuard<'a>, IoStatus, bool) {
        let (guard, (acquired, remote)) = guard.unlocked(|| {
            (
                self.collab.files.acquire_for_flush(file),
                self.collab.files.is_remote(file),
            )
        });
        if !acquired.is_success() {
            return (guard, acquired, remote);
        }

        let (guard, status) = self.flush_shards(guard, id, shards, FlushMode::WriteBack);
        let (guard, ()) = guard.unlocked(|| self.collab.files.release_after_flush(file));
        (guard, status, remote)
    }

    /// Count a failed or blocked candidate, backing off after a run of them
    fn note_failure<'a>(&'a self, guard: CacheGuard<'a>, count: &mut u32) -> CacheGuard<'a> {
        *count += 1;
        if *count < self.config.consecutive_failure_limit {
            return guard;
        }
        *count = 0;
        let (guard, ()) = guard.unlocked(|| self.short_delay());
        guard
    }

    // ========================================================================
    // Objects
    // ========================================================================

    fn evict_object<'a>(
        &'a self,
        mut guard: CacheGuard<'a>,
        id: ObjectId,
        backoff: &mut Backoff,
    ) -> Eviction {
        let Some(obj) = guard.objects.get_mut(&id) else {
            return Eviction::Skipped;
        };
        if !obj.is_unreferenced() || obj.is_being_deleted() {
            return Eviction::Skipped;
        }
        let Some(file) = obj.backing_file else {
            return Eviction::Skipped;
        };

        if obj.modified_writes > 0 {
            guard.insert_unused(id);
            let mut count = backoff.paging_io;
            drop(self.note_failure(guard, &mut count));
            backoff.paging_io = count;
            return Eviction::Requeued;
        }
        backoff.paging_io = 0;

        obj.mapped_views = 1;
        obj.accessed = false;
        let has_pages = obj.resident_page_references > 0;
        let shards = obj.descriptor.as_ref().map_or(0, |d| d.shards.len());

        let (mut status, mut remote) = (IoStatus::Success, false);
        if has_pages {
            let (relocked, flushed, is_remote) = self.flush_for_eviction(guard, id, file, 0..shards);
            guard = relocked;
            status = flushed;
            remote = is_remote;
        }

        let Some(obj) = guard.objects.get_mut(&id) else {
            return Eviction::Skipped;
        };
        let untouched = obj.mapped_views == 1
            && !obj.accessed
            && obj.section_references == 0
            && !obj.is_being_deleted();
        if !untouched {
            BackingObject::decrement(&mut obj.mapped_views, id, "mapped views");
            if obj.is_unreferenced() && !obj.is_being_deleted() {
                if obj.resident_page_references > 0 {
                    guard.insert_unused(id);
                } else {
                    self.check_for_deletion(&mut guard, id);
                }
                self.stats.eviction_requeues.inc();
                log::trace!("{:?} touched during eviction flush, requeued", id);
                return Eviction::Requeued;
            }
            self.stats.eviction_reclaimed.inc();
            log::trace!("{:?} referenced during eviction flush", id);
            return Eviction::Reclaimed;
        }

        let mut dirty_expected = false;
        if !status.is_success() {
            let transient = matches!(
                status,
                IoStatus::FileLockConflict | IoStatus::WriteInProgress
            );
            if transient || !remote {
                obj.mapped_views = 0;
                guard.insert_unused(id);
                log::debug!("{:?} eviction flush failed with {:?}, requeued", id, status);
                let mut count = backoff.flush_failures;
                drop(self.note_failure(guard, &mut count));
                backoff.flush_failures = count;
                return Eviction::Requeued;
            }
            log::warn!("{:?} remote flush failed with {:?}, discarding", id, status);
            dirty_expected = true;
        }
        backoff.flush_failures = 0;

        obj.begin_deletion();
        obj.flags.insert(ObjectFlags::NO_MODIFIED_WRITING);
        drop(guard);

        self.clean(id, dirty_expected);
        self.stats.objects_evicted.inc();
        log::debug!("{:?} evicted", id);
        Eviction::Evicted
    }

    // ========================================================================
    // Shards
    // ========================================================================

    fn trim_shard<'a>(
        &'a self,
        mut guard: CacheGuard<'a>,
        shard_ref: ShardRef,
        backoff: &mut Backoff,
    ) -> Eviction {
        let ShardRef { object: id, shard: s } = shard_ref;

        let Some(obj) = guard.objects.get_mut(&id) else {
            return Eviction::Skipped;
        };
        if obj.is_being_deleted() {
            return Eviction::Skipped;
        }
        let Some(file) = obj.backing_file else {
            return Eviction::Skipped;
        };
        let no_writes = obj.flags.contains(ObjectFlags::NO_MODIFIED_WRITING);
        let Some(shard) = obj
            .descriptor
            .as_mut()
            .filter(|d| d.kind == DescriptorKind::DataFile)
            .and_then(|d| d.shards.get_mut(s))
        else {
            return Eviction::Skipped;
        };
        if shard.mapped_views != 0 || shard.is_severed() {
            return Eviction::Skipped;
        }
        if no_writes {
            guard.insert_unused_shard(shard_ref);
            return Eviction::Requeued;
        }

        shard.mapped_views = 1;
        shard.accessed = false;
        obj.mapped_views += 1;

        let (relocked, status, _) = self.flush_for_eviction(guard, id, file, s..s + 1);
        guard = relocked;

        let raced = guard.objects.get(&id).map_or(true, |o| {
            let shard = o.descriptor.as_ref().and_then(|d| d.shards.get(s));
            o.is_being_deleted()
                || shard.map_or(true, |sh| sh.mapped_views != 1 || sh.accessed)
        });
        if raced || !status.is_success() {
            if raced {
                self.stats.eviction_requeues.inc();
                log::trace!("{:?} shard {} touched during eviction flush", id, s);
            } else {
                log::debug!("{:?} shard {} flush failed with {:?}", id, s, status);
                let mut count = backoff.flush_failures;
                guard = self.note_failure(guard, &mut count);
                backoff.flush_failures = count;
            }
            self.unpin_shard(&mut guard, shard_ref);
            return Eviction::Requeued;
        }
        backoff.flush_failures = 0;

        if !self.shard_reclaimable(&mut guard, shard_ref) {
            self.stats.eviction_requeues.inc();
            log::trace!("{:?} shard {} has busy pages, requeued", id, s);
            self.unpin_shard(&mut guard, shard_ref);
            return Eviction::Requeued;
        }

        self.sever_shard(&mut guard, shard_ref);
        self.stats.shards_trimmed.inc();
        log::trace!("{:?} shard {} trimmed", id, s);
        self.check_for_deletion(&mut guard, id);
        Eviction::Trimmed
    }

    /// Every resident page of a pinned shard is clean and idle
    ///
    /// Marks the shard accessed otherwise. A valid entry, or a swap-backed
    /// entry in a data file, means the shard was corrupted.
    fn shard_reclaimable(&self, state: &mut CacheState, shard_ref: ShardRef) -> bool {
        let frames = &self.collab.frames;
        let Some(shard) = state
            .descriptor_mut(shard_ref.object)
            .and_then(|d| d.shards.get_mut(shard_ref.shard))
        else {
            return false;
        };
        let Some(table) = shard.table else {
            return false;
        };
        if !self.collab.pool.is_resident(table) {
            return true;
        }

        for entry in &shard.entries {
            match *entry {
                PrototypeEntry::Valid(frame) => consistency_violation(
                    Bugcheck::ValidEntryInUnusedShard,
                    format_args!("{:?} shard {} frame {:?}", shard_ref.object, shard_ref.shard, frame),
                ),
                PrototypeEntry::SwapBacked(slot) => consistency_violation(
                    Bugcheck::ForeignEntryInUnusedShard,
                    format_args!("{:?} shard {} slot {:?}", shard_ref.object, shard_ref.shard, slot),
                ),
                PrototypeEntry::Transition(frame) => {
                    if frames.is_modified(frame) || frames.reference_count(frame) != 0 {
                        shard.accessed = true;
                        return false;
                    }
                }
                PrototypeEntry::Absent | PrototypeEntry::FileBacked { .. } => {}
            }
        }
        true
    }

    /// Free a pinned shard's pages and storage, dropping both pins
    fn sever_shard(&self, state: &mut CacheState, shard_ref: ShardRef) {
        let ShardRef { object: id, shard: s } = shard_ref;
        let Some(obj) = state.objects.get_mut(&id) else {
            return;
        };
        let Some(shard) = obj.descriptor.as_mut().and_then(|d| d.shards.get_mut(s)) else {
            return;
        };

        let mut freed = 0;
        if let Some(table) = shard.table {
            for entry in shard.entries.iter_mut() {
                if let PrototypeEntry::Transition(frame) = *entry {
                    self.free_transition_frame(frame, table);
                    freed += 1;
                }
            }
        }
        if let Some(table) = shard.sever() {
            self.collab.pool.free_shard(table);
        }
        shard.mapped_views = 0;

        for _ in 0..freed {
            BackingObject::decrement(&mut obj.resident_page_references, id, "resident pages");
        }
        BackingObject::decrement(&mut obj.mapped_views, id, "mapped views");
    }

    /// Drop the eviction pins of a shard, requeueing it if nothing maps it
    fn unpin_shard(&self, state: &mut CacheState, shard_ref: ShardRef) {
        let ShardRef { object: id, shard: s } = shard_ref;
        let Some(obj) = state.objects.get_mut(&id) else {
            return;
        };
        let deleting = obj.is_being_deleted();
        let mut requeue = false;
        if let Some(shard) = obj.descriptor.as_mut().and_then(|d| d.shards.get_mut(s)) {
            BackingObject::decrement(&mut shard.mapped_views, id, "shard views");
            requeue = shard.mapped_views == 0 && !deleting;
        }
        BackingObject::decrement(&mut obj.mapped_views, id, "mapped views");

        if requeue {
            state.insert_unused_shard(shard_ref);
        }
        self.check_for_deletion(state, id);
    }
}
