//! Page cache state and the lifecycle context
//!
//! `CacheState` is everything the page cache lock guards: the object table,
//! the per-file object slots, and the unused object and shard lists.
//! `LifecycleContext` bundles that lock with the collaborators, the
//! wait-token zone, the deferred queue and the worker signals. It is passed
//! explicitly to every registry, protocol and worker routine, so lock
//! ownership stays visible at each call site.

use std::collections::{BTreeMap, VecDeque};
use std::thread;

use crate::kern::event::Event;
use crate::kern::lock::{AuditedGuard, AuditedLock};
use crate::kern::zalloc::{TokenZone, WaitToken};
use crate::section::collab::Collaborators;
use crate::section::config::LifecycleConfig;
use crate::section::descriptor::{BackingObjectDescriptor, PageFrame, PrototypeEntry};
use crate::section::object::{BackingObject, FileId, ObjectFlags, ObjectId};
use crate::section::stats::LifecycleStats;
use crate::section::worker::{DeferredQueue, WorkerSignals};

// ============================================================================
// Cache State
// ============================================================================

/// Backing objects registered for a file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileSlots {
    /// Data section object
    pub data: Option<ObjectId>,
    /// Image section object
    pub image: Option<ObjectId>,
}

impl FileSlots {
    pub fn is_empty(&self) -> bool {
        self.data.is_none() && self.image.is_none()
    }
}

/// A shard on the unused shard list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRef {
    pub object: ObjectId,
    pub shard: usize,
}

/// State guarded by the page cache lock
#[derive(Debug, Default)]
pub struct CacheState {
    /// Live backing objects
    pub(crate) objects: BTreeMap<ObjectId, BackingObject>,
    /// Per-file object slots
    pub(crate) files: BTreeMap<FileId, FileSlots>,
    /// Unreferenced objects retaining resident pages, oldest first
    pub(crate) unused_objects: VecDeque<ObjectId>,
    /// Unmapped data-file shards, oldest first
    pub(crate) unused_shards: VecDeque<ShardRef>,
    /// Entries the eviction pass must process regardless of budget
    pub(crate) force_free: u32,
    /// Next object identifier
    next_object: u64,
}

impl CacheState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint an object identifier
    pub(crate) fn allocate_id(&mut self) -> ObjectId {
        self.next_object += 1;
        ObjectId(self.next_object)
    }

    pub fn object(&self, id: ObjectId) -> Option<&BackingObject> {
        self.objects.get(&id)
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut BackingObject> {
        self.objects.get_mut(&id)
    }

    pub fn descriptor(&self, id: ObjectId) -> Option<&BackingObjectDescriptor> {
        self.objects.get(&id)?.descriptor.as_ref()
    }

    pub fn descriptor_mut(&mut self, id: ObjectId) -> Option<&mut BackingObjectDescriptor> {
        self.objects.get_mut(&id)?.descriptor.as_mut()
    }

    /// Prototype entry of an object page
    pub fn prototype(&self, id: ObjectId, shard: usize, index: usize) -> Option<PrototypeEntry> {
        self.descriptor(id)?.entry(shard, index)
    }

    /// Replace a prototype entry
    pub fn set_prototype(&mut self, id: ObjectId, shard: usize, index: usize, entry: PrototypeEntry) {
        if let Some(slot) = self
            .descriptor_mut(id)
            .and_then(|d| d.entry_mut(shard, index))
        {
            *slot = entry;
        }
    }

    /// Entries counted against the eviction budget
    pub fn unused_count(&self) -> usize {
        self.unused_objects.len() + self.unused_shards.len()
    }

    /// Append an object to the unused list if absent
    pub(crate) fn insert_unused(&mut self, id: ObjectId) {
        if let Some(obj) = self.objects.get_mut(&id) {
            if !obj.on_unused {
                obj.on_unused = true;
                self.unused_objects.push_back(id);
            }
        }
    }

    /// Unlink an object from the unused list
    pub(crate) fn remove_unused(&mut self, id: ObjectId) {
        if let Some(obj) = self.objects.get_mut(&id) {
            if obj.on_unused {
                obj.on_unused = false;
                self.unused_objects.retain(|&o| o != id);
            }
        }
    }

    /// Append a shard to the unused shard list if absent
    pub(crate) fn insert_unused_shard(&mut self, shard_ref: ShardRef) {
        let Some(shard) = self
            .descriptor_mut(shard_ref.object)
            .and_then(|d| d.shards.get_mut(shard_ref.shard))
        else {
            return;
        };
        if !shard.on_unused {
            shard.on_unused = true;
            self.unused_shards.push_back(shard_ref);
        }
    }

    /// Unlink one shard from the unused shard list
    pub(crate) fn remove_unused_shard(&mut self, shard_ref: ShardRef) {
        let Some(shard) = self
            .descriptor_mut(shard_ref.object)
            .and_then(|d| d.shards.get_mut(shard_ref.shard))
        else {
            return;
        };
        if shard.on_unused {
            shard.on_unused = false;
            self.unused_shards.retain(|&r| r != shard_ref);
        }
    }

    /// Unlink every shard of an object from the unused shard list
    pub(crate) fn remove_unused_shards_of(&mut self, id: ObjectId) {
        self.unused_shards.retain(|r| r.object != id);
        if let Some(desc) = self.descriptor_mut(id) {
            for shard in &mut desc.shards {
                shard.on_unused = false;
            }
        }
    }

    /// Detach an object from its file's slot so lookups never find it again
    pub(crate) fn clear_backing_object(&mut self, id: ObjectId) {
        let Some(file) = self.objects.get(&id).and_then(|o| o.backing_file) else {
            return;
        };
        if let Some(slots) = self.files.get_mut(&file) {
            if slots.data == Some(id) {
                slots.data = None;
            }
            if slots.image == Some(id) {
                slots.image = None;
            }
            if slots.is_empty() {
                self.files.remove(&file);
            }
        }
        if let Some(obj) = self.objects.get_mut(&id) {
            obj.flags.insert(ObjectFlags::FILE_POINTER_CLEARED);
        }
    }
}

/// The page cache lock
pub type PageCacheLock = AuditedLock<CacheState>;

/// A held page cache lock
pub type CacheGuard<'a> = AuditedGuard<'a, CacheState>;

// ============================================================================
// Lifecycle Context
// ============================================================================

/// Shared state of one lifecycle manager
#[derive(Debug)]
pub struct LifecycleContext {
    /// The page cache lock and everything it guards
    pub(crate) cache: PageCacheLock,
    /// External collaborators
    pub(crate) collab: Collaborators,
    /// Tunables
    pub(crate) config: LifecycleConfig,
    /// Wait tokens for threads blocked on a deletion
    pub(crate) tokens: TokenZone,
    /// Deletions and swap resize requests for the worker
    pub(crate) deferred: DeferredQueue,
    /// Worker wake-up sources
    pub(crate) signals: WorkerSignals,
    /// Pulsed when the last in-flight modified write of a waited-on object ends
    pub(crate) io_complete: Event,
    /// Statistics
    pub(crate) stats: LifecycleStats,
}

impl LifecycleContext {
    pub fn new(config: LifecycleConfig, collab: Collaborators) -> Self {
        Self {
            cache: PageCacheLock::new("page cache", CacheState::new()),
            tokens: TokenZone::new("deletion wait tokens", config.wait_tokens),
            collab,
            config,
            deferred: DeferredQueue::new(),
            signals: WorkerSignals::new(),
            io_complete: Event::new(),
            stats: LifecycleStats::new(),
        }
    }

    /// Acquire the page cache lock
    pub(crate) fn lock(&self) -> CacheGuard<'_> {
        self.cache.lock()
    }

    /// Back off after contention or exhaustion
    pub(crate) fn short_delay(&self) {
        thread::sleep(self.config.short_delay);
    }

    /// Take a wait token, backing off until the zone has one
    ///
    /// Must be called without the page cache lock.
    pub(crate) fn allocate_token(&self) -> WaitToken {
        loop {
            if let Some(token) = self.tokens.try_allocate() {
                return token;
            }
            log::debug!("wait token zone exhausted, backing off");
            self.short_delay();
        }
    }

    /// Allocate a shard table, backing off until the pool has one
    ///
    /// Must be called without the page cache lock.
    pub(crate) fn allocate_shard_table(&self, entries: usize) -> PageFrame {
        loop {
            if let Some(table) = self.collab.pool.allocate_shard(entries) {
                return table;
            }
            log::debug!("prototype pool exhausted, backing off");
            self.short_delay();
        }
    }

    /// Make a shard table resident. A lock-drop point.
    pub(crate) fn make_shard_resident<'a>(
        &'a self,
        guard: CacheGuard<'a>,
        table: PageFrame,
    ) -> CacheGuard<'a> {
        if self.collab.pool.is_resident(table) {
            return guard;
        }
        self.stats.shard_faults.inc();
        let (guard, ()) = guard.unlocked(|| self.collab.pool.ensure_resident(table));
        guard
    }

    /// Detach a transition frame from its prototype entry
    ///
    /// Marks the frame deleted and drops the shard table's share. A frame
    /// nobody else references goes back to the free list with its swap
    /// reservation released. A referenced frame is freed by whoever drops
    /// the last reference. Lock held.
    pub(crate) fn free_transition_frame(&self, frame: PageFrame, table: PageFrame) {
        let frames = &self.collab.frames;
        frames.mark_deleted(frame);
        frames.decrement_share_count(table);

        if frames.reference_count(frame) == 0 && !frames.is_on_free_list(frame) {
            frames.unlink_from_list(frame);
            self.collab.swap.release_entry(frames.original_entry(frame));
            frames.insert_in_free_list(frame);
        }
    }

    /// Signal and clear the token of threads waiting for `id`. Lock held.
    pub(crate) fn wake_deletion_waiters(&self, state: &mut CacheState, id: ObjectId) {
        if let Some(token) = state
            .objects
            .get_mut(&id)
            .and_then(|o| o.wait_for_deletion.take())
        {
            self.tokens.signal(token);
        }
    }

    /// Unused cache is over budget
    pub(crate) fn unused_surplus(&self, state: &CacheState) -> bool {
        state.unused_count() > self.config.unused_budget
    }
}
