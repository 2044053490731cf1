//! Section Manager
//!
//! Based on Mach4 vm/vm_map.c and vm/memory_object.c
//!
//! The public surface of the lifecycle manager: opening sections over files
//! and swap, mapping and unmapping views, closing handles, forced closes,
//! swap resize requests, and the page ports the rest of the memory system
//! uses to fault pages in and reclaim them. Owns the dereference worker.

use std::panic;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::kern::lock::LockAudit;
use crate::section::collab::Collaborators;
use crate::section::config::LifecycleConfig;
use crate::section::context::{CacheGuard, LifecycleContext, ShardRef};
use crate::section::descriptor::{
    file_entry, pages_for_bytes, shard_layout, BackingObjectDescriptor, DescriptorKind, PageFrame,
    PageTableShard, PrototypeEntry, PAGE_SIZE,
};
use crate::section::error::{LifecycleError, LifecycleResult};
use crate::section::object::{BackingObject, FileId, ObjectFlags, ObjectId, ObjectInfo};
use crate::section::registry::{CheckOutcome, SlotKind};
use crate::section::stats::StatsSnapshot;
use crate::section::worker::{SwapResize, SwapResizeTicket};

// ============================================================================
// Handles and Options
// ============================================================================

/// A section reference; closing it consumes the handle
#[derive(Debug)]
#[must_use = "a section handle must be closed with close_handle"]
pub struct SectionHandle {
    object: ObjectId,
    user: bool,
    writable: bool,
}

impl SectionHandle {
    /// Backing object this section references
    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// Created on behalf of a user
    pub fn is_user(&self) -> bool {
        self.user
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

/// A mapped view; unmapping consumes the handle
#[derive(Debug)]
#[must_use = "a view handle must be unmapped"]
pub struct ViewHandle {
    object: ObjectId,
}

impl ViewHandle {
    pub fn object(&self) -> ObjectId {
        self.object
    }
}

/// Reason for `flush_image_section`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPurpose {
    /// The file is about to be deleted
    Delete,
    /// The file is about to be written
    Write,
}

/// Options for `open_file`
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    /// Open the image object instead of the data object
    pub image: bool,
    /// Count a user reference
    pub user: bool,
    /// Count a writable user reference
    pub writable: bool,
    /// Image with a shared writable subset to purge on last close
    pub global_memory: bool,
    /// File offset of page 0
    pub file_offset: u64,
    /// Entries per shard; the configured default when `None`
    pub shard_pages: Option<usize>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            image: false,
            user: true,
            writable: false,
            global_memory: false,
            file_offset: 0,
            shard_pages: None,
        }
    }
}

/// Options for `open_swap`
#[derive(Debug, Clone, Copy)]
pub struct SwapOptions {
    /// Charge every page against the commit limit up front
    pub commit: bool,
    /// Entries may stay valid until deletion
    pub large_pages: bool,
    pub user: bool,
    pub writable: bool,
    /// Entries per shard; the configured default when `None`
    pub shard_pages: Option<usize>,
}

impl Default for SwapOptions {
    fn default() -> Self {
        Self {
            commit: true,
            large_pages: false,
            user: true,
            writable: true,
            shard_pages: None,
        }
    }
}

// ============================================================================
// Worker Handle
// ============================================================================

#[derive(Debug)]
struct WorkerHandle {
    ctx: Arc<LifecycleContext>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    fn stop(&self) {
        self.ctx.signals.request_shutdown();
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            if let Err(payload) = thread.join() {
                log::error!("dereference worker died; deferred work was abandoned");
                if thread::panicking() {
                    std::process::abort();
                }
                panic::resume_unwind(payload);
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Section Manager
// ============================================================================

/// Lifecycle manager for shared backing-store objects
#[derive(Debug, Clone)]
pub struct SectionManager {
    ctx: Arc<LifecycleContext>,
    worker: Arc<WorkerHandle>,
}

impl SectionManager {
    /// Create a manager and start its dereference worker
    pub fn start(config: LifecycleConfig, collab: Collaborators) -> LifecycleResult<Self> {
        let mgr = Self::without_worker(config, collab)?;
        let ctx = mgr.ctx.clone();
        let thread = thread::Builder::new()
            .name("dereference-worker".into())
            .spawn(move || ctx.run_worker())
            .map_err(|e| LifecycleError::WorkerSpawn(e.to_string()))?;
        *mgr
            .worker
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(thread);
        Ok(mgr)
    }

    /// Create a manager whose deferred work runs only when drained
    /// explicitly with `drain_deferred` and `run_eviction_pass`
    pub fn without_worker(config: LifecycleConfig, collab: Collaborators) -> LifecycleResult<Self> {
        config.validate()?;
        let ctx = Arc::new(LifecycleContext::new(config, collab));
        log::info!("section manager created: {:?}", ctx.config);
        Ok(Self {
            worker: Arc::new(WorkerHandle {
                ctx: ctx.clone(),
                thread: Mutex::new(None),
            }),
            ctx,
        })
    }

    pub(crate) fn context(&self) -> &Arc<LifecycleContext> {
        &self.ctx
    }

    // ========================================================================
    // Opening
    // ========================================================================

    /// Open a section over a file, creating its backing object if needed
    ///
    /// An object being deleted is waited out and replaced by a fresh one.
    pub fn open_file(
        &self,
        file: FileId,
        size_bytes: u64,
        options: OpenOptions,
    ) -> LifecycleResult<SectionHandle> {
        let ctx = &self.ctx;
        let mut guard = ctx.lock();

        loop {
            let slot = guard.files.get(&file).and_then(|slots| {
                if options.image {
                    slots.image
                } else {
                    slots.data
                }
            });
            let Some(id) = slot else {
                break;
            };
            let Some(obj) = guard.objects.get_mut(&id) else {
                log::warn!("{:?} slot names missing {:?}", file, id);
                if let Some(slots) = guard.files.get_mut(&file) {
                    if options.image {
                        slots.image = None;
                    } else {
                        slots.data = None;
                    }
                }
                break;
            };

            if obj.is_being_deleted() {
                guard = ctx.wait_for_deletion(guard, id);
                continue;
            }
            if obj.is_being_created() {
                let (relocked, ()) = guard.unlocked(|| ctx.short_delay());
                guard = relocked;
                continue;
            }

            Self::add_section_reference(obj, options.user, options.writable);
            obj.accessed = true;
            guard.remove_unused(id);
            log::trace!("{:?} opened existing {:?}", file, id);
            return Ok(SectionHandle {
                object: id,
                user: options.user,
                writable: options.user && options.writable,
            });
        }

        let id = guard.allocate_id();
        let mut flags = ObjectFlags::empty();
        if options.image {
            flags.insert(ObjectFlags::IMAGE);
            if options.global_memory {
                flags.insert(ObjectFlags::GLOBAL_MEMORY);
            }
        }
        let mut obj = BackingObject::new(id, Some(file), flags);
        obj.section_references = 0;
        Self::add_section_reference(&mut obj, options.user, options.writable);
        guard.objects.insert(id, obj);
        let slots = guard.files.entry(file).or_default();
        if options.image {
            slots.image = Some(id);
        } else {
            slots.data = Some(id);
        }
        drop(guard);

        let kind = if options.image {
            DescriptorKind::Image
        } else {
            DescriptorKind::DataFile
        };
        let pages = pages_for_bytes(size_bytes);
        let shard_pages = self.shard_pages(options.shard_pages);
        let shards = self.build_shards(pages, shard_pages, file_entry(options.file_offset));
        let descriptor = BackingObjectDescriptor {
            kind,
            shards,
            committed_pages: 0,
            commit_charge: None,
            size_bytes,
            file_offset: options.file_offset,
            large_pages: false,
        };

        self.finish_creation(id, descriptor);
        log::debug!("{:?} created for {:?}, {} pages", id, file, pages);
        Ok(SectionHandle {
            object: id,
            user: options.user,
            writable: options.user && options.writable,
        })
    }

    /// Create anonymous swap-backed memory
    pub fn open_swap(&self, pages: u64, options: SwapOptions) -> LifecycleResult<SectionHandle> {
        let ctx = &self.ctx;
        let commit_charge = if options.commit {
            let guard = ctx.lock();
            let charge = ctx.collab.swap.reserve(pages);
            drop(guard);
            Some(charge.ok_or(LifecycleError::CommitLimit(pages))?)
        } else {
            None
        };

        let shard_pages = self.shard_pages(options.shard_pages);
        let shards = self.build_shards(pages, shard_pages, |_| PrototypeEntry::Absent);
        let descriptor = BackingObjectDescriptor {
            kind: DescriptorKind::Swap,
            shards,
            committed_pages: if options.commit { pages } else { 0 },
            commit_charge,
            size_bytes: pages * PAGE_SIZE,
            file_offset: 0,
            large_pages: options.large_pages,
        };

        let mut guard = ctx.lock();
        let id = guard.allocate_id();
        let mut obj = BackingObject::new(id, None, ObjectFlags::empty());
        obj.section_references = 0;
        Self::add_section_reference(&mut obj, options.user, options.writable);
        obj.descriptor = Some(descriptor);
        obj.complete_creation();
        guard.objects.insert(id, obj);
        drop(guard);

        ctx.stats.objects_created.inc();
        log::debug!("{:?} created as swap, {} pages", id, pages);
        Ok(SectionHandle {
            object: id,
            user: options.user,
            writable: options.user && options.writable,
        })
    }

    /// Open another section on the object behind `handle`
    pub fn share(&self, handle: &SectionHandle, user: bool) -> LifecycleResult<SectionHandle> {
        let mut guard = self.ctx.lock();
        let id = handle.object;
        let obj = Self::live_object(&mut guard, id)?;
        Self::add_section_reference(obj, user, false);
        obj.accessed = true;
        Ok(SectionHandle {
            object: id,
            user,
            writable: false,
        })
    }

    /// Close a section handle
    pub fn close_handle(&self, handle: SectionHandle) {
        self.ctx.release_section(
            handle.object,
            u32::from(handle.user),
            u32::from(handle.writable),
        );
    }

    /// Drop one section reference and `user_references` user references
    /// held outside a `SectionHandle`
    pub fn release_section_reference(&self, id: ObjectId, user_references: u32) {
        self.ctx.release_section_reference(id, user_references);
    }

    fn add_section_reference(obj: &mut BackingObject, user: bool, writable: bool) {
        obj.section_references += 1;
        if user {
            obj.user_references += 1;
            if writable {
                obj.writable_user_references += 1;
            }
        }
    }

    fn live_object<'g>(
        guard: &'g mut CacheGuard<'_>,
        id: ObjectId,
    ) -> LifecycleResult<&'g mut BackingObject> {
        let obj = guard
            .objects
            .get_mut(&id)
            .ok_or(LifecycleError::UnknownObject(id))?;
        if !obj.accepts_references() {
            return Err(LifecycleError::ObjectUnavailable(id));
        }
        Ok(obj)
    }

    fn shard_pages(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.ctx.config.shard_pages).max(1)
    }

    /// Allocate shard storage for a new descriptor, lock not held
    fn build_shards(
        &self,
        pages: u64,
        shard_pages: usize,
        initial: impl Fn(u64) -> PrototypeEntry,
    ) -> Vec<PageTableShard> {
        shard_layout(pages, shard_pages)
            .into_iter()
            .map(|(first, count)| {
                let table = self.ctx.allocate_shard_table(count);
                PageTableShard::new(table, first, count, &initial)
            })
            .collect()
    }

    fn finish_creation(&self, id: ObjectId, descriptor: BackingObjectDescriptor) {
        let mut guard = self.ctx.lock();
        if let Some(obj) = guard.objects.get_mut(&id) {
            obj.descriptor = Some(descriptor);
            obj.complete_creation();
        }
        drop(guard);
        self.ctx.stats.objects_created.inc();
    }

    // ========================================================================
    // Views
    // ========================================================================

    /// Map a view of the whole object
    ///
    /// Severed shards get fresh storage before the view is counted.
    pub fn map(&self, handle: &SectionHandle) -> LifecycleResult<ViewHandle> {
        let ctx = &self.ctx;
        let id = handle.object;
        let mut guard = ctx.lock();

        loop {
            let obj = Self::live_object(&mut guard, id)?;
            let severed: Vec<usize> = obj
                .descriptor
                .as_ref()
                .map(|d| {
                    d.shards
                        .iter()
                        .filter(|s| s.is_severed())
                        .map(|s| s.pages)
                        .collect()
                })
                .unwrap_or_default();
            if severed.is_empty() {
                break;
            }

            let (relocked, tables) = guard.unlocked(|| {
                severed
                    .iter()
                    .map(|&pages| ctx.allocate_shard_table(pages))
                    .collect::<Vec<PageFrame>>()
            });
            guard = relocked;

            let mut tables = tables.into_iter();
            if let Some(desc) = guard.descriptor_mut(id) {
                let initial = file_entry(desc.file_offset);
                let kind = desc.kind;
                for shard in desc.shards.iter_mut().filter(|s| s.is_severed()) {
                    let Some(table) = tables.next() else {
                        break;
                    };
                    if kind == DescriptorKind::Swap {
                        shard.restore(table, |_| PrototypeEntry::Absent);
                    } else {
                        shard.restore(table, &initial);
                    }
                }
            }
            for table in tables {
                ctx.collab.pool.free_shard(table);
            }
        }

        let obj = Self::live_object(&mut guard, id)?;
        obj.mapped_views += 1;
        obj.accessed = true;
        let mut unlinked = Vec::new();
        if let Some(desc) = obj.descriptor.as_mut() {
            for (index, shard) in desc.shards.iter_mut().enumerate() {
                shard.mapped_views += 1;
                shard.accessed = true;
                if shard.on_unused {
                    unlinked.push(ShardRef {
                        object: id,
                        shard: index,
                    });
                }
            }
        }
        for shard_ref in unlinked {
            guard.remove_unused_shard(shard_ref);
        }
        guard.remove_unused(id);

        Ok(ViewHandle { object: id })
    }

    /// Unmap a view; data-file shards left unmapped join the unused list
    pub fn unmap(&self, view: ViewHandle) {
        let id = view.object;
        let mut guard = self.ctx.lock();
        let Some(obj) = guard.objects.get_mut(&id) else {
            log::warn!("unmap of unknown {:?}", id);
            return;
        };
        BackingObject::decrement(&mut obj.mapped_views, id, "mapped views");
        let deleting = obj.is_being_deleted();

        let mut unused = Vec::new();
        if let Some(desc) = obj.descriptor.as_mut() {
            let data = desc.kind == DescriptorKind::DataFile;
            for (index, shard) in desc.shards.iter_mut().enumerate() {
                BackingObject::decrement(&mut shard.mapped_views, id, "shard views");
                if data && !deleting && shard.mapped_views == 0 && !shard.is_severed() {
                    unused.push(ShardRef {
                        object: id,
                        shard: index,
                    });
                }
            }
        }
        for shard_ref in unused {
            guard.insert_unused_shard(shard_ref);
        }

        self.ctx.evaluate(guard, id);
    }

    // ========================================================================
    // Forced Close and Trimming
    // ========================================================================

    /// Flush and delete every object of `file` unless one is referenced
    ///
    /// With `delay_close`, a referenced object is marked to be deleted on
    /// its last close instead. Returns true once the file has no objects.
    pub fn force_close(&self, file: FileId, delay_close: bool) -> bool {
        self.close_slot(SlotKind::Both, file, delay_close)
    }

    /// Flush and delete the image object of `file` unless it is in use
    ///
    /// Before a delete the data object must also be free of user mappings.
    /// Returns true once the file has no image object.
    pub fn flush_image_section(&self, file: FileId, purpose: FlushPurpose) -> bool {
        if purpose == FlushPurpose::Delete {
            let guard = self.ctx.lock();
            let data_in_use = guard
                .files
                .get(&file)
                .and_then(|s| s.data)
                .and_then(|id| guard.object(id))
                .is_some_and(|o| o.user_references != 0 || o.is_being_created());
            if data_in_use {
                log::debug!("{:?} image flush refused, data mapped", file);
                return false;
            }
        }
        self.close_slot(SlotKind::Image, file, false)
    }

    fn close_slot(&self, kind: SlotKind, file: FileId, delay_close: bool) -> bool {
        let ctx = &self.ctx;
        loop {
            match ctx.check_or_wait(kind, file, delay_close) {
                CheckOutcome::Busy => return false,
                CheckOutcome::Gone => {}
                CheckOutcome::Acquired(mut guard, id) => {
                    if let Some(obj) = guard.objects.get_mut(&id) {
                        obj.begin_deletion();
                        obj.mapped_views = 1;
                    }
                    guard.remove_unused(id);
                    guard.remove_unused_shards_of(id);
                    drop(guard);
                    log::debug!("{:?} force-closing {:?}", file, id);
                    ctx.clean(id, true);
                }
            }

            let guard = ctx.lock();
            if LifecycleContext::slot_object(&guard, kind, file).is_none() {
                return true;
            }
        }
    }

    /// Evict at least `count` unused entries regardless of budget
    pub fn trim_unused(&self, count: u32) {
        self.ctx.lock().force_free = count;
        self.ctx.signals.set_cleanup();
    }

    /// Queue a swap resize; positive grows, negative contracts
    pub fn request_swap_resize(&self, delta_pages: i64) -> SwapResizeTicket {
        let resize = if delta_pages >= 0 {
            SwapResize::Grow(delta_pages.unsigned_abs())
        } else {
            SwapResize::Contract(delta_pages.unsigned_abs())
        };
        self.ctx.queue_swap_resize(resize)
    }

    // ========================================================================
    // Page Ports
    // ========================================================================

    /// Make a page resident, optionally dirtying it
    pub fn fault_in_page(&self, id: ObjectId, page: u64, write: bool) -> LifecycleResult<PageFrame> {
        let ctx = &self.ctx;
        let frames = &ctx.collab.frames;
        let mut guard = ctx.lock();

        let (shard, index, table) = loop {
            let obj = Self::live_object(&mut guard, id)?;
            let desc = obj
                .descriptor
                .as_ref()
                .ok_or(LifecycleError::ObjectUnavailable(id))?;
            let (shard, index) = desc
                .locate(page)
                .ok_or(LifecycleError::PageOutOfRange { object: id, page })?;
            let table = desc.shards[shard]
                .table
                .ok_or(LifecycleError::NotMapped { object: id, page })?;
            if ctx.collab.pool.is_resident(table) {
                break (shard, index, table);
            }
            guard = ctx.make_shard_resident(guard, table);
        };

        let Some(obj) = guard.objects.get_mut(&id) else {
            return Err(LifecycleError::UnknownObject(id));
        };
        obj.accessed = true;
        let Some(desc) = obj.descriptor.as_mut() else {
            return Err(LifecycleError::ObjectUnavailable(id));
        };
        let large_pages = desc.large_pages;
        desc.shards[shard].accessed = true;
        let Some(entry) = desc.entry_mut(shard, index) else {
            return Err(LifecycleError::NotMapped { object: id, page });
        };

        let frame = match *entry {
            PrototypeEntry::Transition(frame) | PrototypeEntry::Valid(frame) => frame,
            original => {
                let frame = frames
                    .allocate(original, table)
                    .ok_or(LifecycleError::OutOfFrames)?;
                if large_pages {
                    frames.increment_share_count(frame);
                    *entry = PrototypeEntry::Valid(frame);
                } else {
                    *entry = PrototypeEntry::Transition(frame);
                }
                obj.resident_page_references += 1;
                frame
            }
        };
        if write {
            frames.set_modified(frame, true);
        }
        Ok(frame)
    }

    /// Reclaim one resident page as the working-set trimmer would
    ///
    /// Clean pages drop back to their original backing. Dirty swap pages
    /// keep or get a swap slot. Dirty file pages and referenced frames are
    /// left alone. Returns true if the frame was freed.
    pub fn release_resident_page(&self, id: ObjectId, page: u64) -> LifecycleResult<bool> {
        let ctx = &self.ctx;
        let frames = &ctx.collab.frames;
        let mut guard = ctx.lock();

        let obj = guard
            .objects
            .get_mut(&id)
            .ok_or(LifecycleError::UnknownObject(id))?;
        if obj.is_being_deleted() {
            return Ok(false);
        }
        let Some(desc) = obj.descriptor.as_mut() else {
            return Ok(false);
        };
        let (shard, index) = desc
            .locate(page)
            .ok_or(LifecycleError::PageOutOfRange { object: id, page })?;
        let kind = desc.kind;
        let Some(table) = desc.shards[shard].table else {
            return Ok(false);
        };
        let Some(entry) = desc.entry_mut(shard, index) else {
            return Ok(false);
        };
        let PrototypeEntry::Transition(frame) = *entry else {
            return Ok(false);
        };
        if frames.reference_count(frame) != 0 {
            return Ok(false);
        }

        let original = frames.original_entry(frame);
        let backing = if !frames.is_modified(frame) {
            original
        } else if kind == DescriptorKind::Swap {
            match original {
                PrototypeEntry::SwapBacked(slot) => PrototypeEntry::SwapBacked(slot),
                _ => match ctx.collab.swap.allocate_slot() {
                    Some(slot) => PrototypeEntry::SwapBacked(slot),
                    None => return Ok(false),
                },
            }
        } else {
            return Ok(false);
        };

        frames.unlink_from_list(frame);
        frames.decrement_share_count(table);
        frames.insert_in_free_list(frame);
        *entry = backing;
        BackingObject::decrement(&mut obj.resident_page_references, id, "resident pages");

        ctx.check_for_deletion(&mut guard, id);
        Ok(true)
    }

    /// Register a modified page write; false once writes are blocked
    pub fn begin_modified_write(&self, id: ObjectId) -> LifecycleResult<bool> {
        let mut guard = self.ctx.lock();
        let obj = guard
            .objects
            .get_mut(&id)
            .ok_or(LifecycleError::UnknownObject(id))?;
        if obj.is_being_deleted() || obj.flags.contains(ObjectFlags::NO_MODIFIED_WRITING) {
            return Ok(false);
        }
        obj.modified_writes += 1;
        Ok(true)
    }

    /// Complete a modified page write, waking a cleaner waiting on it
    pub fn end_modified_write(&self, id: ObjectId) {
        let mut guard = self.ctx.lock();
        let Some(obj) = guard.objects.get_mut(&id) else {
            log::warn!("modified write completed on unknown {:?}", id);
            return;
        };
        BackingObject::decrement(&mut obj.modified_writes, id, "modified writes");
        if obj.modified_writes == 0 && obj.flags.contains(ObjectFlags::WAITING_FOR_WRITES) {
            obj.flags.remove(ObjectFlags::WAITING_FOR_WRITES);
            self.ctx.io_complete.pulse();
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Writable user sections on the file's data object
    pub fn writable_user_references(&self, file: FileId) -> u32 {
        let guard = self.ctx.lock();
        guard
            .files
            .get(&file)
            .and_then(|s| s.data)
            .and_then(|id| guard.object(id))
            .map_or(0, |o| o.writable_user_references)
    }

    /// A file may shrink to `new_size` without cutting off a mapped image
    /// or a user-visible data mapping
    pub fn can_file_be_truncated(&self, file: FileId, new_size: u64) -> bool {
        let guard = self.ctx.lock();
        let Some(slots) = guard.files.get(&file) else {
            return true;
        };
        if let Some(image) = slots.image.and_then(|id| guard.object(id)) {
            if !image.is_unreferenced() {
                return false;
            }
        }
        if let Some(data) = slots.data.and_then(|id| guard.object(id)) {
            let in_use = data.user_references > 0 || data.mapped_views > 0;
            let size = data.descriptor.as_ref().map_or(0, |d| d.size_bytes);
            if in_use && new_size < size {
                return false;
            }
        }
        true
    }

    /// Files whose objects sit on the unused list
    pub fn unused_files(&self) -> Vec<FileId> {
        let guard = self.ctx.lock();
        let mut files: Vec<FileId> = guard
            .unused_objects
            .iter()
            .filter_map(|id| guard.object(*id)?.backing_file)
            .collect();
        files.sort();
        files.dedup();
        files
    }

    pub fn object_info(&self, id: ObjectId) -> Option<ObjectInfo> {
        self.ctx.lock().object(id).map(ObjectInfo::from)
    }

    /// Object in the file's data or image slot
    pub fn object_for(&self, file: FileId, image: bool) -> Option<ObjectId> {
        let guard = self.ctx.lock();
        let slots = guard.files.get(&file)?;
        if image {
            slots.image
        } else {
            slots.data
        }
    }

    /// Table frame of a shard, `None` once severed
    pub fn shard_table(&self, id: ObjectId, shard: usize) -> Option<PageFrame> {
        self.ctx.lock().descriptor(id)?.shards.get(shard)?.table
    }

    /// Unused objects plus unused shards
    pub fn unused_count(&self) -> usize {
        self.ctx.lock().unused_count()
    }

    /// Deferred requests not yet served
    pub fn deferred_len(&self) -> usize {
        self.ctx.deferred.len()
    }

    /// Wait tokens currently handed out
    pub fn wait_tokens_in_use(&self) -> u32 {
        self.ctx.tokens.in_use()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    pub fn lock_audit(&self) -> LockAudit {
        self.ctx.cache.audit()
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.ctx.config
    }

    // ========================================================================
    // Worker Control
    // ========================================================================

    /// Serve queued deletions and resizes on the calling thread
    pub fn drain_deferred(&self) -> usize {
        self.ctx.drain_deferred()
    }

    /// Run one eviction pass on the calling thread
    pub fn run_eviction_pass(&self) {
        self.ctx.eviction_pass();
    }

    /// Wait until the worker has nothing pending
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.ctx.signals.wait_idle(timeout)
    }

    /// Stop the worker; later deferred work must be drained explicitly
    ///
    /// A worker that died re-raises its panic here.
    pub fn shutdown(&self) {
        self.worker.stop();
    }
}
