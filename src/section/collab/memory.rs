//! In-memory collaborators
//!
//! A page frame table doubling as the prototype pool, a swap allocator with
//! commit accounting, a file layer that records every write and can inject
//! failures, and trivial trimmer and purger implementations. Each keeps the
//! accounting needed to prove that nothing was freed twice or leaked.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::section::collab::{
    CacheTrimmer, CommitCharge, Collaborators, FileIo, ImagePurger, PageFrameDatabase,
    PrototypePool, SwapAllocator,
};
use crate::section::descriptor::{PageFrame, PrototypeEntry, SwapSlot, PAGE_SIZE};
use crate::section::error::IoStatus;
use crate::section::object::{FileId, ObjectId};

// ============================================================================
// Page Frame Table
// ============================================================================

/// List a frame is linked on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameList {
    Free,
    Standby,
    Modified,
    /// Owned by a write, a shard table or in flight
    Detached,
}

#[derive(Debug, Clone)]
struct FrameRecord {
    list: FrameList,
    reference_count: u32,
    share_count: u32,
    deleted: bool,
    modified: bool,
    locked_charges: u32,
    original: PrototypeEntry,
    /// Shard table frame this frame is charged to
    table: Option<PageFrame>,
    /// Frame holds a shard table
    is_table: bool,
    /// Shard table paged out of the pool
    paged_out: bool,
}

impl FrameRecord {
    fn free() -> Self {
        Self {
            list: FrameList::Free,
            reference_count: 0,
            share_count: 0,
            deleted: false,
            modified: false,
            locked_charges: 0,
            original: PrototypeEntry::Absent,
            table: None,
            is_table: false,
            paged_out: false,
        }
    }
}

#[derive(Debug)]
struct FrameTable {
    frames: Vec<FrameRecord>,
    free: VecDeque<u32>,
}

impl FrameTable {
    fn record(&mut self, frame: PageFrame) -> &mut FrameRecord {
        &mut self.frames[frame.0 as usize]
    }

    fn pop_free(&mut self) -> Option<PageFrame> {
        self.free.pop_front().map(PageFrame)
    }

    fn push_free(&mut self, frame: PageFrame) -> bool {
        let record = self.record(frame);
        if record.list == FrameList::Free {
            return false;
        }
        *record = FrameRecord::free();
        self.free.push_back(frame.0);
        true
    }
}

/// Page frame database and prototype pool over a fixed frame table
#[derive(Debug)]
pub struct MemoryPageCache {
    table: Mutex<FrameTable>,
    /// Receives the original backing of frames freed on their last reference
    swap: Arc<MemorySwap>,
    page_ins: AtomicU64,
    double_frees: AtomicU64,
    share_underflows: AtomicU64,
    table_leaks: AtomicU64,
}

impl MemoryPageCache {
    /// Create a table of `frames` free frames backed by `swap`
    pub fn new(frames: usize, swap: Arc<MemorySwap>) -> Self {
        Self {
            table: Mutex::new(FrameTable {
                frames: vec![FrameRecord::free(); frames],
                free: (0..frames as u32).collect(),
            }),
            swap,
            page_ins: AtomicU64::new(0),
            double_frees: AtomicU64::new(0),
            share_underflows: AtomicU64::new(0),
            table_leaks: AtomicU64::new(0),
        }
    }

    /// Take a transient reference, as an in-flight read would
    pub fn hold(&self, frame: PageFrame) {
        let mut table = self.table.lock();
        let record = table.record(frame);
        record.reference_count += 1;
        if matches!(record.list, FrameList::Standby | FrameList::Modified) {
            record.list = FrameList::Detached;
        }
    }

    /// Drop a transient reference
    ///
    /// A deleted frame with no references left is freed together with the
    /// swap slot of its original entry. A live frame goes back on its list.
    pub fn unhold(&self, frame: PageFrame) {
        let mut table = self.table.lock();
        let record = table.record(frame);
        record.reference_count = record.reference_count.saturating_sub(1);
        if record.reference_count != 0
            || record.locked_charges != 0
            || record.list != FrameList::Detached
        {
            return;
        }
        if record.deleted {
            let original = record.original;
            table.push_free(frame);
            drop(table);
            self.swap.release_entry(original);
        } else {
            record.list = if record.modified {
                FrameList::Modified
            } else {
                FrameList::Standby
            };
        }
    }

    /// Page a shard table out of the pool; refused while it pins frames
    pub fn page_out(&self, table_frame: PageFrame) -> bool {
        let mut table = self.table.lock();
        let record = table.record(table_frame);
        if !record.is_table || record.share_count != 0 {
            return false;
        }
        record.paged_out = true;
        true
    }

    /// Free frames
    pub fn free_frames(&self) -> usize {
        self.table.lock().free.len()
    }

    /// Frames holding object pages (not shard tables)
    pub fn resident_pages(&self) -> usize {
        self.table
            .lock()
            .frames
            .iter()
            .filter(|r| r.list != FrameList::Free && !r.is_table)
            .count()
    }

    /// Frames holding shard tables
    pub fn shard_tables(&self) -> usize {
        self.table
            .lock()
            .frames
            .iter()
            .filter(|r| r.list != FrameList::Free && r.is_table)
            .count()
    }

    /// Outstanding transient references across all frames
    pub fn outstanding_references(&self) -> u64 {
        self.table
            .lock()
            .frames
            .iter()
            .map(|r| r.reference_count as u64)
            .sum()
    }

    /// Outstanding locked charges across all frames
    pub fn locked_charges(&self) -> u64 {
        self.table
            .lock()
            .frames
            .iter()
            .map(|r| r.locked_charges as u64)
            .sum()
    }

    /// List a frame is on
    pub fn list_of(&self, frame: PageFrame) -> FrameList {
        self.table.lock().record(frame).list
    }

    /// Shard tables faulted back in
    pub fn page_ins(&self) -> u64 {
        self.page_ins.load(Ordering::Relaxed)
    }

    /// Frames freed while already free
    pub fn double_frees(&self) -> u64 {
        self.double_frees.load(Ordering::Relaxed)
    }

    /// Share counts decremented below zero
    pub fn share_underflows(&self) -> u64 {
        self.share_underflows.load(Ordering::Relaxed)
    }

    /// Shard tables freed while still pinning frames
    pub fn table_leaks(&self) -> u64 {
        self.table_leaks.load(Ordering::Relaxed)
    }
}

impl PageFrameDatabase for MemoryPageCache {
    fn allocate(&self, original: PrototypeEntry, table_frame: PageFrame) -> Option<PageFrame> {
        let mut table = self.table.lock();
        let frame = table.pop_free()?;
        *table.record(frame) = FrameRecord {
            list: FrameList::Standby,
            original,
            table: Some(table_frame),
            ..FrameRecord::free()
        };
        table.record(table_frame).share_count += 1;
        Some(frame)
    }

    fn mark_deleted(&self, frame: PageFrame) {
        self.table.lock().record(frame).deleted = true;
    }

    fn is_deleted(&self, frame: PageFrame) -> bool {
        self.table.lock().record(frame).deleted
    }

    fn increment_share_count(&self, frame: PageFrame) {
        self.table.lock().record(frame).share_count += 1;
    }

    fn decrement_share_count(&self, frame: PageFrame) {
        let mut table = self.table.lock();
        let record = table.record(frame);
        match record.share_count.checked_sub(1) {
            Some(count) => record.share_count = count,
            None => {
                self.share_underflows.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn share_count(&self, frame: PageFrame) -> u32 {
        self.table.lock().record(frame).share_count
    }

    fn reference_count(&self, frame: PageFrame) -> u32 {
        let mut table = self.table.lock();
        let record = table.record(frame);
        record.reference_count + record.locked_charges
    }

    fn is_on_free_list(&self, frame: PageFrame) -> bool {
        self.table.lock().record(frame).list == FrameList::Free
    }

    fn unlink_from_list(&self, frame: PageFrame) {
        let mut table = self.table.lock();
        let record = table.record(frame);
        if record.list != FrameList::Free {
            record.list = FrameList::Detached;
        }
    }

    fn insert_in_free_list(&self, frame: PageFrame) {
        if !self.table.lock().push_free(frame) {
            self.double_frees.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn insert_in_standby_list(&self, frame: PageFrame) {
        let mut table = self.table.lock();
        let record = table.record(frame);
        record.list = if record.modified {
            FrameList::Modified
        } else {
            FrameList::Standby
        };
    }

    fn is_modified(&self, frame: PageFrame) -> bool {
        self.table.lock().record(frame).modified
    }

    fn set_modified(&self, frame: PageFrame, modified: bool) {
        let mut table = self.table.lock();
        let record = table.record(frame);
        record.modified = modified;
        record.list = match (record.list, modified) {
            (FrameList::Standby, true) => FrameList::Modified,
            (FrameList::Modified, false) => FrameList::Standby,
            (list, _) => list,
        };
    }

    fn add_locked_charge(&self, frame: PageFrame) {
        self.table.lock().record(frame).locked_charges += 1;
    }

    fn remove_locked_charge(&self, frame: PageFrame) {
        let mut table = self.table.lock();
        let record = table.record(frame);
        record.locked_charges = record.locked_charges.saturating_sub(1);
    }

    fn original_entry(&self, frame: PageFrame) -> PrototypeEntry {
        self.table.lock().record(frame).original
    }
}

impl PrototypePool for MemoryPageCache {
    fn allocate_shard(&self, _entries: usize) -> Option<PageFrame> {
        let mut table = self.table.lock();
        let frame = table.pop_free()?;
        *table.record(frame) = FrameRecord {
            list: FrameList::Detached,
            is_table: true,
            ..FrameRecord::free()
        };
        Some(frame)
    }

    fn free_shard(&self, table_frame: PageFrame) {
        let mut table = self.table.lock();
        if table.record(table_frame).share_count != 0 {
            self.table_leaks.fetch_add(1, Ordering::Relaxed);
        }
        if !table.push_free(table_frame) {
            self.double_frees.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn is_resident(&self, table_frame: PageFrame) -> bool {
        !self.table.lock().record(table_frame).paged_out
    }

    fn ensure_resident(&self, table_frame: PageFrame) {
        let mut table = self.table.lock();
        let record = table.record(table_frame);
        if record.paged_out {
            record.paged_out = false;
            self.page_ins.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ============================================================================
// Swap
// ============================================================================

#[derive(Debug)]
struct SwapState {
    commit_limit: u64,
    committed: u64,
    size_pages: u64,
    used: BTreeSet<u32>,
    recycled: Vec<u32>,
    next_slot: u32,
    contract_allowed: bool,
}

/// Swap allocator with commit accounting
#[derive(Debug)]
pub struct MemorySwap {
    state: Mutex<SwapState>,
    double_frees: AtomicU64,
    grows: AtomicU32,
    contracts: AtomicU32,
}

impl MemorySwap {
    /// Create a swap file of `size_pages` slots and an equal commit limit
    pub fn new(size_pages: u64) -> Self {
        Self {
            state: Mutex::new(SwapState {
                commit_limit: size_pages,
                committed: 0,
                size_pages,
                used: BTreeSet::new(),
                recycled: Vec::new(),
                next_slot: 0,
                contract_allowed: true,
            }),
            double_frees: AtomicU64::new(0),
            grows: AtomicU32::new(0),
            contracts: AtomicU32::new(0),
        }
    }

    /// Pages currently committed
    pub fn committed(&self) -> u64 {
        self.state.lock().committed
    }

    /// Slots currently allocated
    pub fn slots_in_use(&self) -> usize {
        self.state.lock().used.len()
    }

    /// Current swap size in pages
    pub fn size_pages(&self) -> u64 {
        self.state.lock().size_pages
    }

    /// Slots released while not allocated
    pub fn double_frees(&self) -> u64 {
        self.double_frees.load(Ordering::Relaxed)
    }

    /// Successful grow requests
    pub fn grows(&self) -> u32 {
        self.grows.load(Ordering::Relaxed)
    }

    /// Successful contract requests
    pub fn contracts(&self) -> u32 {
        self.contracts.load(Ordering::Relaxed)
    }

    /// Allow or refuse contraction
    pub fn set_contract_allowed(&self, allowed: bool) {
        self.state.lock().contract_allowed = allowed;
    }
}

impl SwapAllocator for MemorySwap {
    fn reserve(&self, pages: u64) -> Option<CommitCharge> {
        let mut state = self.state.lock();
        if state.committed + pages > state.commit_limit {
            return None;
        }
        state.committed += pages;
        Some(CommitCharge::new(pages))
    }

    fn release(&self, charge: CommitCharge) {
        let mut state = self.state.lock();
        state.committed = state.committed.saturating_sub(charge.pages());
    }

    fn allocate_slot(&self) -> Option<SwapSlot> {
        let mut state = self.state.lock();
        if state.used.len() as u64 >= state.size_pages {
            return None;
        }
        let slot = match state.recycled.pop() {
            Some(slot) => slot,
            None => {
                let slot = state.next_slot;
                state.next_slot += 1;
                slot
            }
        };
        state.used.insert(slot);
        Some(SwapSlot(slot))
    }

    fn release_slot(&self, slot: SwapSlot) {
        let mut state = self.state.lock();
        if state.used.remove(&slot.0) {
            state.recycled.push(slot.0);
        } else {
            self.double_frees.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn grow(&self, pages: u64) -> bool {
        let mut state = self.state.lock();
        state.size_pages += pages;
        state.commit_limit += pages;
        self.grows.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn contract(&self, pages: u64) -> bool {
        let mut state = self.state.lock();
        let in_use = (state.used.len() as u64).max(state.committed);
        if !state.contract_allowed || state.size_pages < pages + in_use {
            return false;
        }
        state.size_pages -= pages;
        state.commit_limit = state.commit_limit.saturating_sub(pages);
        self.contracts.fetch_add(1, Ordering::Relaxed);
        true
    }
}

// ============================================================================
// Files
// ============================================================================

/// One write issued to the file layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    pub file: FileId,
    pub offset: u64,
    pub pages: usize,
    pub bytes: u64,
    pub status: IoStatus,
}

/// Called on every write before the status is decided
pub type WriteHook = Arc<dyn Fn(FileId, u64) + Send + Sync>;

#[derive(Debug, Default)]
struct FileState {
    writes: Vec<WriteRecord>,
    scripted: VecDeque<IoStatus>,
    flush_scripted: VecDeque<IoStatus>,
    max_good_cluster: Option<usize>,
    remote: BTreeSet<FileId>,
    flushes_held: u32,
}

/// File layer that records writes and injects failures
#[derive(Default)]
pub struct MemoryFiles {
    state: Mutex<FileState>,
    hook: Mutex<Option<WriteHook>>,
}

impl std::fmt::Debug for MemoryFiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryFiles")
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl MemoryFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return these statuses for the next writes, in order
    pub fn script_writes(&self, statuses: impl IntoIterator<Item = IoStatus>) {
        self.state.lock().scripted.extend(statuses);
    }

    /// Return these statuses for the next flush acquisitions, in order
    pub fn script_flushes(&self, statuses: impl IntoIterator<Item = IoStatus>) {
        self.state.lock().flush_scripted.extend(statuses);
    }

    /// Fail every write longer than `pages` with `WriteInProgress`
    pub fn fail_clusters_above(&self, pages: usize) {
        self.state.lock().max_good_cluster = Some(pages);
    }

    /// Treat `file` as living on a network redirector
    pub fn set_remote(&self, file: FileId) {
        self.state.lock().remote.insert(file);
    }

    pub fn set_write_hook(&self, hook: WriteHook) {
        *self.hook.lock() = Some(hook);
    }

    pub fn clear_write_hook(&self) {
        self.hook.lock().take();
    }

    /// Every write issued so far
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    /// Page offsets of `file` written successfully
    pub fn pages_written(&self, file: FileId) -> BTreeSet<u64> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|w| w.file == file && w.status.is_success())
            .flat_map(|w| (0..w.pages as u64).map(move |i| w.offset + i * PAGE_SIZE))
            .collect()
    }

    /// Flush acquisitions not yet released
    pub fn flushes_held(&self) -> u32 {
        self.state.lock().flushes_held
    }
}

impl FileIo for MemoryFiles {
    fn write(&self, file: FileId, frames: &[PageFrame], offset: u64, bytes: u64) -> IoStatus {
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(file, offset);
        }

        let mut state = self.state.lock();
        let status = match state.scripted.pop_front() {
            Some(status) => status,
            None => match state.max_good_cluster {
                Some(max) if frames.len() > max => IoStatus::WriteInProgress,
                _ => IoStatus::Success,
            },
        };
        state.writes.push(WriteRecord {
            file,
            offset,
            pages: frames.len(),
            bytes,
            status,
        });
        status
    }

    fn acquire_for_flush(&self, _file: FileId) -> IoStatus {
        let mut state = self.state.lock();
        let status = state.flush_scripted.pop_front().unwrap_or(IoStatus::Success);
        if status.is_success() {
            state.flushes_held += 1;
        }
        status
    }

    fn release_after_flush(&self, _file: FileId) {
        let mut state = self.state.lock();
        state.flushes_held = state.flushes_held.saturating_sub(1);
    }

    fn is_remote(&self, file: FileId) -> bool {
        self.state.lock().remote.contains(&file)
    }
}

// ============================================================================
// Trimmer and Purger
// ============================================================================

/// Cache trimmer that counts requests
#[derive(Debug, Default)]
pub struct MemoryTrimmer {
    requests: AtomicU32,
    releases_views: AtomicBool,
}

impl MemoryTrimmer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report views as released on future requests
    pub fn set_releases_views(&self, releases: bool) {
        self.releases_views.store(releases, Ordering::Relaxed);
    }

    /// Requests received
    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::Relaxed)
    }
}

impl CacheTrimmer for MemoryTrimmer {
    fn unmap_inactive_views(&self, _views: u32) -> bool {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.releases_views.load(Ordering::Relaxed)
    }
}

/// Purger that records which objects were purged
#[derive(Debug, Default)]
pub struct RecordingPurger {
    purged: Mutex<Vec<ObjectId>>,
}

impl RecordingPurger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Objects purged so far
    pub fn purged(&self) -> Vec<ObjectId> {
        self.purged.lock().clone()
    }
}

impl ImagePurger for RecordingPurger {
    fn purge_shared_subset(&self, object: ObjectId, _file: FileId) {
        self.purged.lock().push(object);
    }
}

// ============================================================================
// Backend Bundle
// ============================================================================

/// Every in-memory collaborator, with typed handles for inspection
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    pub cache: Arc<MemoryPageCache>,
    pub swap: Arc<MemorySwap>,
    pub files: Arc<MemoryFiles>,
    pub trimmer: Arc<MemoryTrimmer>,
    pub purger: Arc<RecordingPurger>,
}

impl MemoryBackend {
    /// Create a backend with `frames` page frames and `swap_pages` of swap
    pub fn new(frames: usize, swap_pages: u64) -> Self {
        let swap = Arc::new(MemorySwap::new(swap_pages));
        Self {
            cache: Arc::new(MemoryPageCache::new(frames, swap.clone())),
            swap,
            files: Arc::new(MemoryFiles::new()),
            trimmer: Arc::new(MemoryTrimmer::new()),
            purger: Arc::new(RecordingPurger::new()),
        }
    }

    /// Collaborator handles for a manager
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            frames: self.cache.clone(),
            pool: self.cache.clone(),
            swap: self.swap.clone(),
            files: self.files.clone(),
            trimmer: self.trimmer.clone(),
            purger: self.purger.clone(),
        }
    }
}
