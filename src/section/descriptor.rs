//! Backing object descriptors
//!
//! A descriptor holds the prototype entries of one backing object, split
//! into page table shards. Each prototype entry describes one page of the
//! object:
//! - `Absent`: nothing allocated
//! - `FileBacked` / `SwapBacked`: not resident, data lives in the file or in
//!   a swap slot
//! - `Transition`: a resident frame that no address space maps, counted
//!   separately by the page frame database
//! - `Valid`: a live translation, legal only in large-page swap descriptors
//!
//! Shards live in pageable pool and can be paged out. A shard that holds a
//! transition or valid entry pins its table frame through the frame's share
//! count, so a paged-out shard holds no resident pages.

use crate::section::collab::CommitCharge;

// ============================================================================
// Page Constants
// ============================================================================

/// Page size in bytes
pub const PAGE_SIZE: u64 = 4096;

/// Page shift (log2 of page size)
pub const PAGE_SHIFT: u32 = 12;

/// Round a byte count up to whole pages
pub fn pages_for_bytes(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

// ============================================================================
// Frames and Slots
// ============================================================================

/// Physical page frame number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageFrame(pub u32);

/// Swap file slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(pub u32);

// ============================================================================
// Prototype Entries
// ============================================================================

/// Per-page descriptor inside a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrototypeEntry {
    /// No swap or file backing allocated
    #[default]
    Absent,
    /// Not resident, data at this file offset
    FileBacked { offset: u64 },
    /// Not resident, data in this swap slot
    SwapBacked(SwapSlot),
    /// Resident and unmapped
    Transition(PageFrame),
    /// Resident and mapped
    Valid(PageFrame),
}

impl PrototypeEntry {
    /// Resident frame if the entry is in transition
    pub fn transition_frame(self) -> Option<PageFrame> {
        match self {
            PrototypeEntry::Transition(frame) => Some(frame),
            _ => None,
        }
    }

    /// Entry holds a resident frame
    pub fn is_resident(self) -> bool {
        matches!(
            self,
            PrototypeEntry::Transition(_) | PrototypeEntry::Valid(_)
        )
    }

    /// Swap slot referenced by the entry
    pub fn swap_slot(self) -> Option<SwapSlot> {
        match self {
            PrototypeEntry::SwapBacked(slot) => Some(slot),
            _ => None,
        }
    }
}

// ============================================================================
// Page Table Shard
// ============================================================================

/// A contiguous run of prototype entries
#[derive(Debug)]
pub struct PageTableShard {
    /// Pool frame holding the entries, `None` once severed
    pub table: Option<PageFrame>,
    /// Prototype entries, empty once severed
    pub entries: Vec<PrototypeEntry>,
    /// Object page index of the first entry
    pub first_page: u64,
    /// Entries covered by this shard
    pub pages: usize,
    /// Views mapping this shard
    pub mapped_views: u32,
    /// Referenced since the eviction pass last pinned it
    pub accessed: bool,
    /// Linked on the unused shard list
    pub on_unused: bool,
}

impl PageTableShard {
    /// Create a shard with every entry set to `initial(page)`
    pub fn new(
        table: PageFrame,
        first_page: u64,
        pages: usize,
        initial: impl Fn(u64) -> PrototypeEntry,
    ) -> Self {
        Self {
            table: Some(table),
            entries: (0..pages as u64)
                .map(|i| initial(first_page + i))
                .collect(),
            first_page,
            pages,
            mapped_views: 0,
            accessed: false,
            on_unused: false,
        }
    }

    /// Storage has been released
    pub fn is_severed(&self) -> bool {
        self.table.is_none()
    }

    /// Release the entries, returning the table frame to free
    pub fn sever(&mut self) -> Option<PageFrame> {
        self.entries = Vec::new();
        self.table.take()
    }

    /// Rebuild severed storage
    pub fn restore(&mut self, table: PageFrame, initial: impl Fn(u64) -> PrototypeEntry) {
        self.entries = (0..self.pages as u64)
            .map(|i| initial(self.first_page + i))
            .collect();
        self.table = Some(table);
        self.accessed = false;
    }

    /// Entries currently holding a resident frame
    pub fn resident_entries(&self) -> usize {
        self.entries.iter().filter(|e| e.is_resident()).count()
    }
}

// ============================================================================
// Descriptor
// ============================================================================

/// What the descriptor's pages are backed by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    /// Mapped data file
    DataFile,
    /// Executable image; transition pages are never written back
    Image,
    /// Anonymous memory backed by swap
    Swap,
}

/// Prototype storage of one backing object
#[derive(Debug)]
pub struct BackingObjectDescriptor {
    /// Backing kind
    pub kind: DescriptorKind,
    /// Page table shards, in page order
    pub shards: Vec<PageTableShard>,
    /// Pages charged against the global commit limit
    pub committed_pages: u64,
    /// Outstanding commit charge, returned on deletion
    pub commit_charge: Option<CommitCharge>,
    /// Declared size in bytes
    pub size_bytes: u64,
    /// File offset of page 0
    pub file_offset: u64,
    /// Entries may be valid (large-page swap descriptors only)
    pub large_pages: bool,
}

impl BackingObjectDescriptor {
    /// Total pages described
    pub fn total_pages(&self) -> u64 {
        self.shards.iter().map(|s| s.pages as u64).sum()
    }

    /// Map an object page index to (shard, entry)
    pub fn locate(&self, page: u64) -> Option<(usize, usize)> {
        self.shards.iter().enumerate().find_map(|(i, shard)| {
            let end = shard.first_page + shard.pages as u64;
            (page >= shard.first_page && page < end)
                .then(|| (i, (page - shard.first_page) as usize))
        })
    }

    /// File offset of an entry
    pub fn page_offset(&self, shard: usize, index: usize) -> u64 {
        let page = self.shards[shard].first_page + index as u64;
        self.file_offset + (page << PAGE_SHIFT)
    }

    /// Entry at (shard, index), if the shard is not severed
    pub fn entry(&self, shard: usize, index: usize) -> Option<PrototypeEntry> {
        self.shards.get(shard)?.entries.get(index).copied()
    }

    /// Mutable entry at (shard, index)
    pub fn entry_mut(&mut self, shard: usize, index: usize) -> Option<&mut PrototypeEntry> {
        self.shards.get_mut(shard)?.entries.get_mut(index)
    }

    /// Object is backed by a file
    pub fn is_file_backed(&self) -> bool {
        self.kind != DescriptorKind::Swap
    }
}

/// Split `total_pages` into runs of at most `shard_pages`
pub fn shard_layout(total_pages: u64, shard_pages: usize) -> Vec<(u64, usize)> {
    let shard_pages = shard_pages.max(1) as u64;
    let mut layout = Vec::new();
    let mut first = 0;
    while first < total_pages {
        let pages = shard_pages.min(total_pages - first);
        layout.push((first, pages as usize));
        first += pages;
    }
    layout
}

/// Initial entry for a page of a file-backed object
pub fn file_entry(file_offset: u64) -> impl Fn(u64) -> PrototypeEntry {
    move |page| PrototypeEntry::FileBacked {
        offset: file_offset + (page << PAGE_SHIFT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(layout: &[(u64, usize)]) -> BackingObjectDescriptor {
        BackingObjectDescriptor {
            kind: DescriptorKind::DataFile,
            shards: layout
                .iter()
                .enumerate()
                .map(|(i, &(first, pages))| {
                    PageTableShard::new(PageFrame(i as u32), first, pages, file_entry(0x10000))
                })
                .collect(),
            committed_pages: 0,
            commit_charge: None,
            size_bytes: 10 * PAGE_SIZE,
            file_offset: 0x10000,
            large_pages: false,
        }
    }

    #[test]
    fn test_shard_layout() {
        assert_eq!(shard_layout(10, 4), vec![(0, 4), (4, 4), (8, 2)]);
        assert_eq!(shard_layout(3, 16), vec![(0, 3)]);
        assert!(shard_layout(0, 4).is_empty());
    }

    #[test]
    fn test_locate_and_offsets() {
        let desc = descriptor(&shard_layout(10, 4));
        assert_eq!(desc.total_pages(), 10);
        assert_eq!(desc.locate(0), Some((0, 0)));
        assert_eq!(desc.locate(5), Some((1, 1)));
        assert_eq!(desc.locate(9), Some((2, 1)));
        assert_eq!(desc.locate(10), None);

        assert_eq!(desc.page_offset(1, 1), 0x10000 + 5 * PAGE_SIZE);
        assert_eq!(
            desc.entry(2, 0),
            Some(PrototypeEntry::FileBacked {
                offset: 0x10000 + 8 * PAGE_SIZE
            })
        );
    }

    #[test]
    fn test_sever_and_restore() {
        let mut desc = descriptor(&[(0, 4)]);
        let shard = &mut desc.shards[0];

        assert_eq!(shard.sever(), Some(PageFrame(0)));
        assert!(shard.is_severed());
        assert!(shard.entries.is_empty());
        assert_eq!(shard.pages, 4);

        shard.restore(PageFrame(7), file_entry(0));
        assert_eq!(shard.entries.len(), 4);
        assert_eq!(
            shard.entries[3],
            PrototypeEntry::FileBacked {
                offset: 3 * PAGE_SIZE
            }
        );
    }

    #[test]
    fn test_pages_for_bytes() {
        assert_eq!(pages_for_bytes(0), 0);
        assert_eq!(pages_for_bytes(1), 1);
        assert_eq!(pages_for_bytes(PAGE_SIZE), 1);
        assert_eq!(pages_for_bytes(PAGE_SIZE + 1), 2);
    }
}
