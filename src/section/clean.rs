//! Flush and Clean Protocol
//!
//! Based on Mach4 vm/vm_pageout.c vm_pageout_cluster
//!
//! Writes the dirty pages of a file-backed object in clusters of contiguous
//! file offsets, then (when tearing the object down) frees every page it
//! handled. The same writer serves the eviction pass in write-back mode,
//! where written pages stay resident on the standby list.
//!
//! Write failures:
//! - retryable statuses are retried `write_attempts` times
//! - a multi-page cluster that still fails is re-issued one page at a time
//! - anything else is logged and the page dropped

use std::ops::Range;
use std::thread;

use crate::kern::fatal::{consistency_violation, Bugcheck};
use crate::section::config::MAX_WRITE_CLUSTER;
use crate::section::context::{CacheGuard, CacheState, LifecycleContext};
use crate::section::descriptor::{DescriptorKind, PageFrame, PrototypeEntry, PAGE_SIZE};
use crate::section::error::IoStatus;
use crate::section::object::{BackingObject, FileId, ObjectFlags, ObjectId};

// ============================================================================
// Write Clusters
// ============================================================================

/// How handled pages are disposed of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushMode {
    /// Pages stay resident once written
    WriteBack,
    /// Pages are freed once written; a dirty page is fatal unless expected
    Teardown { dirty_expected: bool },
}

#[derive(Debug, Clone, Copy)]
struct ClusterPage {
    shard: usize,
    index: usize,
    frame: PageFrame,
    offset: u64,
}

type WriteCluster = heapless::Vec<ClusterPage, MAX_WRITE_CLUSTER>;

/// State of one flush over a range of shards
#[derive(Debug)]
struct FlushRun {
    id: ObjectId,
    file: Option<FileId>,
    kind: DescriptorKind,
    /// File offset one past the object's last byte
    end: u64,
    mode: FlushMode,
    cluster: WriteCluster,
    first_failure: IoStatus,
}

impl FlushRun {
    fn teardown(&self) -> bool {
        matches!(self.mode, FlushMode::Teardown { .. })
    }

    fn record(&mut self, status: IoStatus) {
        if self.first_failure.is_success() {
            self.first_failure = status;
        }
    }
}

impl LifecycleContext {
    // ========================================================================
    // Clean
    // ========================================================================

    /// Flush and tear down an object the caller marked deleting and pinned
    /// with one mapped view
    ///
    /// Blocks new modified writes and waits out the ones in flight, writes
    /// or drops every resident page, detaches the object from its file and
    /// deletes the descriptor inline.
    pub(crate) fn clean(&self, id: ObjectId, dirty_expected: bool) {
        self.stats.cleans.inc();
        let mut guard = self.lock();

        loop {
            let Some(obj) = guard.objects.get_mut(&id) else {
                log::warn!("clean of unknown {:?}", id);
                return;
            };
            obj.flags.insert(ObjectFlags::NO_MODIFIED_WRITING);
            if obj.modified_writes == 0 {
                break;
            }
            obj.flags.insert(ObjectFlags::WAITING_FOR_WRITES);
            let seen = self.io_complete.generation();
            log::trace!("{:?} waiting for {} modified writes", id, obj.modified_writes);
            let (relocked, ()) = guard.unlocked(|| self.io_complete.wait_past(seen));
            guard = relocked;
        }

        let shards = guard.descriptor(id).map_or(0, |d| d.shards.len());
        let (mut guard, status) =
            self.flush_shards(guard, id, 0..shards, FlushMode::Teardown { dirty_expected });
        if !status.is_success() {
            log::warn!("{:?} cleaned with write failures: {:?}", id, status);
        }

        if let Some(obj) = guard.objects.get_mut(&id) {
            obj.mapped_views = 0;
        }
        guard.clear_backing_object(id);
        drop(guard);

        self.delete_descriptor(id);
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Write the dirty pages of `shards`
    ///
    /// Returns the first failing write status, or `Success`. The lock is
    /// dropped around every write and every in-flight reference wait.
    pub(crate) fn flush_shards<'a>(
        &'a self,
        guard: CacheGuard<'a>,
        id: ObjectId,
        shards: Range<usize>,
        mode: FlushMode,
    ) -> (CacheGuard<'a>, IoStatus) {
        let Some(obj) = guard.object(id) else {
            return (guard, IoStatus::Success);
        };
        let Some(desc) = obj.descriptor.as_ref() else {
            return (guard, IoStatus::Success);
        };

        let mut run = FlushRun {
            id,
            file: obj.backing_file,
            kind: desc.kind,
            end: desc.file_offset + desc.size_bytes,
            mode,
            cluster: WriteCluster::new(),
            first_failure: IoStatus::Success,
        };

        let mut guard = guard;
        for shard in shards {
            guard = self.flush_shard(guard, &mut run, shard);
        }
        guard = self.write_cluster(guard, &mut run);
        (guard, run.first_failure)
    }

    fn flush_shard<'a>(
        &'a self,
        mut guard: CacheGuard<'a>,
        run: &mut FlushRun,
        shard: usize,
    ) -> CacheGuard<'a> {
        let frames = &self.collab.frames;
        let mut index = 0;
        let mut waits = 0;

        loop {
            let Some(desc) = guard.descriptor(run.id) else {
                break;
            };
            let Some(table) = desc.shards.get(shard).and_then(|s| s.table) else {
                break;
            };
            if !self.collab.pool.is_resident(table) {
                // A paged-out shard pins no frames
                guard = self.write_cluster(guard, run);
                break;
            }
            let Some(entry) = desc.entry(shard, index) else {
                break;
            };
            let offset = desc.page_offset(shard, index);

            match entry {
                PrototypeEntry::Valid(frame) => consistency_violation(
                    Bugcheck::ValidPrototypeEntry,
                    format_args!("{:?} frame {:?} valid during flush", run.id, frame),
                ),
                PrototypeEntry::Transition(frame) => {
                    if run.teardown()
                        && frames.reference_count(frame) != 0
                        && waits < self.config.reference_wait_limit
                    {
                        waits += 1;
                        guard = self.write_cluster(guard, run);
                        let (relocked, ()) = guard.unlocked(|| self.short_delay());
                        guard = relocked;
                        continue;
                    }
                    waits = 0;

                    let original = frames.original_entry(frame);
                    let dirty = frames.is_modified(frame)
                        && run.kind != DescriptorKind::Image
                        && original.swap_slot().is_none()
                        && run.file.is_some();

                    if !dirty {
                        if run.teardown() {
                            self.drop_page(&mut guard, run.id, shard, index, frame);
                        }
                    } else {
                        if run.mode == (FlushMode::Teardown { dirty_expected: false }) {
                            consistency_violation(
                                Bugcheck::UnexpectedDirtyPage,
                                format_args!("{:?} dirty page at {:#x}", run.id, offset),
                            );
                        }

                        let contiguous = run
                            .cluster
                            .last()
                            .map_or(true, |p| p.offset + PAGE_SIZE == offset);
                        if !contiguous
                            || run.cluster.is_full()
                            || run.cluster.len() >= self.config.max_write_cluster
                        {
                            // Entry is re-read once the lock is back
                            guard = self.write_cluster(guard, run);
                            continue;
                        }

                        frames.unlink_from_list(frame);
                        frames.set_modified(frame, false);
                        frames.add_locked_charge(frame);
                        let page = ClusterPage {
                            shard,
                            index,
                            frame,
                            offset,
                        };
                        if run.cluster.push(page).is_err() {
                            unreachable!("write cluster checked for room");
                        }
                    }
                }
                other => {
                    if run.teardown() {
                        self.collab.swap.release_entry(other);
                        guard.set_prototype(run.id, shard, index, PrototypeEntry::Absent);
                    }
                }
            }
            index += 1;
        }
        guard
    }

    /// Issue the pending cluster and dispose of its pages
    fn write_cluster<'a>(&'a self, guard: CacheGuard<'a>, run: &mut FlushRun) -> CacheGuard<'a> {
        let pages = core::mem::take(&mut run.cluster);
        let (Some(first), Some(file)) = (pages.first(), run.file) else {
            return guard;
        };

        let frames: heapless::Vec<PageFrame, MAX_WRITE_CLUSTER> =
            pages.iter().map(|p| p.frame).collect();
        let (mut guard, status) = self.write_with_retry(guard, file, &frames, first.offset, run.end);

        let mut statuses: heapless::Vec<IoStatus, MAX_WRITE_CLUSTER> = heapless::Vec::new();
        if status.is_retryable() && pages.len() > 1 {
            self.stats.cluster_degrades.inc();
            log::warn!(
                "{:?} cluster of {} pages at {:#x} failed with {:?}, writing singly",
                run.id,
                pages.len(),
                first.offset,
                status
            );
            for page in &pages {
                let (relocked, status) =
                    self.write_with_retry(guard, file, &[page.frame], page.offset, run.end);
                guard = relocked;
                let _ = statuses.push(status);
            }
        } else {
            for _ in &pages {
                let _ = statuses.push(status);
            }
        }

        for (page, status) in pages.iter().zip(statuses) {
            self.complete_page(&mut guard, run, page, status);
        }
        guard
    }

    /// Write with retries; the lock is dropped for the whole sequence
    fn write_with_retry<'a>(
        &'a self,
        guard: CacheGuard<'a>,
        file: FileId,
        frames: &[PageFrame],
        offset: u64,
        end: u64,
    ) -> (CacheGuard<'a>, IoStatus) {
        let bytes = (frames.len() as u64 * PAGE_SIZE).min(end.saturating_sub(offset));
        let attempts = self.config.write_attempts.max(1);

        guard.unlocked(|| {
            let mut attempt = 1;
            loop {
                let status = self.collab.files.write(file, frames, offset, bytes);
                if !status.is_retryable() || attempt >= attempts {
                    return status;
                }
                self.stats.write_retries.inc();
                log::debug!(
                    "write of {} pages at {:#x} returned {:?}, attempt {}",
                    frames.len(),
                    offset,
                    status,
                    attempt
                );
                attempt += 1;
                thread::sleep(self.config.write_retry_delay);
            }
        })
    }

    fn complete_page(
        &self,
        state: &mut CacheState,
        run: &mut FlushRun,
        page: &ClusterPage,
        status: IoStatus,
    ) {
        let frames = &self.collab.frames;
        frames.remove_locked_charge(page.frame);

        if status.is_success() {
            self.stats.pages_written.inc();
        } else {
            run.record(status);
        }

        match run.mode {
            FlushMode::Teardown { .. } => {
                if !status.is_success() {
                    self.stats.pages_dropped.inc();
                    log::warn!(
                        "{:?} dropping dirty page at {:#x}: {:?}",
                        run.id,
                        page.offset,
                        status
                    );
                }
                let still_ours = state.prototype(run.id, page.shard, page.index)
                    == Some(PrototypeEntry::Transition(page.frame))
                    && !frames.is_deleted(page.frame);
                if still_ours {
                    self.drop_page(state, run.id, page.shard, page.index, page.frame);
                }
            }
            FlushMode::WriteBack => {
                if !status.is_success() {
                    frames.set_modified(page.frame, true);
                }
                // A held frame is relinked by its last holder
                if frames.reference_count(page.frame) == 0 {
                    frames.insert_in_standby_list(page.frame);
                }
            }
        }
    }

    /// Free a transition page and clear its entry. Lock held.
    pub(crate) fn drop_page(
        &self,
        state: &mut CacheState,
        id: ObjectId,
        shard: usize,
        index: usize,
        frame: PageFrame,
    ) {
        let Some(table) = state
            .descriptor(id)
            .and_then(|d| d.shards.get(shard))
            .and_then(|s| s.table)
        else {
            return;
        };
        self.free_transition_frame(frame, table);
        state.set_prototype(id, shard, index, PrototypeEntry::Absent);
        if let Some(obj) = state.objects.get_mut(&id) {
            BackingObject::decrement(&mut obj.resident_page_references, id, "resident pages");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::section::collab::memory::MemoryBackend;
    use crate::section::config::LifecycleConfig;
    use crate::section::manager::{OpenOptions, SectionHandle, SectionManager};

    const FILE: FileId = FileId(11);

    fn setup(
        config: LifecycleConfig,
        pages: u64,
    ) -> (MemoryBackend, SectionManager, SectionHandle) {
        let _ = env_logger::builder().is_test(true).try_init();
        let backend = MemoryBackend::new(128, 64);
        let mgr = SectionManager::without_worker(config, backend.collaborators()).unwrap();
        let section = mgr
            .open_file(
                FILE,
                pages * PAGE_SIZE,
                OpenOptions {
                    shard_pages: Some(32),
                    ..OpenOptions::default()
                },
            )
            .unwrap();
        (backend, mgr, section)
    }

    fn dirty(mgr: &SectionManager, id: ObjectId, pages: impl IntoIterator<Item = u64>) {
        for page in pages {
            mgr.fault_in_page(id, page, true).unwrap();
        }
    }

    #[test]
    fn test_clusters_split_on_gaps() {
        let (backend, mgr, section) = setup(LifecycleConfig::default().with_fast_delays(), 8);
        let id = section.object();
        dirty(&mgr, id, [0, 1, 3]);
        mgr.close_handle(section);

        assert!(mgr.force_close(FILE, false));
        let lengths: Vec<usize> = backend.files.writes().iter().map(|w| w.pages).collect();
        assert_eq!(lengths, vec![2, 1]);
        assert_eq!(backend.files.pages_written(FILE).len(), 3);
        assert!(mgr.object_info(id).is_none());
        assert_eq!(backend.cache.resident_pages(), 0);
    }

    #[test]
    fn test_clusters_capped() {
        let config = LifecycleConfig {
            max_write_cluster: 16,
            ..LifecycleConfig::default().with_fast_delays()
        };
        let (backend, mgr, section) = setup(config, 20);
        let id = section.object();
        dirty(&mgr, id, 0..20);
        mgr.close_handle(section);

        assert!(mgr.force_close(FILE, false));
        let lengths: Vec<usize> = backend.files.writes().iter().map(|w| w.pages).collect();
        assert_eq!(lengths, vec![16, 4]);
        assert_eq!(mgr.stats().pages_written, 20);
    }

    #[test]
    fn test_write_clamped_to_object_size() {
        let backend = MemoryBackend::new(32, 16);
        let mgr = SectionManager::without_worker(
            LifecycleConfig::default().with_fast_delays(),
            backend.collaborators(),
        )
        .unwrap();
        let section = mgr.open_file(FILE, 10_000, OpenOptions::default()).unwrap();
        let id = section.object();
        dirty(&mgr, id, 0..3);
        mgr.close_handle(section);

        assert!(mgr.force_close(FILE, false));
        let writes = backend.files.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].pages, 3);
        assert_eq!(writes[0].bytes, 10_000);
    }

    #[test]
    fn test_failed_cluster_degrades_to_single_pages() {
        let (backend, mgr, section) = setup(LifecycleConfig::default().with_fast_delays(), 4);
        let id = section.object();
        backend.files.fail_clusters_above(1);
        dirty(&mgr, id, 0..4);
        mgr.close_handle(section);

        assert!(mgr.force_close(FILE, false));
        let stats = mgr.stats();
        assert_eq!(stats.cluster_degrades, 1);
        assert_eq!(stats.write_retries, 6);
        assert_eq!(stats.pages_dropped, 0);
        assert_eq!(
            backend.files.pages_written(FILE).into_iter().collect::<Vec<_>>(),
            vec![0, PAGE_SIZE, 2 * PAGE_SIZE, 3 * PAGE_SIZE]
        );
        assert_eq!(backend.cache.locked_charges(), 0);
    }

    #[test]
    fn test_hard_failure_drops_page() {
        let (backend, mgr, section) = setup(LifecycleConfig::default().with_fast_delays(), 2);
        let id = section.object();
        backend.files.script_writes([IoStatus::Failed(-5)]);
        dirty(&mgr, id, [1]);
        mgr.close_handle(section);
        let free = backend.cache.free_frames();

        assert!(mgr.force_close(FILE, false));
        assert_eq!(mgr.stats().pages_dropped, 1);
        assert_eq!(mgr.stats().write_retries, 0);
        assert!(mgr.object_info(id).is_none());
        // The dirty page and the shard table
        assert_eq!(backend.cache.free_frames(), free + 2);
    }

    #[test]
    #[should_panic(expected = "dirty page")]
    fn test_unexpected_dirty_page_is_fatal() {
        let (_backend, mgr, section) = setup(LifecycleConfig::default().with_fast_delays(), 2);
        let id = section.object();
        dirty(&mgr, id, [0]);
        mgr.close_handle(section);

        let ctx = mgr.context();
        {
            let mut guard = ctx.lock();
            let obj = guard.object_mut(id).unwrap();
            obj.begin_deletion();
            obj.mapped_views = 1;
        }
        ctx.clean(id, false);
    }

    #[test]
    fn test_clean_waits_for_modified_writes() {
        let (_backend, mgr, section) = setup(LifecycleConfig::default().with_fast_delays(), 2);
        let id = section.object();
        mgr.fault_in_page(id, 0, false).unwrap();
        assert!(mgr.begin_modified_write(id).unwrap());
        mgr.close_handle(section);
        let mgr = Arc::new(mgr);

        let closer = {
            let mgr = mgr.clone();
            std::thread::spawn(move || mgr.force_close(FILE, false))
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let flags = mgr.object_info(id).unwrap().flags;
            if flags.contains(ObjectFlags::WAITING_FOR_WRITES) {
                break;
            }
            assert!(Instant::now() < deadline, "cleaner never waited");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!mgr.begin_modified_write(id).unwrap());

        mgr.end_modified_write(id);
        assert!(closer.join().unwrap());
        assert!(mgr.object_info(id).is_none());
    }

    #[test]
    fn test_referenced_page_waited_then_released() {
        let (backend, mgr, section) = setup(LifecycleConfig::default().with_fast_delays(), 2);
        let id = section.object();
        let frame = mgr.fault_in_page(id, 0, false).unwrap();
        backend.cache.hold(frame);
        mgr.close_handle(section);
        let free = backend.cache.free_frames();

        let started = Instant::now();
        assert!(mgr.force_close(FILE, false));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(mgr.object_info(id).is_none());
        // Only the shard table came back; the held frame waits for its holder
        assert_eq!(backend.cache.free_frames(), free + 1);

        backend.cache.unhold(frame);
        assert_eq!(backend.cache.free_frames(), free + 2);
    }
}
