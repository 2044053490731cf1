//! Deletion Protocol
//!
//! Based on Mach4 vm/vm_object.c vm_object_terminate
//!
//! Tears down the descriptor of an object already marked for deletion.
//! Runs on the dereference worker, or inline after a clean. The page cache
//! lock is dropped and retaken every `lock_window` entries and whenever a
//! paged-out shard has to be faulted back in, so a large object never
//! starves other lock holders.

use std::thread;

use crate::kern::fatal::{consistency_violation, Bugcheck};
use crate::section::context::{CacheGuard, LifecycleContext};
use crate::section::descriptor::{PageFrame, PrototypeEntry};
use crate::section::object::ObjectId;

impl LifecycleContext {
    /// Release every page, swap slot, shard table and the commit charge of
    /// a deleting object, then wake anyone waiting for it
    pub(crate) fn delete_descriptor(&self, id: ObjectId) {
        let mut guard = self.lock();

        let Some(obj) = guard.objects.get_mut(&id) else {
            log::warn!("deletion of unknown {:?}", id);
            return;
        };
        if !obj.is_being_deleted() {
            consistency_violation(
                Bugcheck::StateRegression,
                format_args!("{:?} deleted without being marked", id),
            );
        }
        let descriptor = obj.descriptor.take();
        guard.remove_unused(id);
        guard.unused_shards.retain(|r| r.object != id);

        if let Some(mut descriptor) = descriptor {
            let strict = descriptor.is_file_backed() || !descriptor.large_pages;
            let window = self.config.lock_window;
            let mut inspected = 0usize;

            for shard in descriptor.shards.iter_mut() {
                let Some(table) = shard.table else {
                    continue;
                };
                guard = self.make_shard_resident(guard, table);

                for entry in shard.entries.iter_mut() {
                    if inspected > 0 && inspected % window == 0 {
                        guard = self.yield_lock(guard, table);
                    }
                    inspected += 1;

                    match *entry {
                        PrototypeEntry::Valid(frame) => {
                            if strict {
                                consistency_violation(
                                    Bugcheck::ValidPrototypeEntry,
                                    format_args!("{:?} frame {:?} still valid", id, frame),
                                );
                            }
                            self.free_valid_frame(frame, table);
                        }
                        PrototypeEntry::Transition(frame) => {
                            self.free_transition_frame(frame, table);
                        }
                        other => self.collab.swap.release_entry(other),
                    }
                    *entry = PrototypeEntry::Absent;
                }
            }

            if let Some(charge) = descriptor.commit_charge.take() {
                self.collab.swap.release(charge);
            }
            for shard in descriptor.shards.iter_mut() {
                if let Some(table) = shard.sever() {
                    self.collab.pool.free_shard(table);
                }
            }
            log::debug!("{:?} descriptor released, {} entries", id, inspected);
        }

        guard.clear_backing_object(id);
        self.wake_deletion_waiters(&mut guard, id);
        if let Some(mut obj) = guard.objects.remove(&id) {
            obj.mark_freed();
        }
        drop(guard);
        self.stats.descriptors_deleted.inc();
    }

    /// Let other lock holders in, then make sure the shard is still resident
    fn yield_lock<'a>(&'a self, guard: CacheGuard<'a>, table: PageFrame) -> CacheGuard<'a> {
        let (guard, ()) = guard.unlocked(thread::yield_now);
        self.make_shard_resident(guard, table)
    }

    /// Release a large-page frame still mapped through the descriptor. Lock held.
    fn free_valid_frame(&self, frame: PageFrame, table: PageFrame) {
        let frames = &self.collab.frames;
        frames.mark_deleted(frame);
        frames.decrement_share_count(frame);
        frames.decrement_share_count(table);

        if frames.share_count(frame) == 0
            && frames.reference_count(frame) == 0
            && !frames.is_on_free_list(frame)
        {
            frames.unlink_from_list(frame);
            self.collab.swap.release_entry(frames.original_entry(frame));
            frames.insert_in_free_list(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::section::collab::memory::MemoryBackend;
    use crate::section::config::LifecycleConfig;
    use crate::section::manager::{OpenOptions, SectionManager, SwapOptions};
    use crate::section::object::FileId;

    fn manager(backend: &MemoryBackend, config: LifecycleConfig) -> SectionManager {
        SectionManager::without_worker(config, backend.collaborators()).unwrap()
    }

    #[test]
    fn test_delete_releases_everything() {
        let backend = MemoryBackend::new(64, 32);
        let mgr = manager(&backend, LifecycleConfig::default().with_fast_delays());
        let free = backend.cache.free_frames();

        let section = mgr
            .open_swap(
                12,
                SwapOptions {
                    shard_pages: Some(4),
                    ..SwapOptions::default()
                },
            )
            .unwrap();
        let id = section.object();
        for page in 0..12 {
            mgr.fault_in_page(id, page, page % 2 == 0).unwrap();
        }
        for page in (0..12).step_by(3) {
            assert!(mgr.release_resident_page(id, page).unwrap());
        }
        assert_eq!(backend.swap.committed(), 12);
        assert!(backend.swap.slots_in_use() > 0);

        mgr.close_handle(section);
        assert_eq!(mgr.drain_deferred(), 1);

        assert!(mgr.object_info(id).is_none());
        assert_eq!(backend.cache.free_frames(), free);
        assert_eq!(backend.swap.committed(), 0);
        assert_eq!(backend.swap.slots_in_use(), 0);
        assert_eq!(backend.cache.double_frees(), 0);
        assert_eq!(backend.cache.table_leaks(), 0);
        assert_eq!(mgr.stats().descriptors_deleted, 1);
    }

    #[test]
    fn test_lock_window_faults_paged_out_shards() {
        let backend = MemoryBackend::new(64, 32);
        let config = LifecycleConfig {
            lock_window: 3,
            ..LifecycleConfig::default().with_fast_delays()
        };
        let mgr = manager(&backend, config);

        let section = mgr
            .open_swap(
                8,
                SwapOptions {
                    shard_pages: Some(4),
                    ..SwapOptions::default()
                },
            )
            .unwrap();
        let id = section.object();
        let table = mgr.shard_table(id, 1).unwrap();
        assert!(backend.cache.page_out(table));

        let audit_before = mgr.lock_audit();
        mgr.close_handle(section);
        mgr.drain_deferred();

        assert!(mgr.object_info(id).is_none());
        assert_eq!(backend.cache.page_ins(), 1);
        assert_eq!(mgr.stats().shard_faults, 1);
        let audit = mgr.lock_audit();
        assert!(audit.balanced());
        assert!(audit.acquisitions >= audit_before.acquisitions + 4);
    }

    #[test]
    fn test_large_page_valid_entries_released() {
        let backend = MemoryBackend::new(32, 16);
        let mgr = manager(&backend, LifecycleConfig::default().with_fast_delays());
        let free = backend.cache.free_frames();

        let section = mgr
            .open_swap(
                4,
                SwapOptions {
                    large_pages: true,
                    ..SwapOptions::default()
                },
            )
            .unwrap();
        let id = section.object();
        for page in 0..4 {
            mgr.fault_in_page(id, page, true).unwrap();
        }

        mgr.close_handle(section);
        mgr.drain_deferred();
        assert_eq!(backend.cache.free_frames(), free);
        assert_eq!(backend.cache.share_underflows(), 0);
    }

    #[test]
    fn test_deletion_of_data_file_with_no_pages() {
        let backend = MemoryBackend::new(32, 16);
        let mgr = manager(&backend, LifecycleConfig::default().with_fast_delays());

        let section = mgr
            .open_file(FileId(7), 40_000, OpenOptions::default())
            .unwrap();
        let id = section.object();
        mgr.close_handle(section);

        assert!(mgr.object_for(FileId(7), false).is_none());
        assert_eq!(mgr.deferred_len(), 1);
        mgr.drain_deferred();
        assert!(mgr.object_info(id).is_none());
        assert_eq!(backend.cache.shard_tables(), 0);
    }
}
