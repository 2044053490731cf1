//! Lifecycle statistics

use crate::kern::counters::{Counter, HighWater};

/// Lifecycle manager statistics
#[derive(Debug)]
pub struct LifecycleStats {
    /// Backing objects created
    pub objects_created: Counter,
    /// Deletions handed to the worker queue
    pub deletions_queued: Counter,
    /// Descriptors torn down
    pub descriptors_deleted: Counter,
    /// Clean protocol runs
    pub cleans: Counter,
    /// Pages written back
    pub pages_written: Counter,
    /// Write attempts repeated after a retryable status
    pub write_retries: Counter,
    /// Clusters re-issued one page at a time
    pub cluster_degrades: Counter,
    /// Dirty pages dropped after writes failed
    pub pages_dropped: Counter,
    /// Waits for a deletion to finish
    pub deletion_waits: Counter,
    /// Eviction passes run
    pub eviction_passes: Counter,
    /// Objects evicted from the unused cache
    pub objects_evicted: Counter,
    /// Shards severed from the unused shard list
    pub shards_trimmed: Counter,
    /// Eviction candidates put back after the recheck
    pub eviction_requeues: Counter,
    /// Eviction candidates released because they were referenced again
    pub eviction_reclaimed: Counter,
    /// External view trimming requests
    pub trim_requests: Counter,
    /// Swap grow requests served
    pub swap_grows: Counter,
    /// Swap contract requests served
    pub swap_contracts: Counter,
    /// Shard tables faulted back in
    pub shard_faults: Counter,
    /// Longest the unused lists have been
    pub unused_peak: HighWater,
    /// Longest the deferred queue has been
    pub deferred_peak: HighWater,
}

impl LifecycleStats {
    pub fn new() -> Self {
        Self {
            objects_created: Counter::new("objects_created"),
            deletions_queued: Counter::new("deletions_queued"),
            descriptors_deleted: Counter::new("descriptors_deleted"),
            cleans: Counter::new("cleans"),
            pages_written: Counter::new("pages_written"),
            write_retries: Counter::new("write_retries"),
            cluster_degrades: Counter::new("cluster_degrades"),
            pages_dropped: Counter::new("pages_dropped"),
            deletion_waits: Counter::new("deletion_waits"),
            eviction_passes: Counter::new("eviction_passes"),
            objects_evicted: Counter::new("objects_evicted"),
            shards_trimmed: Counter::new("shards_trimmed"),
            eviction_requeues: Counter::new("eviction_requeues"),
            eviction_reclaimed: Counter::new("eviction_reclaimed"),
            trim_requests: Counter::new("trim_requests"),
            swap_grows: Counter::new("swap_grows"),
            swap_contracts: Counter::new("swap_contracts"),
            shard_faults: Counter::new("shard_faults"),
            unused_peak: HighWater::new("unused_peak"),
            deferred_peak: HighWater::new("deferred_peak"),
        }
    }

    /// Take a snapshot of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            objects_created: self.objects_created.get(),
            deletions_queued: self.deletions_queued.get(),
            descriptors_deleted: self.descriptors_deleted.get(),
            cleans: self.cleans.get(),
            pages_written: self.pages_written.get(),
            write_retries: self.write_retries.get(),
            cluster_degrades: self.cluster_degrades.get(),
            pages_dropped: self.pages_dropped.get(),
            deletion_waits: self.deletion_waits.get(),
            eviction_passes: self.eviction_passes.get(),
            objects_evicted: self.objects_evicted.get(),
            shards_trimmed: self.shards_trimmed.get(),
            eviction_requeues: self.eviction_requeues.get(),
            eviction_reclaimed: self.eviction_reclaimed.get(),
            trim_requests: self.trim_requests.get(),
            swap_grows: self.swap_grows.get(),
            swap_contracts: self.swap_contracts.get(),
            shard_faults: self.shard_faults.get(),
            unused_peak: self.unused_peak.peak(),
            deferred_peak: self.deferred_peak.peak(),
        }
    }
}

impl Default for LifecycleStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of `LifecycleStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub objects_created: u64,
    pub deletions_queued: u64,
    pub descriptors_deleted: u64,
    pub cleans: u64,
    pub pages_written: u64,
    pub write_retries: u64,
    pub cluster_degrades: u64,
    pub pages_dropped: u64,
    pub deletion_waits: u64,
    pub eviction_passes: u64,
    pub objects_evicted: u64,
    pub shards_trimmed: u64,
    pub eviction_requeues: u64,
    pub eviction_reclaimed: u64,
    pub trim_requests: u64,
    pub swap_grows: u64,
    pub swap_contracts: u64,
    pub shard_faults: u64,
    pub unused_peak: u64,
    pub deferred_peak: u64,
}
