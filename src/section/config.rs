//! Lifecycle configuration
//!
//! Tunables for the registry, the clean protocol and the dereference worker.
//! Defaults follow the classic section manager: a 16-page write cluster,
//! seven write attempts 30ms apart, 512-entry lock windows and a 10ms short
//! delay for every back-off.

use std::time::Duration;

use thiserror::Error;

use crate::kern::zalloc::MAX_WAIT_TOKENS;

// ============================================================================
// Constants
// ============================================================================

/// Largest write cluster the clean protocol can build
pub const MAX_WRITE_CLUSTER: usize = 16;

/// Default soft limit on unused objects and shards
pub const DEFAULT_UNUSED_BUDGET: usize = 64;

/// Default prototype entries per shard
pub const DEFAULT_SHARD_PAGES: usize = 16;

/// Default wait-token zone size
pub const DEFAULT_WAIT_TOKENS: usize = 64;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration rejected by `LifecycleConfig::validate`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("write cluster must be between 1 and {MAX_WRITE_CLUSTER} pages, got {0}")]
    WriteCluster(usize),
    #[error("write attempts must be at least 1")]
    ZeroWriteAttempts,
    #[error("lock window must be at least 1 entry")]
    ZeroLockWindow,
    #[error("shards must hold at least 1 entry")]
    ZeroShardPages,
    #[error("inline drain interval must be at least 1 loop")]
    ZeroDrainInterval,
    #[error("wait-token zone must hold between 1 and {MAX_WAIT_TOKENS} tokens, got {0}")]
    WaitTokens(usize),
}

/// Lifecycle manager tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Unused objects plus unused shards tolerated before eviction runs
    pub unused_budget: usize,
    /// Pages per write cluster
    pub max_write_cluster: usize,
    /// Attempts per write before degrading or giving up
    pub write_attempts: u32,
    /// Delay between write attempts
    pub write_retry_delay: Duration,
    /// Back-off for exhaustion and contention
    pub short_delay: Duration,
    /// Prototype entries inspected per lock hold during deletion
    pub lock_window: usize,
    /// Short delays spent waiting for an in-flight frame reference
    pub reference_wait_limit: u32,
    /// Consecutive eviction failures before a short delay
    pub consecutive_failure_limit: u32,
    /// Eviction loops between inline drains of the deferred queue
    pub drain_interval: u32,
    /// Eviction loops before external view trimming is requested; also the
    /// run of consecutive requeues that ends a pass making no progress
    pub trim_after_loops: u32,
    /// Views the external trimmer is asked to unmap
    pub trim_views: u32,
    /// Prototype entries per shard for new descriptors
    pub shard_pages: usize,
    /// Tokens in the wait-token zone
    pub wait_tokens: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            unused_budget: DEFAULT_UNUSED_BUDGET,
            max_write_cluster: MAX_WRITE_CLUSTER,
            write_attempts: 7,
            write_retry_delay: Duration::from_millis(30),
            short_delay: Duration::from_millis(10),
            lock_window: 512,
            reference_wait_limit: 20,
            consecutive_failure_limit: 10,
            drain_interval: 64,
            trim_after_loops: 128,
            trim_views: 50,
            shard_pages: DEFAULT_SHARD_PAGES,
            wait_tokens: DEFAULT_WAIT_TOKENS,
        }
    }
}

impl LifecycleConfig {
    /// Check every tunable against its limits
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_write_cluster == 0 || self.max_write_cluster > MAX_WRITE_CLUSTER {
            return Err(ConfigError::WriteCluster(self.max_write_cluster));
        }
        if self.write_attempts == 0 {
            return Err(ConfigError::ZeroWriteAttempts);
        }
        if self.lock_window == 0 {
            return Err(ConfigError::ZeroLockWindow);
        }
        if self.shard_pages == 0 {
            return Err(ConfigError::ZeroShardPages);
        }
        if self.drain_interval == 0 {
            return Err(ConfigError::ZeroDrainInterval);
        }
        if self.wait_tokens == 0 || self.wait_tokens > MAX_WAIT_TOKENS {
            return Err(ConfigError::WaitTokens(self.wait_tokens));
        }
        Ok(())
    }

    /// Millisecond-scale delays for tests and simulations
    pub fn with_fast_delays(mut self) -> Self {
        self.write_retry_delay = Duration::from_millis(1);
        self.short_delay = Duration::from_millis(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = LifecycleConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.max_write_cluster, MAX_WRITE_CLUSTER);
        assert_eq!(config.write_retry_delay, Duration::from_millis(30));
    }

    #[test]
    fn test_rejects_oversized_cluster() {
        let config = LifecycleConfig {
            max_write_cluster: MAX_WRITE_CLUSTER + 1,
            ..LifecycleConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::WriteCluster(MAX_WRITE_CLUSTER + 1))
        );
    }

    #[test]
    fn test_rejects_zero_limits() {
        let base = LifecycleConfig::default();

        let config = LifecycleConfig {
            lock_window: 0,
            ..base.clone()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroLockWindow));

        let config = LifecycleConfig {
            wait_tokens: 0,
            ..base
        };
        assert_eq!(config.validate(), Err(ConfigError::WaitTokens(0)));
    }
}
