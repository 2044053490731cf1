//! Kern subsystem - Core primitives
//!
//! Based on Mach4 kern/ directory
//! Contains the audited page cache lock, notification events, counters,
//! the wait-token zone and fatal consistency stops.

pub mod counters;
pub mod event;
pub mod fatal;
pub mod lock;
pub mod zalloc;

pub use counters::{Counter, HighWater};
pub use event::Event;
pub use fatal::{consistency_violation, Bugcheck};
pub use lock::{AuditedGuard, AuditedLock, LockAudit};
pub use zalloc::{TokenZone, WaitToken, ZoneStats};
