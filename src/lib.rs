//! Backing Lifecycle - deferred lifecycle management for shared backing-store objects
//!
//! This crate manages the objects that back memory-mapped regions: objects
//! opened by many independent mapping handles whose cached pages may outlive
//! every handle, and whose destruction is deferred, ordered, and safe under
//! concurrency.
//!
//! - `kern`: locking, events, counters, the wait-token zone and fatal stops
//! - `section`: the backing object registry, deletion and clean protocols,
//!   the deferred-deletion worker and its eviction pass

#![allow(clippy::new_without_default)]
// Reference counts are narrowed explicitly where the page model requires it
#![allow(clippy::unnecessary_cast)]

pub mod kern;
pub mod section;

pub use section::{
    Collaborators, FileId, FlushPurpose, IoStatus, LifecycleConfig, LifecycleError, ObjectId,
    OpenOptions, SectionHandle, SectionManager, SwapOptions, ViewHandle,
};
