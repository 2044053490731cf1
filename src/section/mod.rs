//! Section subsystem - backing object lifecycle
//!
//! Based on Mach4 vm/ directory
//!
//! Layering, bottom-up:
//! - `object`, `descriptor`: backing objects and their prototype storage
//! - `collab`: traits for the frame database, pool, swap, files, trimmer
//! - `context`: the page cache lock and everything it guards
//! - `registry`: reference release and the evaluate decision
//! - `delete`, `clean`: descriptor teardown and the flush protocol
//! - `worker`, `eviction`: the dereference worker and its eviction pass
//! - `manager`: the public API

pub mod collab;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod object;
pub mod stats;

mod clean;
mod delete;
mod eviction;
mod manager;
mod registry;
mod worker;


pub use collab::{
    CacheTrimmer, Collaborators, CommitCharge, FileIo, ImagePurger, PageFrameDatabase,
    PrototypePool, SwapAllocator,
};
pub use config::{ConfigError, LifecycleConfig};
pub use descriptor::{PageFrame, PrototypeEntry, SwapSlot, PAGE_SIZE};
pub use error::{IoStatus, LifecycleError, LifecycleResult};
pub use manager::{
    FlushPurpose, OpenOptions, SectionHandle, SectionManager, SwapOptions, ViewHandle,
};
pub use object::{FileId, ObjectFlags, ObjectId, ObjectInfo, ObjectState};
pub use stats::StatsSnapshot;
pub use worker::{SwapResize, SwapResizeTicket};
