//! Vehicle Signal Interface core.
//!
//! A multi-process, shared-memory publish/subscribe store for vehicle
//! telemetry signals. Producers deposit payloads keyed by
//! `(domain, signal)`; consumers fetch oldest (destructive) or newest
//! (non-destructive), optionally blocking until data arrives. The whole
//! store lives in one memory-mapped file, so every process that maps it
//! sees the same state; all intra-segment references are byte offsets
//! because each process maps the file at a different base address.
//!
//! Layering, leaves first: offset primitives and the segment header; a
//! best-fit coalescing arena allocator; a locked position-independent
//! B-tree (used by the allocator for its free lists and by the store for
//! every directory); per-signal FIFO queues with cross-process blocking
//! fetch; and group aggregation on top.

pub mod config;
pub mod error;
pub mod vss;

mod alloc;
mod btree;
mod group;
mod offset;
mod segment;
mod store;
mod sync;
mod vsi;

pub use alloc::MemoryStats;
pub use config::VsiConfig;
pub use error::{Result, VsiError};
pub use group::{GroupInfo, GroupSlot};
pub use store::SignalInfo;
pub use vsi::{SignalResult, Vsi};
