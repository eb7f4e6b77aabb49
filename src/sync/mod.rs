//! Keeping cached server state fresh.
//!
//! - [`RequestDeduplicator`] collapses identical in-flight operations
//! - [`PollScheduler`] drives background refreshes while the page is visible
//! - [`SyncEngine`] ties both to a [`TtlCache`](crate::cache::TtlCache) and a
//!   caller-supplied fetcher, and handles optimistic writes

mod dedup;
mod engine;
mod optimistic;
mod scheduler;

pub use dedup::{DedupGuard, DedupKey, Method, RequestDeduplicator};
pub use engine::{ChangeEvent, Direction, SyncConfig, SyncEngine, SyncOptions, SyncState};
pub use optimistic::{OptimisticUpdate, PendingMutation, Resolution};
pub use scheduler::{
  AdaptiveInterval, Liveness, PageVisibility, PollHandle, PollScheduler, Visibility,
};
