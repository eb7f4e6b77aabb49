//! Client-side data synchronization and step-up authorization for a loyalty
//! program: cached, deduplicated, visibility-aware polling of server counters,
//! optimistic mutations, a PIN-gated credential and role-based action hints.

pub mod actions;
pub mod app;
pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod loyalty;
pub mod sync;

pub use error::SyncError;
