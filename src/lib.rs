//! Offline-first sync layer for the vehicle capture client.
//!
//! Three cooperating parts keep the client usable on flaky networks:
//! [`cache::CacheRouter`] answers reads from a versioned cache, [`queue::UploadQueue`]
//! holds submissions until they can be delivered, and [`auth::AuthPipeline`] attaches
//! credentials and refreshes them at most once per expiry. [`ResilientClient`] wires
//! them together.

pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod net;
pub mod queue;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use client::{ResilientClient, SubmitOutcome};
pub use config::Config;
pub use error::{SyncError, SyncResult};
