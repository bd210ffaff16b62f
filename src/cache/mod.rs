//! Versioned response cache for read requests.
//!
//! Requests are classified into one of four strategies, and each strategy stores
//! its entries in the namespace of one asset class for the active cache version:
//! - cache-first for the precache manifest (`static-<version>`)
//! - cache-first with background refresh for images (`images-<version>`)
//! - network-first with offline fallback for the API surface (`api-<version>`)
//! - stale-while-revalidate for everything else (`misc-<version>`)
//!
//! A new version is installed alongside the current one and only replaces it on
//! activation, which deletes every namespace of older versions.

mod classify;
mod keys;
mod router;
mod storage;
mod traits;

pub use classify::RouteRules;
pub use keys::RequestKey;
pub use router::{Activation, CacheRouter};
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{AssetClass, CacheEntry, CacheNamespace, CacheResult, CacheSource, Strategy};
