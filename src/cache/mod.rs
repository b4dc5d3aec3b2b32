//! Versioned response cache and the strategies that read and write it.
//!
//! - Entries are keyed by request identity (GET + URL) within a namespace
//! - Namespaces are named after the deployed version and persist in SQLite
//! - Network-first serves documents, stale-while-revalidate serves assets

mod layer;
mod storage;
mod types;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage, StorageError};
pub use types::{CacheNamespace, CacheResult, CacheSource, CachedResponse, RequestIdentity};
