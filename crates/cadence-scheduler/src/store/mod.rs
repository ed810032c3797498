//! Key-value collaborator: hash-like collections plus TTL-bounded locks.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

mod memory;
mod sqlite;

pub use memory::MemoryKvStore;
pub use sqlite::SqliteKvStore;

/// Storage backend shared by every component of a deployment.
///
/// Implementations must be safe for concurrent use. Lock operations are
/// keyed by an owner `token` so an expired holder cannot release a lock that
/// has since passed to someone else.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn hash_get(&self, collection: &str, field: &str) -> Result<Option<Vec<u8>>>;

    async fn hash_set(&self, collection: &str, field: &str, value: Vec<u8>) -> Result<()>;

    /// Write several fields in one operation.
    async fn hash_set_many(&self, collection: &str, entries: Vec<(String, Vec<u8>)>) -> Result<()>;

    /// Deleting a missing field is not an error.
    async fn hash_delete(&self, collection: &str, field: &str) -> Result<()>;

    async fn hash_get_all(&self, collection: &str) -> Result<HashMap<String, Vec<u8>>>;

    /// Take `key` for `token` unless someone else holds an unexpired claim.
    async fn lock_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Release `key` if `token` still holds it. Returns whether anything was released.
    async fn lock_release(&self, key: &str, token: &str) -> Result<bool>;
}
