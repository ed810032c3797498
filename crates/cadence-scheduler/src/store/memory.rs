use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use super::KvStore;
use crate::error::Result;

struct LockEntry {
    token: String,
    expires_at: Instant,
}

/// In-process [`KvStore`]. Handles cloned from one `Arc<MemoryKvStore>`
/// share state, which is how tests simulate several cooperating instances.
#[derive(Default)]
pub struct MemoryKvStore {
    hashes: DashMap<String, HashMap<String, Vec<u8>>>,
    locks: DashMap<String, LockEntry>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn hash_get(&self, collection: &str, field: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .hashes
            .get(collection)
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hash_set(&self, collection: &str, field: &str, value: Vec<u8>) -> Result<()> {
        self.hashes
            .entry(collection.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hash_set_many(&self, collection: &str, entries: Vec<(String, Vec<u8>)>) -> Result<()> {
        // one shard guard for the whole batch
        let mut hash = self.hashes.entry(collection.to_string()).or_default();
        hash.extend(entries);
        Ok(())
    }

    async fn hash_delete(&self, collection: &str, field: &str) -> Result<()> {
        if let Some(mut hash) = self.hashes.get_mut(collection) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn hash_get_all(&self, collection: &str) -> Result<HashMap<String, Vec<u8>>> {
        Ok(self
            .hashes
            .get(collection)
            .map(|h| h.clone())
            .unwrap_or_default())
    }

    async fn lock_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let fresh = LockEntry {
            token: token.to_string(),
            expires_at: now + ttl,
        };
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().expires_at <= now {
                    held.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn lock_release(&self, key: &str, token: &str) -> Result<bool> {
        Ok(self
            .locks
            .remove_if(key, |_, held| held.token == token)
            .is_some())
    }
}
