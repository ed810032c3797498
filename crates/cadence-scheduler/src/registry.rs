use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::store::KvStore;
use crate::types::PeriodicTaskRecord;

/// Persistent set of recurring definitions.
///
/// All records share one collection key in the KV store, keyed by uid inside
/// it. There is no versioning: read-modify-write cycles must run under the
/// distributed lock.
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn KvStore>,
    collection: String,
}

impl Registry {
    pub fn new(store: Arc<dyn KvStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub async fn upsert(&self, record: &PeriodicTaskRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.store
            .hash_set(&self.collection, &record.uid, bytes)
            .await
    }

    /// `None` when no record exists for `uid`.
    pub async fn get(&self, uid: &str) -> Result<Option<PeriodicTaskRecord>> {
        match self.store.hash_get(&self.collection, uid).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Removing a missing uid is not an error.
    pub async fn delete(&self, uid: &str) -> Result<()> {
        self.store.hash_delete(&self.collection, uid).await
    }

    /// Every decodable record, ordered by uid.
    pub async fn list_all(&self) -> Result<Vec<PeriodicTaskRecord>> {
        let raw = self.store.hash_get_all(&self.collection).await?;
        let mut records: Vec<PeriodicTaskRecord> = raw
            .into_iter()
            .filter_map(|(uid, bytes)| match serde_json::from_slice(&bytes) {
                Ok(rec) => Some(rec),
                Err(e) => {
                    warn!(%uid, collection = %self.collection, "skipping undecodable registry record: {e}");
                    None
                }
            })
            .collect();
        records.sort_by(|a, b| a.uid.cmp(&b.uid));
        Ok(records)
    }

    /// Persist several records in one batched store write.
    pub async fn write_back(&self, records: &[PeriodicTaskRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let entries = records
            .iter()
            .map(|r| Ok((r.uid.clone(), serde_json::to_vec(r)?)))
            .collect::<Result<Vec<_>>>()?;
        self.store.hash_set_many(&self.collection, entries).await?;
        debug!(count = records.len(), "registry write-back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;

    fn rec(uid: &str, next: i64) -> PeriodicTaskRecord {
        PeriodicTaskRecord {
            cron_expression: "* * * * *".into(),
            group_key: "default".into(),
            uid: uid.into(),
            payload: vec![1, 2, 3],
            next_fire_time: next,
            processed_count: 0,
            max_retry: 1,
            timeout_seconds: 30,
        }
    }

    #[tokio::test]
    async fn crud_and_ordering() {
        let registry = Registry::new(Arc::new(MemoryKvStore::new()), "reg");
        registry.upsert(&rec("b", 2)).await.unwrap();
        registry.upsert(&rec("a", 1)).await.unwrap();

        let uids: Vec<String> = registry
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.uid)
            .collect();
        assert_eq!(uids, vec!["a", "b"]);

        assert_eq!(registry.get("a").await.unwrap().unwrap().payload, vec![1, 2, 3]);
        registry.delete("a").await.unwrap();
        registry.delete("a").await.unwrap();
        assert!(registry.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_back_updates_in_one_batch() {
        let registry = Registry::new(Arc::new(MemoryKvStore::new()), "reg");
        registry.upsert(&rec("a", 1)).await.unwrap();
        registry
            .write_back(&[rec("a", 60), rec("c", 120)])
            .await
            .unwrap();
        assert_eq!(registry.get("a").await.unwrap().unwrap().next_fire_time, 60);
        assert_eq!(registry.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn corrupt_entries_are_skipped_by_list() {
        let store = Arc::new(MemoryKvStore::new());
        store.hash_set("reg", "junk", b"not json".to_vec()).await.unwrap();
        let registry = Registry::new(store, "reg");
        registry.upsert(&rec("ok", 1)).await.unwrap();

        let all = registry.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].uid, "ok");
        // a direct get still surfaces the decode failure
        assert!(registry.get("junk").await.is_err());
    }
}
