use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, TransactionBehavior};
use tracing::debug;

use super::KvStore;
use crate::db::init_db;
use crate::error::{Result, SchedulerError};

/// How long a connection waits on another process's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// [`KvStore`] on a SQLite file.
///
/// Cooperating processes on one host point at the same file; lock rows use
/// wall-clock expiry so a crashed holder is superseded after its TTL.
pub struct SqliteKvStore {
    conn: Mutex<Connection>,
}

impl SqliteKvStore {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(Connection::open(path)?)
    }

    /// Wrap an already-open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::Store("sqlite connection mutex poisoned".to_string()))
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn hash_get(&self, collection: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn()?;
        match conn.query_row(
            "SELECT value FROM registry_entries WHERE collection = ?1 AND field = ?2",
            rusqlite::params![collection, field],
            |row| row.get::<_, Vec<u8>>(0),
        ) {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn hash_set(&self, collection: &str, field: &str, value: Vec<u8>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO registry_entries (collection, field, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (collection, field) DO UPDATE SET value = excluded.value",
            rusqlite::params![collection, field, value],
        )?;
        Ok(())
    }

    async fn hash_set_many(&self, collection: &str, entries: Vec<(String, Vec<u8>)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO registry_entries (collection, field, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT (collection, field) DO UPDATE SET value = excluded.value",
            )?;
            for (field, value) in &entries {
                stmt.execute(rusqlite::params![collection, field, value])?;
            }
        }
        tx.commit()?;
        debug!(collection, count = entries.len(), "batched hash write");
        Ok(())
    }

    async fn hash_delete(&self, collection: &str, field: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM registry_entries WHERE collection = ?1 AND field = ?2",
            rusqlite::params![collection, field],
        )?;
        Ok(())
    }

    async fn hash_get_all(&self, collection: &str) -> Result<HashMap<String, Vec<u8>>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare_cached("SELECT field, value FROM registry_entries WHERE collection = ?1")?;
        let rows = stmt.query_map([collection], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (field, value) = row?;
            out.insert(field, value);
        }
        Ok(out)
    }

    async fn lock_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let expires_at_ms = now_ms + ttl.as_millis() as i64;

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        // A lapsed claim no longer counts.
        tx.execute(
            "DELETE FROM locks WHERE key = ?1 AND expires_at_ms <= ?2",
            rusqlite::params![key, now_ms],
        )?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO locks (key, token, expires_at_ms) VALUES (?1, ?2, ?3)",
            rusqlite::params![key, token, expires_at_ms],
        )?;
        tx.commit()?;
        Ok(inserted == 1)
    }

    async fn lock_release(&self, key: &str, token: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM locks WHERE key = ?1 AND token = ?2",
            rusqlite::params![key, token],
        )?;
        Ok(n == 1)
    }
}
