//! TTL-bounded mutual exclusion over the KV store.
//!
//! The TTL is a liveness net: a process that dies while holding the lock
//! stops blocking everyone else once the TTL lapses.

use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::LockConfig;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::CallContext;
use crate::error::{Result, SchedulerError};
use crate::store::KvStore;

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub key: String,
    pub ttl: Duration,
    pub retry_attempts: u32,
    pub retry_interval: Duration,
}

impl From<&LockConfig> for LockSettings {
    fn from(cfg: &LockConfig) -> Self {
        Self {
            key: cfg.key.clone(),
            ttl: Duration::from_secs(cfg.ttl_secs),
            retry_attempts: cfg.retry_attempts.max(1),
            retry_interval: Duration::from_millis(cfg.retry_interval_ms),
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

/// One named lock shared by every cooperating instance pointing at the same store.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KvStore>,
    settings: Arc<LockSettings>,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn KvStore>, settings: LockSettings) -> Self {
        Self {
            store,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Block until acquired, retrying at a fixed interval.
    ///
    /// Gives up with `LockTimeout` after `retry_attempts`, or with the
    /// context's error as soon as it is cancelled or past its deadline.
    pub async fn lock(&self, ctx: &CallContext) -> Result<LockGuard> {
        self.acquire(ctx, self.settings.retry_attempts).await
    }

    /// Like [`lock`](Self::lock), but keeps retrying at the same interval for
    /// up to `window` instead of the configured attempt budget.
    pub async fn lock_within(&self, ctx: &CallContext, window: Duration) -> Result<LockGuard> {
        let interval = self.settings.retry_interval.max(Duration::from_millis(1));
        let attempts = u32::try_from(window.as_millis() / interval.as_millis())
            .unwrap_or(u32::MAX)
            .saturating_add(1)
            .max(self.settings.retry_attempts);
        self.acquire(ctx, attempts).await
    }

    /// One attempt; `LockTimeout` if someone else holds the lock.
    pub async fn try_lock(&self) -> Result<LockGuard> {
        self.acquire(&CallContext::new(), 1).await
    }

    async fn acquire(&self, ctx: &CallContext, attempts: u32) -> Result<LockGuard> {
        let key = &self.settings.key;
        let token = Uuid::new_v4().to_string();

        for attempt in 1..=attempts {
            ctx.check()?;
            if self
                .store
                .lock_acquire(key, &token, self.settings.ttl)
                .await?
            {
                debug!(%key, attempt, "lock acquired");
                return Ok(LockGuard {
                    store: Arc::clone(&self.store),
                    key: key.clone(),
                    token,
                    released: false,
                });
            }
            if attempt < attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.retry_interval) => {}
                    err = ctx.done() => return Err(err),
                }
            }
        }

        Err(SchedulerError::LockTimeout {
            key: key.clone(),
            attempts,
        })
    }
}

/// Proof of holding the lock. Call [`LockGuard::release`] on every path.
#[must_use = "the lock stays held until release() or TTL expiry"]
pub struct LockGuard {
    store: Arc<dyn KvStore>,
    key: String,
    token: String,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock. A no-op if the TTL already handed it to someone else.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let released = self.store.lock_release(&self.key, &self.token).await?;
        if released {
            debug!(key = %self.key, "lock released");
        } else {
            warn!(key = %self.key, "lock was no longer held at release (ttl expired?)");
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Dropped without release (early return or panic): release in the
        // background so other instances do not wait out the full TTL.
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                if let Err(e) = store.lock_release(&key, &token).await {
                    warn!(%key, "background lock release failed: {e}");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(attempts: u32, interval_ms: u64) -> LockSettings {
        LockSettings {
            key: "test:lock".into(),
            ttl: Duration::from_secs(30),
            retry_attempts: attempts,
            retry_interval: Duration::from_millis(interval_ms),
        }
    }

    #[tokio::test]
    async fn second_holder_times_out() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let a = DistributedLock::new(Arc::clone(&store), settings(3, 1));
        let b = DistributedLock::new(store, settings(3, 1));

        let guard = a.lock(&CallContext::new()).await.unwrap();
        let err = b.lock(&CallContext::new()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::LockTimeout { attempts: 3, .. }));
        assert!(matches!(
            b.try_lock().await,
            Err(SchedulerError::LockTimeout { attempts: 1, .. })
        ));

        guard.release().await.unwrap();
        b.try_lock().await.unwrap().release().await.unwrap();
    }

    #[tokio::test]
    async fn waiter_gets_lock_after_release() {
        let lock = DistributedLock::new(Arc::new(MemoryKvStore::new()), settings(100, 5));
        let guard = lock.lock(&CallContext::new()).await.unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.lock(&CallContext::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.release().await.unwrap();

        let second = waiter.await.unwrap().unwrap();
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_context_aborts_wait() {
        let lock = DistributedLock::new(Arc::new(MemoryKvStore::new()), settings(1_000, 50));
        let _held = lock.try_lock().await.unwrap();

        let ctx = CallContext::new();
        let waiter = {
            let lock = lock.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { lock.lock(&ctx).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.cancel();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(SchedulerError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn deadline_aborts_wait() {
        let lock = DistributedLock::new(Arc::new(MemoryKvStore::new()), settings(1_000, 50));
        let _held = lock.try_lock().await.unwrap();
        let ctx = CallContext::with_timeout(Duration::from_millis(30));
        assert!(matches!(
            lock.lock(&ctx).await,
            Err(SchedulerError::DeadlineExceeded)
        ));
    }

    #[tokio::test]
    async fn lock_within_outlasts_the_attempt_budget() {
        let lock = DistributedLock::new(Arc::new(MemoryKvStore::new()), settings(3, 10));
        let held = lock.try_lock().await.unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.lock_within(&CallContext::new(), Duration::from_secs(5)).await
            })
        };
        assert!(matches!(
            lock.lock(&CallContext::new()).await,
            Err(SchedulerError::LockTimeout { attempts: 3, .. })
        ));
        tokio::time::sleep(Duration::from_millis(150)).await;
        held.release().await.unwrap();

        waiter.await.unwrap().unwrap().release().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_guard_is_released_in_background() {
        let lock = DistributedLock::new(Arc::new(MemoryKvStore::new()), settings(50, 2));
        drop(lock.try_lock().await.unwrap());
        let again = lock.lock(&CallContext::new()).await.unwrap();
        again.release().await.unwrap();
    }

    #[tokio::test]
    async fn holders_never_overlap() {
        let lock = DistributedLock::new(Arc::new(MemoryKvStore::new()), settings(2_000, 1));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let lock = lock.clone();
            let inside = Arc::clone(&inside);
            let max_seen = Arc::clone(&max_seen);
            tasks.push(tokio::spawn(async move {
                let guard = lock.lock(&CallContext::new()).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                guard.release().await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
