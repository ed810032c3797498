use std::sync::Arc;

use cadence_core::config::{CadenceConfig, DEFAULT_GROUP, DEFAULT_REGISTRY_KEY};
use tracing::{debug, info, instrument, warn};

use crate::aggregation::AggregationPolicy;
use crate::clock::{Clock, SystemClock};
use crate::context::CallContext;
use crate::error::{Result, SchedulerError};
use crate::lock::{DistributedLock, LockGuard, LockSettings};
use crate::options::RunOptions;
use crate::registry::Registry;
use crate::schedule;
use crate::store::KvStore;
use crate::transport::QueueTransport;
use crate::types::{PeriodicTaskRecord, TaskInstance, TaskKind};

/// Shared handle for submitting, removing and inspecting work.
///
/// Built once and cloned into every component that needs it (scanner,
/// sweeper, dispatcher, handlers that resubmit work). Cloning is cheap.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    lock: DistributedLock,
    transport: Arc<dyn QueueTransport>,
    clock: Arc<dyn Clock>,
    default_group: String,
    aggregation: Option<AggregationPolicy>,
}

pub struct SchedulerHandleBuilder {
    store: Arc<dyn KvStore>,
    transport: Arc<dyn QueueTransport>,
    clock: Arc<dyn Clock>,
    registry_key: String,
    default_group: String,
    lock: LockSettings,
    aggregation: Option<AggregationPolicy>,
}

impl SchedulerHandleBuilder {
    /// Take registry key, default group, lock and aggregation settings from config.
    pub fn config(mut self, config: &CadenceConfig) -> Self {
        self.registry_key = config.scheduler.registry_key.clone();
        self.default_group = config.scheduler.default_group.clone();
        self.lock = LockSettings::from(&config.lock);
        self.aggregation = AggregationPolicy::from_config(&config.aggregation);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn lock_settings(mut self, settings: LockSettings) -> Self {
        self.lock = settings;
        self
    }

    pub fn registry_key(mut self, key: impl Into<String>) -> Self {
        self.registry_key = key.into();
        self
    }

    pub fn default_group(mut self, group: impl Into<String>) -> Self {
        self.default_group = group.into();
        self
    }

    pub fn aggregation(mut self, policy: Option<AggregationPolicy>) -> Self {
        self.aggregation = policy;
        self
    }

    pub fn build(self) -> SchedulerHandle {
        SchedulerHandle {
            inner: Arc::new(Inner {
                registry: Registry::new(Arc::clone(&self.store), self.registry_key),
                lock: DistributedLock::new(self.store, self.lock),
                transport: self.transport,
                clock: self.clock,
                default_group: self.default_group,
                aggregation: self.aggregation,
            }),
        }
    }
}

impl SchedulerHandle {
    pub fn builder(store: Arc<dyn KvStore>, transport: Arc<dyn QueueTransport>) -> SchedulerHandleBuilder {
        SchedulerHandleBuilder {
            store,
            transport,
            clock: Arc::new(SystemClock),
            registry_key: DEFAULT_REGISTRY_KEY.to_string(),
            default_group: DEFAULT_GROUP.to_string(),
            lock: LockSettings::default(),
            aggregation: None,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.inner.lock
    }

    pub fn transport(&self) -> &Arc<dyn QueueTransport> {
        &self.inner.transport
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn default_group(&self) -> &str {
        &self.inner.default_group
    }

    pub fn aggregation(&self) -> Option<&AggregationPolicy> {
        self.inner.aggregation.as_ref()
    }

    /// Aggregation tag for instances of `group_key` while aggregation is on.
    pub(crate) fn aggregation_group(&self, group_key: &str) -> Option<String> {
        self.inner.aggregation.as_ref().map(|_| group_key.to_string())
    }

    fn group_of(&self, opts: &RunOptions) -> String {
        opts.group
            .clone()
            .unwrap_or_else(|| self.inner.default_group.clone())
    }

    /// Submit a one-shot instance. Returns the instance id (the uid).
    #[instrument(skip(self, opts), fields(uid = %opts.uid))]
    pub async fn submit_once(&self, opts: RunOptions) -> Result<String> {
        opts.validate_uid()?;
        opts.context.check()?;
        let timing = opts.timing()?;
        let group_key = self.group_of(&opts);

        let instance = TaskInstance {
            id: opts.uid.clone(),
            kind: TaskKind::Once,
            aggregation_group: self.aggregation_group(&group_key),
            group_key,
            payload: opts.payload,
            max_retry: opts.max_retry,
            timeout: opts.timeout,
            retention: opts.retention.unwrap_or_default(),
            timing,
        };

        match self.inner.transport.enqueue(instance.clone()).await {
            Err(SchedulerError::Conflict { group, id }) if opts.replace_on_conflict => {
                info!(%group, %id, "replacing conflicting instance");
                self.inner.transport.delete_instance(&group, &id).await?;
                opts.context.check()?;
                self.inner.transport.enqueue(instance).await
            }
            other => other,
        }
    }

    /// Register (or replace) a recurring definition.
    ///
    /// A changed expression deletes the instance generated under the old one
    /// and restarts the processed count; an unchanged one carries it over.
    #[instrument(skip(self, opts), fields(uid = %opts.uid))]
    pub async fn submit_cron(&self, opts: RunOptions) -> Result<PeriodicTaskRecord> {
        opts.validate_uid()?;
        let expr = opts
            .cron
            .clone()
            .ok_or_else(|| SchedulerError::InvalidOptions("a cron expression is required".into()))?;
        schedule::validate_expression(&expr)?;
        let next = schedule::next_fire_time(&expr, self.inner.clock.now())?;

        let record = PeriodicTaskRecord {
            cron_expression: expr,
            group_key: self.group_of(&opts),
            uid: opts.uid.clone(),
            payload: opts.payload.clone(),
            next_fire_time: next,
            processed_count: 0,
            max_retry: opts.max_retry,
            timeout_seconds: opts.timeout.as_secs(),
        };

        let guard = self.inner.lock.lock(&opts.context).await?;
        let outcome = self.replace_record(record).await;
        release(guard).await;
        let record = outcome?;
        info!(next = record.next_fire_time, expr = %record.cron_expression, "periodic task registered");
        Ok(record)
    }

    async fn replace_record(&self, mut record: PeriodicTaskRecord) -> Result<PeriodicTaskRecord> {
        if let Some(old) = self.inner.registry.get(&record.uid).await? {
            if old.cron_expression == record.cron_expression {
                record.processed_count = old.processed_count;
            } else {
                debug!(uid = %record.uid, old = %old.cron_expression, "expression changed, dropping old lineage");
                self.inner
                    .transport
                    .delete_instance(&old.group_key, &old.uid)
                    .await?;
            }
        }
        self.inner.registry.upsert(&record).await?;
        Ok(record)
    }

    /// Delete a recurring definition and any instance with its id. Idempotent.
    #[instrument(skip(self, ctx))]
    pub async fn remove(&self, ctx: &CallContext, uid: &str) -> Result<()> {
        let guard = self.inner.lock.lock(ctx).await?;
        let outcome = async {
            let group_key = match self.inner.registry.get(uid).await? {
                Some(record) => record.group_key,
                None => self.inner.default_group.clone(),
            };
            self.inner.registry.delete(uid).await?;
            self.inner.transport.delete_instance(&group_key, uid).await
        }
        .await;
        release(guard).await;
        outcome?;
        info!("task removed");
        Ok(())
    }

    /// All recurring definitions, ordered by uid. Read outside the lock.
    pub async fn list_periodic(&self) -> Result<Vec<PeriodicTaskRecord>> {
        self.inner.registry.list_all().await
    }

    pub async fn periodic_task(&self, uid: &str) -> Result<PeriodicTaskRecord> {
        self.inner
            .registry
            .get(uid)
            .await?
            .ok_or_else(|| SchedulerError::NotFound { uid: uid.to_string() })
    }

    /// Add one completion to each uid's processed count under the lock.
    /// Uids without a record are skipped. Returns how many records changed.
    ///
    /// Waits up to two lock TTLs rather than the submission retry budget:
    /// any holder gives the lock up within one TTL, so a completion is only
    /// lost if `ctx` ends first.
    pub async fn increment_processed(&self, ctx: &CallContext, uids: &[String]) -> Result<usize> {
        if uids.is_empty() {
            return Ok(0);
        }
        let window = self.inner.lock.settings().ttl * 2;
        let guard = self.inner.lock.lock_within(ctx, window).await?;
        let outcome = async {
            let mut updated = Vec::with_capacity(uids.len());
            for uid in uids {
                // one batch can carry the same uid twice; count both
                if let Some(staged) = updated
                    .iter_mut()
                    .find(|r: &&mut PeriodicTaskRecord| r.uid == *uid)
                {
                    staged.processed_count += 1;
                    continue;
                }
                let Some(mut record) = self.inner.registry.get(uid).await? else {
                    continue;
                };
                record.processed_count += 1;
                updated.push(record);
            }
            self.inner.registry.write_back(&updated).await?;
            Ok::<_, SchedulerError>(updated.len())
        }
        .await;
        release(guard).await;
        outcome
    }
}

/// Release a guard, logging instead of failing: the TTL covers a lost release.
pub(crate) async fn release(guard: LockGuard) {
    let key = guard.key().to_string();
    if let Err(e) = guard.release().await {
        warn!(%key, "lock release failed: {e}");
    }
}
