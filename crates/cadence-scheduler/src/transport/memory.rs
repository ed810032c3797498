use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::config::{AggregationConfig, WorkerConfig};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::QueueTransport;
use crate::aggregation::AggregationPolicy;
use crate::clock::Clock;
use crate::context::CallContext;
use crate::dispatcher::HandlerDispatcher;
use crate::error::{Result, SchedulerError};
use crate::types::{DeliveredTask, TaskInstance, TaskKind, TerminalInstance};

/// Lifecycle of an instance inside [`MemoryQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Waiting for its process-at time.
    Scheduled,
    /// Due, waiting for a worker slot.
    Pending,
    Active,
    /// Failed, waiting for its backoff to pass.
    Retry,
    /// Retries exhausted. Kept until deleted.
    Archived,
    /// Succeeded, kept for its retention window.
    Completed,
}

/// Point-in-time view of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub id: String,
    pub group_key: String,
    pub kind: TaskKind,
    pub state: InstanceState,
    pub process_at: i64,
    pub retried: u32,
    pub max_retry: u32,
    pub last_failed_at: Option<i64>,
    pub last_error: Option<String>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub aggregation: Option<AggregationPolicy>,
}

impl WorkerSettings {
    pub fn from_config(worker: &WorkerConfig, aggregation: &AggregationConfig) -> Self {
        Self {
            concurrency: worker.concurrency.max(1),
            poll_interval: Duration::from_millis(worker.poll_interval_ms.max(1)),
            aggregation: AggregationPolicy::from_config(aggregation),
        }
    }
}

#[derive(Debug)]
struct Stored {
    instance: TaskInstance,
    state: InstanceState,
    process_at: i64,
    retried: u32,
    last_failed_at: Option<i64>,
    last_error: Option<String>,
    completed_at: Option<i64>,
}

impl Stored {
    fn info(&self) -> InstanceInfo {
        InstanceInfo {
            id: self.instance.id.clone(),
            group_key: self.instance.group_key.clone(),
            kind: self.instance.kind,
            state: self.state,
            process_at: self.process_at,
            retried: self.retried,
            max_retry: self.instance.max_retry,
            last_failed_at: self.last_failed_at,
            last_error: self.last_error.clone(),
            payload: self.instance.payload.clone(),
        }
    }

    fn delivered(&self) -> DeliveredTask {
        DeliveredTask {
            id: self.instance.id.clone(),
            kind: self.instance.kind,
            group_key: self.instance.group_key.clone(),
            payload: self.instance.payload.clone(),
            retried: self.retried,
            timeout: self.instance.timeout,
            aggregation_group: self.instance.aggregation_group.clone(),
        }
    }

    fn is_waiting(&self) -> bool {
        matches!(
            self.state,
            InstanceState::Scheduled | InstanceState::Pending | InstanceState::Retry
        )
    }
}

type Key = (String, String);

/// In-process queue transport.
///
/// Instance ids are unique per group while the instance is live, archived, or
/// inside its completed-retention window. Failed instances are retried with a
/// linear backoff and archived once `max_retry` retries have been spent.
pub struct MemoryQueue {
    clock: Arc<dyn Clock>,
    retry_backoff: Duration,
    entries: Mutex<HashMap<Key, Stored>>,
}

impl MemoryQueue {
    pub fn new(clock: Arc<dyn Clock>, retry_backoff: Duration) -> Self {
        Self {
            clock,
            retry_backoff,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Key, Stored>> {
        // A panic while holding the guard cannot leave a half-written entry.
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn key(group_key: &str, id: &str) -> Key {
        (group_key.to_string(), id.to_string())
    }

    pub fn inspect(&self, group_key: &str, id: &str) -> Option<InstanceInfo> {
        self.entries()
            .get(&Self::key(group_key, id))
            .map(Stored::info)
    }

    /// Every instance, ordered by group then id.
    pub fn instances(&self) -> Vec<InstanceInfo> {
        let mut all: Vec<InstanceInfo> = self.entries().values().map(Stored::info).collect();
        all.sort_by(|a, b| (&a.group_key, &a.id).cmp(&(&b.group_key, &b.id)));
        all
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim every waiting instance whose process-at time has come, oldest
    /// first, and mark it active.
    pub fn take_due(&self) -> Vec<DeliveredTask> {
        let now = self.clock.now();
        let mut entries = self.entries();
        let mut due: Vec<&mut Stored> = entries
            .values_mut()
            .filter(|s| s.is_waiting() && s.process_at <= now)
            .collect();
        due.sort_by(|a, b| (a.process_at, &a.instance.id).cmp(&(b.process_at, &b.instance.id)));
        due.into_iter()
            .map(|s| {
                s.state = InstanceState::Active;
                s.delivered()
            })
            .collect()
    }

    /// Record the outcome of an active instance.
    pub fn complete(&self, group_key: &str, id: &str, outcome: std::result::Result<(), String>) {
        let now = self.clock.now();
        let key = Self::key(group_key, id);
        let mut entries = self.entries();
        let forget = match entries.get(&key) {
            Some(stored) => outcome.is_ok() && stored.instance.retention.is_zero(),
            // deleted while it was running
            None => return,
        };
        if forget {
            entries.remove(&key);
            return;
        }
        let Some(stored) = entries.get_mut(&key) else {
            return;
        };

        match outcome {
            Ok(()) => {
                stored.state = InstanceState::Completed;
                stored.completed_at = Some(now);
            }
            Err(msg) => {
                stored.last_failed_at = Some(now);
                stored.last_error = Some(msg);
                if stored.retried >= stored.instance.max_retry {
                    stored.state = InstanceState::Archived;
                    warn!(%group_key, %id, retried = stored.retried, "instance archived");
                } else {
                    stored.retried += 1;
                    stored.state = InstanceState::Retry;
                    stored.process_at =
                        now + (self.retry_backoff.as_secs() * stored.retried as u64) as i64;
                    debug!(%group_key, %id, retried = stored.retried, at = stored.process_at, "instance scheduled for retry");
                }
            }
        }
    }

    /// Move an instance straight to the archive, whatever its state.
    pub fn archive(&self, group_key: &str, id: &str) -> bool {
        let now = self.clock.now();
        match self.entries().get_mut(&Self::key(group_key, id)) {
            Some(stored) => {
                stored.state = InstanceState::Archived;
                stored.last_failed_at.get_or_insert(now);
                true
            }
            None => false,
        }
    }

    /// Hand an active instance back to the pending set without counting an attempt.
    pub fn requeue(&self, group_key: &str, id: &str) {
        if let Some(stored) = self.entries().get_mut(&Self::key(group_key, id)) {
            if stored.state == InstanceState::Active {
                stored.state = InstanceState::Pending;
            }
        }
    }

    /// Worker loop: poll for due instances and run them through `dispatcher`
    /// until `shutdown` fires, then wait for in-flight work.
    pub async fn run_worker(
        self: Arc<Self>,
        dispatcher: Arc<HandlerDispatcher>,
        settings: WorkerSettings,
        shutdown: CancellationToken,
    ) {
        info!(
            concurrency = settings.concurrency,
            aggregation = settings.aggregation.is_some(),
            "queue worker started"
        );
        let slots = Arc::new(Semaphore::new(settings.concurrency));
        let mut running: JoinSet<()> = JoinSet::new();
        let mut buffers: HashMap<String, GroupBuffer> = HashMap::new();
        let mut interval = tokio::time::interval(settings.poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            while let Some(res) = running.try_join_next() {
                if let Err(e) = res {
                    error!("worker task panicked: {e}");
                }
            }

            for task in self.take_due() {
                match (&settings.aggregation, task.aggregation_group.clone()) {
                    (Some(_), Some(group)) => buffers.entry(group).or_default().push(task),
                    _ => {
                        let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                            break;
                        };
                        let queue = Arc::clone(&self);
                        let dispatcher = Arc::clone(&dispatcher);
                        running.spawn(async move {
                            let _permit = permit;
                            queue.run_one(&dispatcher, task).await;
                        });
                    }
                }
            }

            if let Some(policy) = &settings.aggregation {
                let ready: Vec<String> = buffers
                    .iter()
                    .filter(|(_, b)| b.ready(policy))
                    .map(|(g, _)| g.clone())
                    .collect();
                for group in ready {
                    let Some(buffer) = buffers.remove(&group) else {
                        continue;
                    };
                    let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                        break;
                    };
                    let queue = Arc::clone(&self);
                    let dispatcher = Arc::clone(&dispatcher);
                    running.spawn(async move {
                        let _permit = permit;
                        queue.run_batch(&dispatcher, buffer.tasks).await;
                    });
                }
            }
        }

        for buffer in buffers.into_values() {
            for task in buffer.tasks {
                self.requeue(&task.group_key, &task.id);
            }
        }
        while let Some(res) = running.join_next().await {
            if let Err(e) = res {
                error!("worker task panicked: {e}");
            }
        }
        info!("queue worker stopped");
    }

    async fn run_one(&self, dispatcher: &HandlerDispatcher, task: DeliveredTask) {
        let (group_key, id, timeout) = (task.group_key.clone(), task.id.clone(), task.timeout);
        let ctx = context_for(timeout);
        let outcome = with_timeout(timeout, dispatcher.dispatch(&ctx, task)).await;
        if let Err(e) = &outcome {
            warn!(%group_key, %id, "instance failed: {e}");
        }
        self.complete(&group_key, &id, outcome);
    }

    async fn run_batch(&self, dispatcher: &HandlerDispatcher, batch: Vec<DeliveredTask>) {
        let timeout = batch
            .iter()
            .map(|t| t.timeout)
            .max()
            .unwrap_or(Duration::ZERO);
        let members: Vec<(String, String)> = batch
            .iter()
            .map(|t| (t.group_key.clone(), t.id.clone()))
            .collect();
        debug!(size = members.len(), "delivering aggregated batch");

        let ctx = context_for(timeout);
        let outcome = with_timeout(timeout, dispatcher.dispatch_batch(&ctx, batch)).await;
        if let Err(e) = &outcome {
            warn!(size = members.len(), "aggregated batch failed: {e}");
        }
        for (group_key, id) in members {
            self.complete(&group_key, &id, outcome.clone());
        }
    }
}

fn context_for(timeout: Duration) -> CallContext {
    if timeout.is_zero() {
        CallContext::new()
    } else {
        CallContext::with_timeout(timeout)
    }
}

/// A zero timeout means unbounded.
async fn with_timeout<F>(timeout: Duration, fut: F) -> std::result::Result<(), String>
where
    F: std::future::Future<Output = Result<()>>,
{
    let res = if timeout.is_zero() {
        fut.await
    } else {
        match tokio::time::timeout(timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(SchedulerError::DeadlineExceeded),
        }
    };
    res.map_err(|e| e.to_string())
}

#[derive(Default)]
struct GroupBuffer {
    tasks: Vec<DeliveredTask>,
    first_at: Option<Instant>,
    newest_at: Option<Instant>,
}

impl GroupBuffer {
    fn push(&mut self, task: DeliveredTask) {
        let now = Instant::now();
        self.first_at.get_or_insert(now);
        self.newest_at = Some(now);
        self.tasks.push(task);
    }

    fn ready(&self, policy: &AggregationPolicy) -> bool {
        let now = Instant::now();
        let since = |t: Option<Instant>| t.map(|t| now.duration_since(t)).unwrap_or_default();
        policy.should_flush(self.tasks.len(), since(self.newest_at), since(self.first_at))
    }
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn enqueue(&self, instance: TaskInstance) -> Result<String> {
        let now = self.clock.now();
        let mut entries = self.entries();
        entries.retain(|_, s| match (s.state, s.completed_at) {
            (InstanceState::Completed, Some(done)) => {
                done + s.instance.retention.as_secs() as i64 > now
            }
            _ => true,
        });

        let key = Self::key(&instance.group_key, &instance.id);
        if entries.contains_key(&key) {
            return Err(SchedulerError::Conflict {
                group: instance.group_key,
                id: instance.id,
            });
        }

        let process_at = instance.timing.process_at(now);
        let state = if process_at <= now {
            InstanceState::Pending
        } else {
            InstanceState::Scheduled
        };
        let id = instance.id.clone();
        debug!(group_key = %instance.group_key, %id, process_at, "instance enqueued");
        entries.insert(
            key,
            Stored {
                instance,
                state,
                process_at,
                retried: 0,
                last_failed_at: None,
                last_error: None,
                completed_at: None,
            },
        );
        Ok(id)
    }

    async fn delete_instance(&self, group_key: &str, id: &str) -> Result<()> {
        if self.entries().remove(&Self::key(group_key, id)).is_some() {
            debug!(%group_key, %id, "instance deleted");
        }
        Ok(())
    }

    async fn list_terminal(
        &self,
        group_key: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<TerminalInstance>> {
        let entries = self.entries();
        let mut archived: Vec<TerminalInstance> = entries
            .values()
            .filter(|s| s.state == InstanceState::Archived && s.instance.group_key == group_key)
            .map(|s| TerminalInstance {
                id: s.instance.id.clone(),
                kind: s.instance.kind,
                group_key: s.instance.group_key.clone(),
                retried: s.retried,
                max_retry: s.instance.max_retry,
                timeout: s.instance.timeout,
                last_failed_at: s.last_failed_at.unwrap_or_default(),
            })
            .collect();
        archived.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(archived
            .into_iter()
            .skip(page.saturating_mul(page_size))
            .take(page_size)
            .collect())
    }
}
