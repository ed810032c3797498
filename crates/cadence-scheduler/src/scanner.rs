//! Recurring-task scanner.
//!
//! Each tick takes the lock without waiting, turns every due registry record
//! into one queued instance, advances the records it enqueued and writes them
//! back in one batch. A tick that cannot get the lock is skipped; the next
//! one catches up.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::CallContext;
use crate::error::{Result, SchedulerError};
use crate::handle::{release, SchedulerHandle};
use crate::schedule;
use crate::types::{PeriodicTaskRecord, TaskInstance, TaskKind, Timing};

/// Completed instances of tasks firing at most this often get no retention.
const SHORT_GAP_SECS: i64 = 10;
const MAX_RETENTION_SECS: i64 = 600;

/// Outcome counts of one scan cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub scanned: usize,
    pub enqueued: usize,
    pub not_due: usize,
    /// Records whose previous instance was still live.
    pub conflicts: usize,
    pub failed: usize,
}

/// Retention for a completed instance given the gap to the next fire.
pub fn retention_for(gap_secs: i64) -> Duration {
    if gap_secs > SHORT_GAP_SECS {
        Duration::from_secs((gap_secs / 3).min(MAX_RETENTION_SECS) as u64)
    } else {
        Duration::ZERO
    }
}

pub struct Scanner {
    handle: SchedulerHandle,
    interval: Duration,
    cycle_timeout: Duration,
}

impl Scanner {
    pub fn new(handle: SchedulerHandle, interval: Duration, cycle_timeout: Duration) -> Self {
        Self {
            handle,
            interval,
            cycle_timeout,
        }
    }

    /// Tick every `interval` until `shutdown` fires. Cycle errors are logged.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "scanner started");
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_cycle().await {
                        Ok(report) if report.enqueued > 0 || report.failed > 0 => {
                            info!(?report, "scan cycle finished");
                        }
                        Ok(report) => debug!(?report, "scan cycle finished"),
                        Err(SchedulerError::LockTimeout { .. }) => {
                            debug!("scan skipped, lock held elsewhere");
                        }
                        Err(e) if e.is_retryable() => {
                            warn!(code = e.code(), "scan cycle incomplete, retrying next tick: {e}");
                        }
                        Err(e) => error!(code = e.code(), "scan cycle failed: {e}"),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("scanner shutting down");
                    break;
                }
            }
        }
    }

    /// One tick. Fails with `LockTimeout` when another instance is scanning.
    pub async fn run_cycle(&self) -> Result<ScanReport> {
        let guard = self.handle.lock().try_lock().await?;
        let ctx = CallContext::with_timeout(self.cycle_timeout);
        let outcome = self.scan(&ctx).await;
        release(guard).await;
        outcome
    }

    async fn scan(&self, ctx: &CallContext) -> Result<ScanReport> {
        let now = self.handle.clock().now();
        let records = self.handle.registry().list_all().await?;
        let mut report = ScanReport {
            scanned: records.len(),
            ..Default::default()
        };
        let mut staged = Vec::new();
        let mut cut_short = None;

        for mut record in records {
            if let Err(e) = ctx.check() {
                cut_short = Some(e);
                break;
            }
            if record.next_fire_time > now {
                report.not_due += 1;
                continue;
            }
            let next = match schedule::next_fire_time(&record.cron_expression, record.next_fire_time) {
                Ok(next) => next,
                Err(e) => {
                    warn!(uid = %record.uid, "record has an unusable expression: {e}");
                    report.failed += 1;
                    continue;
                }
            };

            let instance = self.instance_for(&record, next - record.next_fire_time);
            match self.handle.transport().enqueue(instance).await {
                Ok(_) => {
                    debug!(uid = %record.uid, at = record.next_fire_time, next, "periodic instance enqueued");
                    record.next_fire_time = next;
                    staged.push(record);
                    report.enqueued += 1;
                }
                Err(SchedulerError::Conflict { .. }) => {
                    debug!(uid = %record.uid, "previous instance still live, retrying next tick");
                    report.conflicts += 1;
                }
                Err(e) => {
                    warn!(uid = %record.uid, code = e.code(), "enqueue failed: {e}");
                    report.failed += 1;
                }
            }
        }

        // records already enqueued are advanced even when the cycle ran out of time
        self.handle.registry().write_back(&staged).await?;
        match cut_short {
            Some(e) => {
                warn!(enqueued = report.enqueued, "scan cut short: {e}");
                Err(e)
            }
            None => Ok(report),
        }
    }

    fn instance_for(&self, record: &PeriodicTaskRecord, gap_secs: i64) -> TaskInstance {
        TaskInstance {
            id: record.uid.clone(),
            kind: TaskKind::Periodic,
            group_key: record.group_key.clone(),
            payload: record.payload.clone(),
            max_retry: record.max_retry,
            timeout: Duration::from_secs(record.timeout_seconds),
            retention: retention_for(gap_secs),
            timing: Timing::At(record.next_fire_time),
            aggregation_group: self.handle.aggregation_group(&record.group_key),
        }
    }
}
