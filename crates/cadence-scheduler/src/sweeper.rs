use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::CallContext;
use crate::error::Result;
use crate::handle::SchedulerHandle;
use crate::schedule;
use crate::types::{PeriodicTaskRecord, TaskKind, TerminalInstance};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// How long a terminal instance is kept after its last failure.
///
/// Frequent recurring tasks are purged quickly; rare ones keep their failure
/// history longer. One-shot instances, and periodic ones whose gap is
/// unknown, get the flat minimum.
pub fn grace_period(kind: TaskKind, gap_secs: Option<i64>) -> Duration {
    let gap = match (kind, gap_secs) {
        (TaskKind::Periodic, Some(gap)) => gap,
        _ => return Duration::from_secs(5 * MINUTE),
    };
    let secs = match gap {
        g if g <= 60 => 5 * MINUTE,
        g if g <= 600 => 30 * MINUTE,
        g if g <= 3_600 => 2 * HOUR,
        _ => 5 * HOUR,
    };
    Duration::from_secs(secs)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub inspected: usize,
    pub purged: usize,
    pub kept: usize,
}

/// Purges archived instances of one group once their grace period is over.
pub struct ArchiveSweeper {
    handle: SchedulerHandle,
    group: String,
    page_size: usize,
    interval: Duration,
    cycle_timeout: Duration,
}

impl ArchiveSweeper {
    pub fn new(
        handle: SchedulerHandle,
        group: impl Into<String>,
        page_size: usize,
        interval: Duration,
        cycle_timeout: Duration,
    ) -> Self {
        Self {
            handle,
            group: group.into(),
            page_size: page_size.max(1),
            interval,
            cycle_timeout,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(group = %self.group, interval_secs = self.interval.as_secs(), "archive sweeper started");
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_cycle().await {
                        Ok(report) if report.purged > 0 => info!(?report, "sweep finished"),
                        Ok(report) => debug!(?report, "sweep finished"),
                        Err(e) if e.is_retryable() => warn!(code = e.code(), "sweep incomplete, retrying next tick: {e}"),
                        Err(e) => error!(code = e.code(), "sweep failed: {e}"),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("archive sweeper shutting down");
                    break;
                }
            }
        }
    }

    pub async fn run_cycle(&self) -> Result<SweepReport> {
        let ctx = CallContext::with_timeout(self.cycle_timeout);
        let terminal = self.collect(&ctx).await?;
        let records: HashMap<String, PeriodicTaskRecord> = self
            .handle
            .list_periodic()
            .await?
            .into_iter()
            .map(|r| (r.uid.clone(), r))
            .collect();

        let now = self.handle.clock().now();
        let mut report = SweepReport {
            inspected: terminal.len(),
            ..Default::default()
        };
        for instance in terminal {
            ctx.check()?;
            if instance.may_still_retry(now) {
                debug!(id = %instance.id, retried = instance.retried, "instance may still be retried, skipping");
                report.kept += 1;
                continue;
            }
            let gap = records.get(&instance.id).and_then(recurrence_gap);
            let grace = grace_period(instance.kind, gap);
            if now < instance.last_failed_at + grace.as_secs() as i64 {
                report.kept += 1;
                continue;
            }
            match self
                .handle
                .transport()
                .delete_instance(&instance.group_key, &instance.id)
                .await
            {
                Ok(()) => {
                    debug!(id = %instance.id, grace_secs = grace.as_secs(), "terminal instance purged");
                    report.purged += 1;
                }
                Err(e) if e.is_retryable() => {
                    debug!(id = %instance.id, "purge deferred to next sweep: {e}");
                    report.kept += 1;
                }
                Err(e) => {
                    warn!(id = %instance.id, code = e.code(), "purge failed: {e}");
                    report.kept += 1;
                }
            }
        }
        Ok(report)
    }

    /// Every page up front, so deletions cannot shift later pages.
    async fn collect(&self, ctx: &CallContext) -> Result<Vec<TerminalInstance>> {
        let mut all = Vec::new();
        for page in 0.. {
            ctx.check()?;
            let batch = self
                .handle
                .transport()
                .list_terminal(&self.group, page, self.page_size)
                .await?;
            let last = batch.len() < self.page_size;
            all.extend(batch);
            if last {
                break;
            }
        }
        Ok(all)
    }
}

fn recurrence_gap(record: &PeriodicTaskRecord) -> Option<i64> {
    schedule::next_fire_time(&record.cron_expression, record.next_fire_time)
        .ok()
        .map(|next| next - record.next_fire_time)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grace_buckets() {
        let p = |gap| grace_period(TaskKind::Periodic, Some(gap)).as_secs();
        assert_eq!(p(60), 300);
        assert_eq!(p(61), 1_800);
        assert_eq!(p(600), 1_800);
        assert_eq!(p(3_600), 7_200);
        assert_eq!(p(86_400), 18_000);
    }

    #[test]
    fn one_shot_and_unknown_gap_use_minimum() {
        assert_eq!(grace_period(TaskKind::Once, Some(86_400)).as_secs(), 300);
        assert_eq!(grace_period(TaskKind::Periodic, None).as_secs(), 300);
    }

    #[test]
    fn grace_never_shrinks_as_gap_grows() {
        let gaps = [1, 30, 60, 61, 300, 600, 601, 3_600, 3_601, 86_400];
        for pair in gaps.windows(2) {
            assert!(
                grace_period(TaskKind::Periodic, Some(pair[0]))
                    <= grace_period(TaskKind::Periodic, Some(pair[1]))
            );
        }
    }

    #[test]
    fn gap_comes_from_the_record_expression() {
        let rec = PeriodicTaskRecord {
            cron_expression: "*/5 * * * *".into(),
            group_key: "g".into(),
            uid: "u".into(),
            payload: vec![],
            next_fire_time: 1_700_000_100,
            processed_count: 0,
            max_retry: 0,
            timeout_seconds: 0,
        };
        assert_eq!(recurrence_gap(&rec), Some(300));
    }
}
