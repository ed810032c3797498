use std::time::Duration;

use cadence_core::config::CadenceConfig;
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::handle::SchedulerHandle;
use crate::scanner::Scanner;
use crate::sweeper::ArchiveSweeper;

/// Owns the background loops: the scanner, and the archive sweeper when enabled.
pub struct SchedulerEngine {
    scanner: Scanner,
    sweeper: Option<ArchiveSweeper>,
}

impl SchedulerEngine {
    pub fn new(handle: SchedulerHandle, config: &CadenceConfig) -> Self {
        let cycle_timeout = bounded_cycle_timeout(config);
        let scanner = Scanner::new(
            handle.clone(),
            Duration::from_secs(config.scheduler.scan_interval_secs.max(1)),
            cycle_timeout,
        );
        let sweeper = config.sweeper.enabled.then(|| {
            ArchiveSweeper::new(
                handle,
                config.sweeper.group.clone(),
                config.sweeper.page_size,
                Duration::from_secs(config.sweeper.interval_secs.max(1)),
                cycle_timeout,
            )
        });
        Self { scanner, sweeper }
    }

    /// Start every loop on the current runtime. They stop when `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> EngineTasks {
        let mut handles = vec![tokio::spawn(self.scanner.run(shutdown.clone()))];
        if let Some(sweeper) = self.sweeper {
            handles.push(tokio::spawn(sweeper.run(shutdown)));
        }
        info!(tasks = handles.len(), "scheduler engine started");
        EngineTasks { handles }
    }
}

/// The configured cycle timeout, cut to two thirds of the lock TTL so the
/// write-back and release after the last deadline check finish while the
/// lock is still held.
fn bounded_cycle_timeout(config: &CadenceConfig) -> Duration {
    let requested = Duration::from_secs(config.scheduler.cycle_timeout_secs);
    let ceiling = Duration::from_secs(config.lock.ttl_secs) * 2 / 3;
    if requested > ceiling {
        warn!(
            requested_secs = requested.as_secs(),
            ceiling_secs = ceiling.as_secs(),
            "cycle timeout exceeds the lock ttl budget, clamping"
        );
        ceiling
    } else {
        requested
    }
}

#[must_use = "join the engine tasks after cancelling the shutdown token"]
pub struct EngineTasks {
    handles: Vec<JoinHandle<()>>,
}

impl EngineTasks {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every loop to exit.
    pub async fn join(self) {
        for res in join_all(self.handles).await {
            if let Err(e) = res {
                error!("engine task ended abnormally: {e}");
            }
        }
        info!("scheduler engine stopped");
    }
}
