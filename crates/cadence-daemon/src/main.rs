use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cadence_core::config::CadenceConfig;
use cadence_scheduler::callback::CallbackClient;
use cadence_scheduler::clock::{Clock, SystemClock};
use cadence_scheduler::dispatcher::TaskHandler;
use cadence_scheduler::schedule;
use cadence_scheduler::store::SqliteKvStore;
use cadence_scheduler::transport::{MemoryQueue, WorkerSettings};
use cadence_scheduler::{
    CallContext, HandlerDispatcher, HandlerError, Payload, RunOptions, SchedulerEngine,
    SchedulerHandle,
};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(about = "Cron-style task scheduler with a shared registry and distributed lock")]
#[command(version)]
struct Args {
    /// Config file (default: $CADENCE_CONFIG, then ~/.cadence/cadence.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scanner, sweeper and queue worker until Ctrl-C
    Run,
    /// List registered periodic tasks
    List,
    /// Register or replace a periodic task
    Add {
        #[arg(long)]
        uid: String,
        /// 5-field cron expression or @macro
        #[arg(long)]
        cron: String,
        #[arg(long)]
        group: Option<String>,
        /// Payload bytes, passed through unchanged
        #[arg(long)]
        payload: Option<String>,
        #[arg(long, default_value_t = cadence_scheduler::options::DEFAULT_MAX_RETRY)]
        max_retry: u32,
        #[arg(long, default_value_t = cadence_scheduler::options::DEFAULT_TIMEOUT.as_secs())]
        timeout_secs: u64,
    },
    /// Remove a periodic task and its pending instance
    Remove {
        #[arg(long)]
        uid: String,
    },
    /// Print the upcoming fire times of an expression
    Next {
        #[arg(long)]
        cron: String,
        #[arg(long, short = 'n', default_value_t = 5)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_daemon=info,cadence_scheduler=info".into()),
        )
        .init();

    let args = Args::parse();

    // explicit --config > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = args.config.clone().or_else(|| std::env::var("CADENCE_CONFIG").ok());
    let config = CadenceConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });

    if let Command::Next { cron, count } = &args.command {
        return print_upcoming(cron, *count);
    }

    let (handle, queue) = build_scheduler(&config)?;
    match args.command {
        Command::Run => run(config, handle, queue).await,
        Command::List => list(&handle).await,
        Command::Add {
            uid,
            cron,
            group,
            payload,
            max_retry,
            timeout_secs,
        } => {
            let mut opts = RunOptions::new(uid)
                .cron(cron)
                .max_retry(max_retry)
                .timeout(Duration::from_secs(timeout_secs));
            if let Some(group) = group {
                opts = opts.group(group);
            }
            if let Some(payload) = payload {
                opts = opts.payload(payload.into_bytes());
            }
            let record = handle.submit_cron(opts).await?;
            println!("{} next fire {}", record.uid, format_ts(record.next_fire_time));
            Ok(())
        }
        Command::Remove { uid } => {
            handle.remove(&CallContext::new(), &uid).await?;
            println!("removed {uid}");
            Ok(())
        }
        Command::Next { .. } => Ok(()),
    }
}

fn build_scheduler(config: &CadenceConfig) -> anyhow::Result<(SchedulerHandle, Arc<MemoryQueue>)> {
    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let store = Arc::new(
        SqliteKvStore::open(db_path).with_context(|| format!("opening {db_path}"))?,
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let queue = Arc::new(MemoryQueue::new(
        Arc::clone(&clock),
        Duration::from_secs(config.worker.retry_backoff_secs),
    ));
    let handle = SchedulerHandle::builder(store, queue.clone())
        .config(config)
        .clock(clock)
        .build();
    Ok((handle, queue))
}

async fn run(
    config: CadenceConfig,
    handle: SchedulerHandle,
    queue: Arc<MemoryQueue>,
) -> anyhow::Result<()> {
    let builder = HandlerDispatcher::builder(handle.clone());
    let dispatcher = match &config.callback {
        Some(cb) => {
            info!(url = %cb.url, "delivering tasks to HTTP callback");
            builder.callback(CallbackClient::from_config(cb)).build()?
        }
        None => builder.handler(Arc::new(LogHandler)).build()?,
    };

    let shutdown = CancellationToken::new();
    let engine = SchedulerEngine::new(handle, &config).spawn(shutdown.clone());
    let worker = tokio::spawn(queue.run_worker(
        Arc::new(dispatcher),
        WorkerSettings::from_config(&config.worker, &config.aggregation),
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown.cancel();
    engine.join().await;
    worker.await?;
    info!("cadence stopped");
    Ok(())
}

async fn list(handle: &SchedulerHandle) -> anyhow::Result<()> {
    let records = handle.list_periodic().await?;
    if records.is_empty() {
        println!("no periodic tasks");
        return Ok(());
    }
    println!(
        "{:<24} {:<18} {:<12} {:<26} {:>9}",
        "UID", "EXPR", "GROUP", "NEXT", "PROCESSED"
    );
    for r in records {
        println!(
            "{:<24} {:<18} {:<12} {:<26} {:>9}",
            r.uid,
            r.cron_expression,
            r.group_key,
            format_ts(r.next_fire_time),
            r.processed_count
        );
    }
    Ok(())
}

fn print_upcoming(expr: &str, count: usize) -> anyhow::Result<()> {
    for ts in schedule::upcoming_fire_times(expr, 0, count)? {
        println!("{}", format_ts(ts));
    }
    Ok(())
}

fn format_ts(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

/// Default handler when no callback URL is configured: log and succeed.
struct LogHandler;

#[async_trait::async_trait]
impl TaskHandler for LogHandler {
    async fn handle(&self, _ctx: &CallContext, payload: Payload) -> Result<(), HandlerError> {
        info!(
            uid = %payload.uid,
            group = %payload.group_key,
            bytes = payload.payload.len(),
            "task delivered"
        );
        Ok(())
    }
}
