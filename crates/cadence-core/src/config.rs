use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_CYCLE_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_REGISTRY_KEY: &str = "cadence:periodic";
pub const DEFAULT_GROUP: &str = "default";
pub const DEFAULT_LOCK_KEY: &str = "cadence:lock";
pub const DEFAULT_LOCK_TTL_SECS: u64 = 30;
pub const DEFAULT_LOCK_RETRY_ATTEMPTS: u32 = 10;
pub const DEFAULT_LOCK_RETRY_INTERVAL_MS: u64 = 100;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_SWEEP_PAGE_SIZE: usize = 100;
pub const DEFAULT_CALLBACK_TIMEOUT_SECS: u64 = 30;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
///
/// Every section has serde defaults, so an empty or missing file still
/// produces a runnable configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub callback: Option<CallbackConfig>,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Scanner tick cadence.
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// Timeout for the internally-owned context of each scan/sweep cycle.
    /// Clamped to two thirds of the lock TTL.
    #[serde(default = "default_cycle_timeout")]
    pub cycle_timeout_secs: u64,
    /// Shared collection key holding every periodic task record.
    #[serde(default = "default_registry_key")]
    pub registry_key: String,
    /// Group key used when a submission does not name one.
    #[serde(default = "default_group")]
    pub default_group: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            cycle_timeout_secs: DEFAULT_CYCLE_TIMEOUT_SECS,
            registry_key: DEFAULT_REGISTRY_KEY.to_string(),
            default_group: DEFAULT_GROUP.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_key")]
    pub key: String,
    /// A holder that crashes releases the lock implicitly after this long.
    #[serde(default = "default_lock_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_lock_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_lock_retry_interval")]
    pub retry_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key: DEFAULT_LOCK_KEY.to_string(),
            ttl_secs: DEFAULT_LOCK_TTL_SECS,
            retry_attempts: DEFAULT_LOCK_RETRY_ATTEMPTS,
            retry_interval_ms: DEFAULT_LOCK_RETRY_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
    /// Group whose terminal instances are inspected and purged.
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_sweep_page_size")]
    pub page_size: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            group: DEFAULT_GROUP.to_string(),
            page_size: DEFAULT_SWEEP_PAGE_SIZE,
        }
    }
}

/// Thresholds handed to the queue transport when instances of one group are
/// buffered and delivered together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_group_max_size")]
    pub group_max_size: usize,
    #[serde(default = "default_group_grace_period")]
    pub group_grace_period_secs: u64,
    #[serde(default = "default_group_max_delay")]
    pub group_max_delay_secs: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            group_max_size: default_group_max_size(),
            group_grace_period_secs: default_group_grace_period(),
            group_max_delay_secs: default_group_max_delay(),
        }
    }
}

/// HTTP callback handler mode: every delivered payload is POSTed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackConfig {
    pub url: String,
    #[serde(default = "default_callback_timeout")]
    pub timeout_secs: u64,
}

/// In-process queue worker settings (only used with the bundled memory queue).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_worker_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_worker_concurrency(),
            poll_interval_ms: default_worker_poll_interval(),
            retry_backoff_secs: default_retry_backoff(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_scan_interval() -> u64 {
    DEFAULT_SCAN_INTERVAL_SECS
}
fn default_cycle_timeout() -> u64 {
    DEFAULT_CYCLE_TIMEOUT_SECS
}
fn default_registry_key() -> String {
    DEFAULT_REGISTRY_KEY.to_string()
}
fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}
fn default_lock_key() -> String {
    DEFAULT_LOCK_KEY.to_string()
}
fn default_lock_ttl() -> u64 {
    DEFAULT_LOCK_TTL_SECS
}
fn default_lock_retry_attempts() -> u32 {
    DEFAULT_LOCK_RETRY_ATTEMPTS
}
fn default_lock_retry_interval() -> u64 {
    DEFAULT_LOCK_RETRY_INTERVAL_MS
}
fn default_sweep_interval() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}
fn default_sweep_page_size() -> usize {
    DEFAULT_SWEEP_PAGE_SIZE
}
fn default_group_max_size() -> usize {
    100
}
fn default_group_grace_period() -> u64 {
    5
}
fn default_group_max_delay() -> u64 {
    30
}
fn default_callback_timeout() -> u64 {
    DEFAULT_CALLBACK_TIMEOUT_SECS
}
fn default_worker_concurrency() -> usize {
    8
}
fn default_worker_poll_interval() -> u64 {
    500
}
fn default_retry_backoff() -> u64 {
    10
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.cadence/cadence.toml
    ///
    /// Nested keys are split on a double underscore, e.g.
    /// `CADENCE_SCHEDULER__SCAN_INTERVAL_SECS=5`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CADENCE_").split("__"))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|_jail| {
            let config = CadenceConfig::load(Some("does-not-exist.toml")).unwrap();
            assert_eq!(config.scheduler.scan_interval_secs, 10);
            assert_eq!(config.sweeper.interval_secs, 300);
            assert_eq!(config.lock.key, DEFAULT_LOCK_KEY);
            assert!(config.sweeper.enabled);
            assert!(!config.aggregation.enabled);
            assert!(config.callback.is_none());
            Ok(())
        });
    }

    #[test]
    fn toml_sections_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cadence.toml",
                r#"
                [scheduler]
                scan_interval_secs = 2
                registry_key = "tasks"

                [callback]
                url = "http://127.0.0.1:9000/hook"

                [aggregation]
                enabled = true
                group_max_size = 7
                "#,
            )?;
            let config = CadenceConfig::load(Some("cadence.toml")).unwrap();
            assert_eq!(config.scheduler.scan_interval_secs, 2);
            assert_eq!(config.scheduler.registry_key, "tasks");
            // untouched keys in a present section keep their defaults
            assert_eq!(config.scheduler.cycle_timeout_secs, DEFAULT_CYCLE_TIMEOUT_SECS);
            let callback = config.callback.unwrap();
            assert_eq!(callback.url, "http://127.0.0.1:9000/hook");
            assert_eq!(callback.timeout_secs, DEFAULT_CALLBACK_TIMEOUT_SECS);
            assert!(config.aggregation.enabled);
            assert_eq!(config.aggregation.group_max_size, 7);
            Ok(())
        });
    }

    #[test]
    fn env_overrides_nested_keys() {
        Jail::expect_with(|jail| {
            jail.create_file("cadence.toml", "[lock]\nttl_secs = 60\n")?;
            jail.set_env("CADENCE_LOCK__TTL_SECS", "15");
            jail.set_env("CADENCE_SWEEPER__GROUP", "reports");
            let config = CadenceConfig::load(Some("cadence.toml")).unwrap();
            assert_eq!(config.lock.ttl_secs, 15);
            assert_eq!(config.sweeper.group, "reports");
            Ok(())
        });
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        Jail::expect_with(|jail| {
            jail.create_file("cadence.toml", "[scheduler]\nscan_interval_secs = \"soon\"\n")?;
            let err = CadenceConfig::load(Some("cadence.toml")).unwrap_err();
            assert_eq!(err.code(), "CONFIG_ERROR");
            Ok(())
        });
    }
}
