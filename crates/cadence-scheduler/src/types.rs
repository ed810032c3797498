use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One persisted recurring definition in the registry collection.
///
/// The JSON field names are fixed: records written by older deployments must
/// keep decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodicTaskRecord {
    /// Recurrence rule, minute granularity.
    #[serde(rename = "expr")]
    pub cron_expression: String,
    /// Queue/topic the generated instances are enqueued under.
    #[serde(rename = "group")]
    pub group_key: String,
    /// Caller-supplied primary key within the registry collection.
    pub uid: String,
    /// Opaque bytes forwarded unchanged to every generated instance.
    #[serde(with = "base64_bytes", default)]
    pub payload: Vec<u8>,
    /// Unix timestamp of the next scheduled instance. Only the scanner moves it.
    #[serde(rename = "next")]
    pub next_fire_time: i64,
    /// Completed instances so far. Only the handler dispatcher moves it.
    #[serde(rename = "processed", default)]
    pub processed_count: u64,
    #[serde(rename = "maxRetry", default)]
    pub max_retry: u32,
    #[serde(rename = "timeout", default)]
    pub timeout_seconds: u64,
}

/// The unit handed to a task handler (and POSTed by the HTTP callback mode).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "group")]
    pub group_key: String,
    pub uid: String,
    #[serde(with = "base64_bytes", default)]
    pub payload: Vec<u8>,
}

impl Payload {
    /// Decode the opaque bytes as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }
}

impl From<&DeliveredTask> for Payload {
    fn from(task: &DeliveredTask) -> Self {
        Self {
            group_key: task.group_key.clone(),
            uid: task.id.clone(),
            payload: task.payload.clone(),
        }
    }
}

/// Whether an instance came from a one-shot submission or a recurring definition.
///
/// Also used as the instance's task type name on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Once,
    Periodic,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Once => "once",
            TaskKind::Periodic => "periodic",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "once" => Ok(TaskKind::Once),
            "periodic" => Ok(TaskKind::Periodic),
            other => Err(format!("unknown task kind: {other}")),
        }
    }
}

/// When the transport should first make an instance available to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timing {
    Immediate,
    /// Relative delay from the moment of enqueue.
    In(Duration),
    /// Absolute unix timestamp.
    At(i64),
}

impl Timing {
    /// Resolve to an absolute unix timestamp relative to `now`.
    pub fn process_at(&self, now: i64) -> i64 {
        match self {
            Timing::Immediate => now,
            Timing::In(delay) => now + delay.as_secs() as i64,
            Timing::At(ts) => *ts,
        }
    }
}

/// One concrete unit of work submitted to the queue transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInstance {
    /// Dedup key on the transport; equals the submitting uid.
    pub id: String,
    pub kind: TaskKind,
    pub group_key: String,
    pub payload: Vec<u8>,
    pub max_retry: u32,
    pub timeout: Duration,
    /// How long a completed instance is kept (and keeps its id reserved).
    pub retention: Duration,
    pub timing: Timing,
    /// Set when the aggregation policy is enabled; instances sharing it are
    /// delivered together.
    pub aggregation_group: Option<String>,
}

/// An instance the transport has stopped retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalInstance {
    pub id: String,
    pub kind: TaskKind,
    pub group_key: String,
    pub retried: u32,
    pub max_retry: u32,
    pub timeout: Duration,
    /// Unix timestamp of the most recent failure.
    pub last_failed_at: i64,
}

impl TerminalInstance {
    pub fn retries_remaining(&self) -> bool {
        self.retried < self.max_retry
    }

    /// Retries are left and the last attempt's timeout has not run out yet,
    /// so the transport may still pick the instance up again.
    pub fn may_still_retry(&self, now: i64) -> bool {
        self.retries_remaining() && now < self.last_failed_at + self.timeout.as_secs() as i64
    }
}

/// A raw instance as the transport hands it to a worker slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredTask {
    pub id: String,
    pub kind: TaskKind,
    pub group_key: String,
    pub payload: Vec<u8>,
    /// Attempts already made before this one.
    pub retried: u32,
    pub timeout: Duration,
    pub aggregation_group: Option<String>,
}

/// Serde adapter: `Vec<u8>` as standard base64 text.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = Option::<String>::deserialize(d)?.unwrap_or_default();
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
