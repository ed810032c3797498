use std::time::Duration;

use serde::Serialize;

use crate::context::CallContext;
use crate::error::{Result, SchedulerError};
use crate::types::Timing;

pub const DEFAULT_MAX_RETRY: u32 = 3;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Options for one submission (`submit_once` or `submit_cron`).
///
/// Built with chained setters:
///
/// ```
/// use std::time::Duration;
/// use cadence_scheduler::RunOptions;
///
/// let opts = RunOptions::new("invoice-42")
///     .group("billing")
///     .payload(b"{\"id\":42}".to_vec())
///     .delay(Duration::from_secs(60));
/// assert_eq!(opts.uid(), "invoice-42");
/// ```
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub(crate) uid: String,
    pub(crate) group: Option<String>,
    pub(crate) payload: Vec<u8>,
    pub(crate) cron: Option<String>,
    pub(crate) now: bool,
    pub(crate) at: Option<i64>,
    pub(crate) delay: Option<Duration>,
    pub(crate) retention: Option<Duration>,
    pub(crate) replace_on_conflict: bool,
    pub(crate) max_retry: u32,
    pub(crate) timeout: Duration,
    pub(crate) context: CallContext,
}

impl RunOptions {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            group: None,
            payload: Vec::new(),
            cron: None,
            now: false,
            at: None,
            delay: None,
            retention: None,
            replace_on_conflict: false,
            max_retry: DEFAULT_MAX_RETRY,
            timeout: DEFAULT_TIMEOUT,
            context: CallContext::new(),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Queue/topic for the instance; the handle's default group otherwise.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Serialize `value` as the JSON payload.
    pub fn json_payload<T: Serialize>(mut self, value: &T) -> Result<Self> {
        self.payload = serde_json::to_vec(value)?;
        Ok(self)
    }

    pub fn cron(mut self, expr: impl Into<String>) -> Self {
        self.cron = Some(expr.into());
        self
    }

    /// Deliver immediately.
    pub fn now(mut self) -> Self {
        self.now = true;
        self
    }

    /// Deliver at a unix timestamp.
    pub fn at(mut self, ts: i64) -> Self {
        self.at = Some(ts);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Keep the completed instance (and its id reserved) this long.
    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// On an id conflict, delete the existing instance and submit again once.
    pub fn replace_on_conflict(mut self) -> Self {
        self.replace_on_conflict = true;
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn context(mut self, ctx: CallContext) -> Self {
        self.context = ctx;
        self
    }

    /// The one timing choice for a one-shot submission. Immediate when none
    /// is given; more than one is rejected.
    pub fn timing(&self) -> Result<Timing> {
        let chosen = [self.now, self.at.is_some(), self.delay.is_some()]
            .iter()
            .filter(|set| **set)
            .count();
        if chosen > 1 {
            return Err(SchedulerError::InvalidOptions(
                "at most one of now, at and delay may be set".into(),
            ));
        }
        Ok(match (self.at, self.delay) {
            (Some(ts), _) => Timing::At(ts),
            (_, Some(d)) => Timing::In(d),
            _ => Timing::Immediate,
        })
    }

    pub(crate) fn validate_uid(&self) -> Result<()> {
        if self.uid.trim().is_empty() {
            return Err(SchedulerError::InvalidOptions("uid must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = RunOptions::new("a");
        assert_eq!(opts.max_retry, DEFAULT_MAX_RETRY);
        assert_eq!(opts.timeout, DEFAULT_TIMEOUT);
        assert!(!opts.replace_on_conflict);
        assert_eq!(opts.timing().unwrap(), Timing::Immediate);
    }

    #[test]
    fn single_timing_choice() {
        assert_eq!(RunOptions::new("a").now().timing().unwrap(), Timing::Immediate);
        assert_eq!(RunOptions::new("a").at(50).timing().unwrap(), Timing::At(50));
        assert_eq!(
            RunOptions::new("a").delay(Duration::from_secs(9)).timing().unwrap(),
            Timing::In(Duration::from_secs(9))
        );
    }

    #[test]
    fn conflicting_timing_is_rejected() {
        let err = RunOptions::new("a")
            .at(50)
            .delay(Duration::from_secs(1))
            .timing()
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidOptions(_)));
        assert!(RunOptions::new("a").now().at(1).timing().is_err());
    }

    #[test]
    fn json_payload_and_empty_uid() {
        let opts = RunOptions::new(" ").json_payload(&serde_json::json!({"x": 1})).unwrap();
        assert_eq!(opts.payload, br#"{"x":1}"#.to_vec());
        assert!(opts.validate_uid().is_err());
    }
}
