//! Aggregation thresholds and the merge function handed to the transport.
//!
//! This layer does no buffering of its own: the transport buffers instances
//! that share an aggregation group and flushes them to the aggregator handler
//! when [`AggregationPolicy::should_flush`] says so.

use std::time::Duration;

use cadence_core::config::AggregationConfig;

use crate::types::{DeliveredTask, Payload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationPolicy {
    /// Flush once this many instances are buffered.
    pub group_max_size: usize,
    /// Flush once no new instance has joined the batch for this long.
    pub group_grace_period: Duration,
    /// Flush once the first buffered instance has waited this long.
    pub group_max_delay: Duration,
}

impl AggregationPolicy {
    /// `None` when aggregation is disabled.
    pub fn from_config(cfg: &AggregationConfig) -> Option<Self> {
        cfg.enabled.then(|| Self {
            group_max_size: cfg.group_max_size.max(1),
            group_grace_period: Duration::from_secs(cfg.group_grace_period_secs),
            group_max_delay: Duration::from_secs(cfg.group_max_delay_secs),
        })
    }

    pub fn should_flush(&self, buffered: usize, since_newest: Duration, since_first: Duration) -> bool {
        buffered > 0
            && (buffered >= self.group_max_size
                || since_newest >= self.group_grace_period
                || since_first >= self.group_max_delay)
    }
}

/// The merge function: decoded payloads of a batch, in delivery order.
pub fn merge_payloads(batch: &[DeliveredTask]) -> Vec<Payload> {
    batch.iter().map(Payload::from).collect()
}
