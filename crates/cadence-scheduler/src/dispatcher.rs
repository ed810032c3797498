//! Delivered-instance routing.
//!
//! Exactly one handler mode is chosen when the dispatcher is built. After the
//! handler returns, successful or not, every periodic uid in the delivery has
//! its processed count bumped under the distributed lock.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::callback::CallbackClient;
use crate::context::CallContext;
use crate::error::{HandlerError, Result, SchedulerError};
use crate::handle::SchedulerHandle;
use crate::types::{DeliveredTask, Payload, TaskKind};

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: &CallContext, payload: Payload) -> std::result::Result<(), HandlerError>;
}

/// A handler that needs the scheduler itself, e.g. to resubmit work.
#[async_trait]
pub trait HandleAwareHandler: Send + Sync {
    async fn handle(
        &self,
        scheduler: &SchedulerHandle,
        ctx: &CallContext,
        payload: Payload,
    ) -> std::result::Result<(), HandlerError>;
}

/// Receives the raw batch the transport buffered for one aggregation group.
/// [`merge_payloads`](crate::aggregation::merge_payloads) decodes it.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(
        &self,
        ctx: &CallContext,
        batch: Vec<DeliveredTask>,
    ) -> std::result::Result<(), HandlerError>;
}

#[derive(Clone)]
pub enum HandlerKind {
    Plain(Arc<dyn TaskHandler>),
    WithHandle(Arc<dyn HandleAwareHandler>),
    Aggregator(Arc<dyn BatchHandler>),
    Callback(CallbackClient),
}

impl HandlerKind {
    pub fn name(&self) -> &'static str {
        match self {
            HandlerKind::Plain(_) => "plain",
            HandlerKind::WithHandle(_) => "with_handle",
            HandlerKind::Aggregator(_) => "aggregator",
            HandlerKind::Callback(_) => "callback",
        }
    }
}

pub struct DispatcherBuilder {
    scheduler: SchedulerHandle,
    plain: Option<Arc<dyn TaskHandler>>,
    with_handle: Option<Arc<dyn HandleAwareHandler>>,
    aggregator: Option<Arc<dyn BatchHandler>>,
    callback: Option<CallbackClient>,
}

impl DispatcherBuilder {
    pub fn handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.plain = Some(handler);
        self
    }

    pub fn handle_aware(mut self, handler: Arc<dyn HandleAwareHandler>) -> Self {
        self.with_handle = Some(handler);
        self
    }

    pub fn aggregator(mut self, handler: Arc<dyn BatchHandler>) -> Self {
        self.aggregator = Some(handler);
        self
    }

    pub fn callback(mut self, client: CallbackClient) -> Self {
        self.callback = Some(client);
        self
    }

    /// Pick one mode: plain, then handle-aware, then aggregator, then callback.
    pub fn build(self) -> Result<HandlerDispatcher> {
        let configured = [
            self.plain.is_some(),
            self.with_handle.is_some(),
            self.aggregator.is_some(),
            self.callback.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();

        let kind = if let Some(h) = self.plain {
            HandlerKind::Plain(h)
        } else if let Some(h) = self.with_handle {
            HandlerKind::WithHandle(h)
        } else if let Some(h) = self.aggregator {
            HandlerKind::Aggregator(h)
        } else if let Some(c) = self.callback {
            HandlerKind::Callback(c)
        } else {
            return Err(SchedulerError::InvalidOptions(
                "no task handler configured".into(),
            ));
        };
        if configured > 1 {
            warn!(chosen = kind.name(), configured, "several handler modes configured");
        }

        Ok(HandlerDispatcher {
            scheduler: self.scheduler,
            kind,
        })
    }
}

pub struct HandlerDispatcher {
    scheduler: SchedulerHandle,
    kind: HandlerKind,
}

impl HandlerDispatcher {
    pub fn builder(scheduler: SchedulerHandle) -> DispatcherBuilder {
        DispatcherBuilder {
            scheduler,
            plain: None,
            with_handle: None,
            aggregator: None,
            callback: None,
        }
    }

    pub fn kind(&self) -> &HandlerKind {
        &self.kind
    }

    /// Run one delivered instance through the configured handler.
    pub async fn dispatch(&self, ctx: &CallContext, task: DeliveredTask) -> Result<()> {
        let periodic = periodic_uids(std::slice::from_ref(&task));
        let payload = Payload::from(&task);
        debug!(uid = %payload.uid, group_key = %payload.group_key, mode = self.kind.name(), "dispatching");

        let outcome = match &self.kind {
            HandlerKind::Plain(h) => h.handle(ctx, payload).await,
            HandlerKind::WithHandle(h) => h.handle(&self.scheduler, ctx, payload).await,
            HandlerKind::Aggregator(h) => h.handle_batch(ctx, vec![task]).await,
            HandlerKind::Callback(c) => c.deliver(ctx, &payload).await,
        };
        self.record_processed(&periodic).await;
        outcome.map_err(SchedulerError::from)
    }

    /// Run an aggregated batch. Non-aggregator modes see each member in turn;
    /// the first failure is reported for the whole batch.
    pub async fn dispatch_batch(&self, ctx: &CallContext, batch: Vec<DeliveredTask>) -> Result<()> {
        let periodic = periodic_uids(&batch);
        debug!(size = batch.len(), mode = self.kind.name(), "dispatching batch");

        let outcome = match &self.kind {
            HandlerKind::Aggregator(h) => h.handle_batch(ctx, batch).await,
            kind => {
                let mut first_err = None;
                for task in &batch {
                    let payload = Payload::from(task);
                    let res = match kind {
                        HandlerKind::Plain(h) => h.handle(ctx, payload).await,
                        HandlerKind::WithHandle(h) => h.handle(&self.scheduler, ctx, payload).await,
                        HandlerKind::Callback(c) => c.deliver(ctx, &payload).await,
                        HandlerKind::Aggregator(_) => Ok(()),
                    };
                    if let Err(e) = res {
                        first_err.get_or_insert(e);
                    }
                }
                first_err.map_or(Ok(()), Err)
            }
        };
        self.record_processed(&periodic).await;
        outcome.map_err(SchedulerError::from)
    }

    async fn record_processed(&self, uids: &[String]) {
        if uids.is_empty() {
            return;
        }
        // fresh context: the handler's deadline may already be spent
        match self
            .scheduler
            .increment_processed(&CallContext::new(), uids)
            .await
        {
            Ok(updated) => debug!(updated, "processed counts recorded"),
            Err(e) => warn!(code = e.code(), ?uids, "processed count not recorded: {e}"),
        }
    }
}

fn periodic_uids(tasks: &[DeliveredTask]) -> Vec<String> {
    tasks
        .iter()
        .filter(|t| t.kind == TaskKind::Periodic)
        .map(|t| t.id.clone())
        .collect()
}
