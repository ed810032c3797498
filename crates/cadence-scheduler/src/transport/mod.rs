//! Queue-transport collaborator.
//!
//! The transport owns delivery, per-instance retry, worker concurrency and id
//! dedup. This crate only enqueues, deletes and inspects terminal instances;
//! delivered work comes back in through
//! [`HandlerDispatcher`](crate::dispatcher::HandlerDispatcher).

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{TaskInstance, TerminalInstance};

mod memory;

pub use memory::{InstanceInfo, InstanceState, MemoryQueue, WorkerSettings};

#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Submit an instance. Fails with `SchedulerError::Conflict` while an
    /// instance with the same id is still live in the group.
    async fn enqueue(&self, instance: TaskInstance) -> Result<String>;

    /// Remove an instance in any state. Idempotent.
    async fn delete_instance(&self, group_key: &str, id: &str) -> Result<()>;

    /// Archived / retry-exhausted instances of a group, zero-based pages.
    async fn list_terminal(
        &self,
        group_key: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<TerminalInstance>>;
}
