//! `cadence-scheduler` — scheduled-task dispatch core.
//!
//! # Overview
//!
//! Recurring definitions live in a registry collection in a shared KV store.
//! The [`scanner::Scanner`] turns each due definition into one queued
//! instance per fire time, the [`sweeper::ArchiveSweeper`] purges instances
//! that exhausted their retries, and the [`dispatcher::HandlerDispatcher`]
//! runs delivered instances through exactly one handler mode. Every
//! read-modify-write on the registry runs under one [`lock::DistributedLock`].
//!
//! # Collaborators
//!
//! | Trait                          | Bundled backends                                  |
//! |--------------------------------|---------------------------------------------------|
//! | [`store::KvStore`]             | [`store::MemoryKvStore`], [`store::SqliteKvStore`] |
//! | [`transport::QueueTransport`]  | [`transport::MemoryQueue`]                        |
//! | [`clock::Clock`]               | [`clock::SystemClock`], [`clock::ManualClock`]    |
//!
//! # Handler modes
//!
//! | Mode         | Receives                                   |
//! |--------------|--------------------------------------------|
//! | `Plain`      | one [`types::Payload`]                     |
//! | `WithHandle` | the [`SchedulerHandle`] and one payload    |
//! | `Aggregator` | the raw batch of one aggregation group     |
//! | `Callback`   | nothing in-process; payload POSTed as JSON |

pub mod aggregation;
pub mod callback;
pub mod clock;
pub mod context;
pub mod db;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod handle;
pub mod lock;
pub mod options;
pub mod registry;
pub mod scanner;
pub mod schedule;
pub mod store;
pub mod sweeper;
pub mod transport;
pub mod types;

pub use context::CallContext;
pub use dispatcher::{HandlerDispatcher, HandlerKind};
pub use engine::{EngineTasks, SchedulerEngine};
pub use error::{HandlerError, Result, SchedulerError};
pub use handle::SchedulerHandle;
pub use options::RunOptions;
pub use types::{DeliveredTask, Payload, PeriodicTaskRecord, TaskInstance, TaskKind, Timing};
