//! `cadence-core` — configuration and error types shared by the scheduler
//! library and the daemon.

pub mod config;
pub mod error;

pub use config::CadenceConfig;
pub use error::{CadenceError, Result};
