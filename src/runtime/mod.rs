//! Scheduler subsystem modules.

pub(crate) mod config;
pub mod context;
pub(crate) mod core;
pub(crate) mod queue;

pub use config::{SchedulerConfig, SchedulerStats};
pub use context::{init, is_initialized, scheduler, shutdown};
pub use self::core::Scheduler;
