//! Fluent builder for Scheduler construction.

use crate::error::SchedulerError;
use crate::runtime::{Scheduler, SchedulerConfig};

/// Builder for [`Scheduler`] instances. Unset options keep their
/// [`SchedulerConfig::default`] values.
///
/// # Example
/// ```ignore
/// let scheduler = SchedulerBuilder::new()
///     .worker_fiber_limit(64)
///     .stack_size(128 * 1024)
///     .build()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct SchedulerBuilder {
    config: SchedulerConfig,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upper bound on concurrently running tasks.
    pub fn worker_fiber_limit(mut self, limit: usize) -> Self {
        self.config.worker_fiber_limit = limit;
        self
    }

    /// Stack size of each worker fiber, in bytes.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.config.worker_fiber_stack_size = bytes;
        self
    }

    pub fn task_queue_limit(mut self, limit: usize) -> Self {
        self.config.task_queue_limit = limit;
        self
    }

    /// Readiness events fetched per multiplexer wait.
    pub fn max_events(mut self, max: usize) -> Self {
        self.config.max_events = max;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Validates the configuration and creates the scheduler.
    pub fn build(self) -> Result<Scheduler, SchedulerError> {
        Scheduler::new(self.config)
    }
}
