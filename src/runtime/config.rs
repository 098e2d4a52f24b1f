use crate::error::SchedulerError;

/// Sizing knobs for a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently assigned worker fibers.
    pub worker_fiber_limit: usize,
    /// Stack size of each worker fiber, in bytes.
    pub worker_fiber_stack_size: usize,
    /// Upper bound on tasks waiting for a worker.
    pub task_queue_limit: usize,
    /// Readiness events fetched per multiplexer wait.
    pub max_events: usize,
}

impl SchedulerConfig {
    /// Smallest stack a worker fiber may be given.
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.worker_fiber_limit == 0 {
            return Err(SchedulerError::InvalidConfig(
                "worker_fiber_limit must be at least 1",
            ));
        }

        if self.worker_fiber_stack_size < Self::MIN_STACK_SIZE {
            return Err(SchedulerError::InvalidConfig(
                "worker_fiber_stack_size is below the 16 KiB minimum",
            ));
        }

        if self.task_queue_limit == 0 {
            return Err(SchedulerError::InvalidConfig(
                "task_queue_limit must be at least 1",
            ));
        }

        if self.max_events == 0 {
            return Err(SchedulerError::InvalidConfig("max_events must be at least 1"));
        }

        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_fiber_limit: 16,
            worker_fiber_stack_size: 256 * 1024,
            task_queue_limit: 256,
            max_events: 64,
        }
    }
}

/// Counters reported by [`Scheduler::stats`](crate::Scheduler::stats).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Configured worker limit.
    pub worker_fiber_total: usize,
    /// Workers currently assigned to a task.
    pub worker_fiber_busy: usize,
    pub worker_fiber_high_water: usize,
    /// Stacks allocated so far; never exceeds the limit.
    pub worker_fibers_created: usize,
    /// Tasks waiting for a worker.
    pub task_queue_busy: usize,
    pub task_queue_limit: usize,
    pub tasks_scheduled: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_killed: u64,
}
