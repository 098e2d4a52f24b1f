//! Bounded pool of worker fibers.
//!
//! Workers are created lazily, one stack each, up to the configured limit,
//! and are never freed until the pool itself is dropped. A task borrows a
//! worker for its whole execution; releasing the worker keeps the stack but
//! discards the finished coroutine, so the next task starts on a pristine
//! one.

use crate::fiber::coroutine::Fiber;
use crate::fiber::{FiberState, Token};

use corosensei::stack::DefaultStack;
use log::debug;
use std::fmt;
use std::io;

/// Index of a worker plus the assignment generation it was handed out with.
///
/// The generation changes on every release, so an id held past its task's
/// termination no longer matches the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId {
    index: usize,
    generation: u64,
}

impl WorkerId {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker#{}.{}", self.index, self.generation)
    }
}

/// Occupancy figures for the pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Configured upper bound on workers.
    pub limit: usize,
    /// Workers currently assigned to a task.
    pub busy: usize,
    /// Highest `busy` ever observed.
    pub high_water: usize,
    /// Workers (stacks) allocated so far.
    pub created: usize,
}

struct Worker {
    stack: Option<DefaultStack>,
    fiber: Option<Fiber>,
    generation: u64,
    assigned: bool,
}

pub(crate) struct WorkerPool {
    workers: Vec<Worker>,
    free: Vec<usize>,
    limit: usize,
    stack_size: usize,
    busy: usize,
    high_water: usize,
}

impl WorkerPool {
    pub(crate) fn new(limit: usize, stack_size: usize) -> Self {
        Self {
            workers: Vec::with_capacity(limit),
            free: Vec::new(),
            limit,
            stack_size,
            busy: 0,
            high_water: 0,
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.busy >= self.limit
    }

    /// Assigns a free worker, allocating a new one if the pool has not yet
    /// grown to its limit. Returns `None` when every worker is busy.
    pub(crate) fn acquire(&mut self) -> io::Result<Option<WorkerId>> {
        if self.is_full() {
            return Ok(None);
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let stack = DefaultStack::new(self.stack_size)?;
                self.workers.push(Worker {
                    stack: Some(stack),
                    fiber: None,
                    generation: 0,
                    assigned: false,
                });

                let index = self.workers.len() - 1;
                debug!(
                    "worker pool: created worker {index} ({} bytes stack, {}/{})",
                    self.stack_size,
                    self.workers.len(),
                    self.limit
                );
                index
            }
        };

        let worker = &mut self.workers[index];
        worker.assigned = true;

        self.busy += 1;
        self.high_water = self.high_water.max(self.busy);

        Ok(Some(WorkerId {
            index,
            generation: worker.generation,
        }))
    }

    /// Hands out the stack of a freshly acquired worker so a fiber can be
    /// built on it.
    pub(crate) fn take_stack(&mut self, id: WorkerId) -> DefaultStack {
        let worker = self.worker_mut(id);
        worker
            .stack
            .take()
            .unwrap_or_else(|| panic!("{id} has no idle stack"))
    }

    /// Takes the fiber out of its slot so it can run without the pool being
    /// borrowed. It must be given back with [`checkin`](Self::checkin) or
    /// retired with [`release`](Self::release).
    ///
    /// # Panics
    /// Panics if the id is stale or the fiber is already running.
    pub(crate) fn checkout(&mut self, id: WorkerId) -> Fiber {
        let worker = self.worker_mut(id);
        worker
            .fiber
            .take()
            .unwrap_or_else(|| panic!("{id} is already running"))
    }

    /// Parks a suspended fiber in its slot. Also used to install a fiber
    /// after its first run.
    pub(crate) fn checkin(&mut self, id: WorkerId, fiber: Fiber) {
        let worker = self.worker_mut(id);
        worker.fiber = Some(fiber);
    }

    /// Returns a worker to the free list, keeping its stack for reuse.
    pub(crate) fn release(&mut self, id: WorkerId, stack: DefaultStack) {
        let worker = self.worker_mut(id);
        worker.stack = Some(stack);
        worker.fiber = None;
        worker.assigned = false;
        worker.generation = worker.generation.wrapping_add(1);

        self.busy -= 1;
        self.free.push(id.index);
    }

    /// Whether `id` still names a live assignment.
    pub(crate) fn is_current(&self, id: WorkerId) -> bool {
        self.workers
            .get(id.index)
            .is_some_and(|worker| worker.assigned && worker.generation == id.generation)
    }

    /// State of the fiber behind `id`; a checked-out fiber is running.
    pub(crate) fn fiber_state(&self, id: WorkerId) -> FiberState {
        if !self.is_current(id) {
            return FiberState::Terminated;
        }

        match &self.workers[id.index].fiber {
            Some(fiber) => fiber.state(),
            None => FiberState::Running,
        }
    }

    pub(crate) fn suspended_on(&self, id: WorkerId) -> Option<Token> {
        if !self.is_current(id) {
            return None;
        }

        self.workers[id.index]
            .fiber
            .as_ref()
            .and_then(|fiber| fiber.suspended_on())
    }

    /// Resume count of the fiber behind `id`, if it is parked in its slot.
    pub(crate) fn resumes(&self, id: WorkerId) -> Option<u64> {
        if !self.is_current(id) {
            return None;
        }

        self.workers[id.index].fiber.as_ref().map(Fiber::resumes)
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            limit: self.limit,
            busy: self.busy,
            high_water: self.high_water,
            created: self.workers.len(),
        }
    }

    /// Removes every parked fiber and unassigns its worker. The stacks go
    /// with the fibers: dropping a suspended fiber unwinds and frees it.
    pub(crate) fn drain_fibers(&mut self) -> Vec<Fiber> {
        let mut fibers = Vec::new();

        for worker in &mut self.workers {
            if let Some(fiber) = worker.fiber.take() {
                worker.assigned = false;
                worker.generation = worker.generation.wrapping_add(1);
                self.busy -= 1;
                fibers.push(fiber);
            }
        }

        fibers
    }

    fn worker_mut(&mut self, id: WorkerId) -> &mut Worker {
        if !self.is_current(id) {
            panic!("{id} is stale: its worker was released");
        }

        &mut self.workers[id.index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STACK: usize = 64 * 1024;

    #[test]
    fn acquire_stops_at_the_limit() {
        let mut pool = WorkerPool::new(2, STACK);

        let first = pool.acquire().unwrap().unwrap();
        let second = pool.acquire().unwrap().unwrap();
        assert_ne!(first.index(), second.index());
        assert!(pool.acquire().unwrap().is_none());

        let stats = pool.stats();
        assert_eq!(stats.busy, 2);
        assert_eq!(stats.high_water, 2);
        assert_eq!(stats.created, 2);
    }

    #[test]
    fn release_recycles_the_stack_with_a_new_generation() {
        let mut pool = WorkerPool::new(1, STACK);

        let id = pool.acquire().unwrap().unwrap();
        let stack = pool.take_stack(id);
        pool.release(id, stack);

        assert!(!pool.is_current(id));
        assert_eq!(pool.fiber_state(id), FiberState::Terminated);

        let again = pool.acquire().unwrap().unwrap();
        assert_eq!(again.index(), id.index());
        assert_ne!(again.generation(), id.generation());
        assert_eq!(pool.stats().created, 1);
        assert_eq!(pool.stats().busy, 1);
        assert_eq!(pool.stats().high_water, 1);
    }

    #[test]
    #[should_panic(expected = "stale")]
    fn stale_id_is_rejected() {
        let mut pool = WorkerPool::new(1, STACK);

        let id = pool.acquire().unwrap().unwrap();
        let stack = pool.take_stack(id);
        pool.release(id, stack);

        pool.checkout(id);
    }
}
