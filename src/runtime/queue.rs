//! FIFO queues feeding the scheduler's loop passes.
//!
//! Holds tasks waiting for a worker fiber, and resumes deferred to the next
//! pass (yields and kills of suspended tasks).

use crate::fiber::{Token, WorkerId};
use crate::task::TaskCell;

use std::collections::VecDeque;
use std::rc::Rc;

/// A resume to deliver on the next pass, if the fiber is still suspended on
/// `token` and has not been resumed since.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DeferredResume {
    pub(crate) worker: WorkerId,
    pub(crate) token: Token,
    pub(crate) resumes: u64,
}

pub(crate) struct TaskQueue {
    pending: VecDeque<Rc<dyn TaskCell>>,
    deferred: VecDeque<DeferredResume>,
    limit: usize,
}

impl TaskQueue {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            deferred: VecDeque::new(),
            limit,
        }
    }

    /// Enqueues a task; gives it back if the queue is at its limit.
    pub(crate) fn push(&mut self, task: Rc<dyn TaskCell>) -> Result<(), Rc<dyn TaskCell>> {
        if self.pending.len() >= self.limit {
            return Err(task);
        }

        self.pending.push_back(task);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Option<Rc<dyn TaskCell>> {
        self.pending.pop_front()
    }

    /// Puts back a task that could not be started, keeping its place.
    pub(crate) fn unpop(&mut self, task: Rc<dyn TaskCell>) {
        self.pending.push_front(task);
    }

    /// Removes every pending task that has been asked to die.
    pub(crate) fn take_killed(&mut self) -> Vec<Rc<dyn TaskCell>> {
        let mut killed = Vec::new();
        self.pending.retain(|task| {
            if task.control().kill_requested() {
                killed.push(task.clone());
                false
            } else {
                true
            }
        });
        killed
    }

    pub(crate) fn drain_pending(&mut self) -> Vec<Rc<dyn TaskCell>> {
        self.pending.drain(..).collect()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    pub(crate) fn defer(&mut self, resume: DeferredResume) {
        self.deferred.push_back(resume);
    }

    /// Takes the resumes queued so far. Resumes deferred while these run wait
    /// for the next pass.
    pub(crate) fn take_deferred(&mut self) -> Vec<DeferredResume> {
        self.deferred.drain(..).collect()
    }

    pub(crate) fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    pub(crate) fn clear_deferred(&mut self) {
        self.deferred.clear();
    }
}
