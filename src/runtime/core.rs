//! The scheduler: pending tasks, worker fibers and the readiness loop.
//!
//! One loop pass starts pending tasks while workers are free, delivers the
//! resumes deferred by the previous pass, polls the multiplexer (without
//! blocking when other work is runnable), and then starts whatever the
//! dispatched callbacks made runnable.

use crate::error::{SchedulerError, TaskError};
use crate::fiber::coroutine::{Fiber, Outcome, Resumed};
use crate::fiber::pool::WorkerPool;
use crate::fiber::{self, FiberRef, FiberState, Message, Token, WorkerId, context};
use crate::reactor::{Reactor, ReactorStats};
use crate::runtime::config::{SchedulerConfig, SchedulerStats};
use crate::runtime::queue::{DeferredResume, TaskQueue};
use crate::select_fiber::SelectFiber;
use crate::task::{Task, TaskCell, TaskControl, TaskCore, TaskHandle, TaskId, TaskState};

use log::{debug, error, info, trace, warn};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

type ExceptionHandler = Rc<dyn Fn(TaskId, &TaskError)>;

#[derive(Debug, Default, Clone, Copy)]
struct TaskCounters {
    scheduled: u64,
    completed: u64,
    failed: u64,
    killed: u64,
}

pub(crate) struct SchedulerCore {
    this: Weak<SchedulerCore>,
    config: SchedulerConfig,
    reactor: Rc<Reactor>,
    pool: RefCell<WorkerPool>,
    queue: RefCell<TaskQueue>,
    exception_handler: RefCell<ExceptionHandler>,
    next_task_id: Cell<u64>,
    counters: Cell<TaskCounters>,
    shut_down: Cell<bool>,
    torn_down: Cell<bool>,
}

impl SchedulerCore {
    fn new(config: SchedulerConfig) -> Result<Rc<Self>, SchedulerError> {
        config.validate()?;

        let reactor = Rc::new(Reactor::new(config.max_events)?);
        let pool = WorkerPool::new(config.worker_fiber_limit, config.worker_fiber_stack_size);
        let queue = TaskQueue::new(config.task_queue_limit);

        let default_handler: ExceptionHandler = Rc::new(|id: TaskId, error: &TaskError| {
            error!("{id} terminated with an unhandled error: {error}");
        });

        Ok(Rc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            reactor,
            pool: RefCell::new(pool),
            queue: RefCell::new(queue),
            exception_handler: RefCell::new(default_handler),
            next_task_id: Cell::new(1),
            counters: Cell::new(TaskCounters::default()),
            shut_down: Cell::new(false),
            torn_down: Cell::new(false),
        }))
    }

    pub(crate) fn reactor(&self) -> &Rc<Reactor> {
        &self.reactor
    }

    fn schedule<T: Task>(&self, task: T) -> Result<TaskHandle<T::Extensions>, SchedulerError> {
        if self.shut_down.get() {
            return Err(SchedulerError::ShutDown);
        }

        let id = TaskId(self.next_task_id.get());
        let core = TaskCore::new(id, task);
        let handle = core.handle(self.this.clone());

        let cell: Rc<dyn TaskCell> = core;
        let mut queue = self.queue.borrow_mut();
        if queue.push(cell).is_err() {
            return Err(SchedulerError::QueueFull {
                limit: queue.limit(),
            });
        }

        self.next_task_id.set(id.0 + 1);
        self.count(|counters| counters.scheduled += 1);
        debug!("scheduler: queued {id} ({})", handle.name());

        Ok(handle)
    }

    /// Starts pending tasks while workers are free, then delivers the
    /// resumes deferred so far. Returns how many fibers ran.
    fn run_ready(&self) -> Result<usize, SchedulerError> {
        let killed = self.queue.borrow_mut().take_killed();
        for task in killed {
            self.abandon(task);
        }

        let mut ran = 0;

        while !self.shut_down.get() && !self.pool.borrow().is_full() {
            let task = match self.queue.borrow_mut().pop() {
                Some(task) => task,
                None => break,
            };

            if task.control().kill_requested() {
                self.abandon(task);
                continue;
            }

            if self.start(task)? {
                ran += 1;
            }
        }

        let deferred = self.queue.borrow_mut().take_deferred();
        for resume in deferred {
            if self.shut_down.get() {
                break;
            }

            if self.is_deliverable(&resume) {
                self.resume_worker(resume.worker, resume.token, Message::None);
                ran += 1;
            } else {
                trace!(
                    "scheduler: dropped stale resume of {} on {}",
                    resume.worker, resume.token
                );
            }
        }

        Ok(ran)
    }

    fn abandon(&self, task: Rc<dyn TaskCell>) {
        debug!("scheduler: {} killed before it started", task.control().id());
        task.abandon();
        self.report(task.control().id(), Err(TaskError::Killed));
    }

    /// Runs `task` on a free worker until it first suspends or terminates.
    /// Returns `false` (and requeues the task) if no worker was free.
    fn start(&self, task: Rc<dyn TaskCell>) -> Result<bool, SchedulerError> {
        let acquired = self.pool.borrow_mut().acquire();
        let worker = match acquired {
            Ok(Some(worker)) => worker,
            Ok(None) => {
                self.queue.borrow_mut().unpop(task);
                return Ok(false);
            }
            Err(error) => {
                self.queue.borrow_mut().unpop(task);
                return Err(error.into());
            }
        };

        let stack = self.pool.borrow_mut().take_stack(worker);

        let control = task.control();
        let fiber_ref = FiberRef::new(self.this.clone(), worker);
        let select_fiber = Rc::new(SelectFiber::new(fiber_ref.clone(), self.reactor.clone()));
        control.assign(fiber_ref, select_fiber);
        control.set_state(TaskState::Running);

        debug!(
            "scheduler: starting {} ({}) on {worker}",
            control.id(),
            control.name()
        );

        let body = task.clone().into_body(self.this.clone());
        let mut fiber = Fiber::new(stack, self.this.clone(), worker, Some(task), body);
        let resumed = fiber.start();
        self.settle(worker, fiber, resumed);

        Ok(true)
    }

    /// Resumes the fiber behind `worker` with `message`.
    ///
    /// # Panics
    /// Panics if the fiber is not suspended on `token`. The fiber is left
    /// untouched.
    pub(crate) fn resume_worker(&self, worker: WorkerId, token: Token, message: Message) -> Message {
        match self.fiber_state(worker) {
            FiberState::Suspended => {}
            state => panic!("resume({token}) on a {state:?} fiber"),
        }

        match self.fiber_suspended_on(worker) {
            Some(expected) if expected == token => {}
            expected => panic!(
                "resume token mismatch: fiber is suspended on {expected:?}, resumed with {token}"
            ),
        }

        let mut fiber = self.pool.borrow_mut().checkout(worker);

        if let Some(task) = fiber.shared().task() {
            task.control().set_state(TaskState::Running);
        }

        let resumed = fiber.resume(token, message);
        self.settle(worker, fiber, resumed)
    }

    /// Parks a suspended fiber or retires a terminated one.
    fn settle(&self, worker: WorkerId, fiber: Fiber, resumed: Resumed) -> Message {
        match resumed {
            Resumed::Suspended(payload) => {
                self.pool.borrow_mut().checkin(worker, fiber);
                payload
            }
            Resumed::Terminated(outcome) => {
                self.finish(worker, fiber, outcome);
                Message::None
            }
        }
    }

    fn finish(&self, worker: WorkerId, fiber: Fiber, outcome: Outcome) {
        let task = fiber.shared().task();

        let stack = fiber.into_stack();
        self.pool.borrow_mut().release(worker, stack);

        let task = match task {
            Some(task) => task,
            None => return,
        };

        let control = task.control();
        control.set_state(TaskState::Terminated);
        self.unbind(control);
        task.on_terminated();

        self.report(control.id(), outcome);
    }

    /// Unregisters whatever the task's adapter still has bound.
    fn unbind(&self, control: &TaskControl) {
        if let Some(select_fiber) = control.take_select_fiber() {
            if let Err(error) = select_fiber.unregister() {
                debug!("scheduler: unregister for {} failed: {error}", control.id());
            }
        }
    }

    fn report(&self, id: TaskId, outcome: Outcome) {
        match outcome {
            Ok(()) => {
                debug!("scheduler: {id} completed");
                self.count(|counters| counters.completed += 1);
            }
            Err(TaskError::Killed) => {
                debug!("scheduler: {id} was killed");
                self.count(|counters| counters.killed += 1);
            }
            Err(error) => {
                self.count(|counters| counters.failed += 1);
                let handler = self.exception_handler.borrow().clone();
                handler(id, &error);
            }
        }
    }

    /// Delivers a kill to a task that has started. A suspended task is
    /// resumed on its current token by the next pass.
    pub(crate) fn kill_task(&self, control: &TaskControl) {
        if control.state() != TaskState::Suspended {
            return;
        }

        let worker = match control.fiber() {
            Some(fiber) => fiber.worker(),
            None => return,
        };

        let token = self.pool.borrow().suspended_on(worker);
        if let Some(token) = token {
            debug!("scheduler: kill of {} deferred to the next pass", control.id());
            self.queue_resume(worker, token);
        }
    }

    /// Defers a resume of the fiber behind `worker` to the next pass. It is
    /// dropped if the fiber has been resumed in the meantime.
    pub(crate) fn queue_resume(&self, worker: WorkerId, token: Token) {
        let resumes = self.pool.borrow().resumes(worker);

        match resumes {
            Some(resumes) => self.queue.borrow_mut().defer(DeferredResume {
                worker,
                token,
                resumes,
            }),
            None => self.defer_current(worker, token),
        }
    }

    /// Defers a resume of the calling fiber, which is about to suspend on
    /// `token`.
    fn defer_current(&self, worker: WorkerId, token: Token) {
        let current = context::current()
            .unwrap_or_else(|| panic!("defer({token}) called outside of a worker fiber"));
        assert_eq!(current.worker(), worker, "defer({token}) for another fiber");

        // The pending suspend does not bump the count; the resume will.
        self.queue.borrow_mut().defer(DeferredResume {
            worker,
            token,
            resumes: current.resumes(),
        });
    }

    fn is_deliverable(&self, resume: &DeferredResume) -> bool {
        let pool = self.pool.borrow();
        pool.suspended_on(resume.worker) == Some(resume.token)
            && pool.resumes(resume.worker) == Some(resume.resumes)
    }

    pub(crate) fn fiber_state(&self, worker: WorkerId) -> FiberState {
        self.pool.borrow().fiber_state(worker)
    }

    pub(crate) fn fiber_suspended_on(&self, worker: WorkerId) -> Option<Token> {
        self.pool.borrow().suspended_on(worker)
    }

    fn has_runnable(&self) -> bool {
        let queue = self.queue.borrow();
        queue.has_deferred() || (queue.pending_len() > 0 && !self.pool.borrow().is_full())
    }

    /// One loop pass; blocks in the multiplexer only if `block` is set and
    /// nothing else is runnable.
    fn pass(&self, block: bool) -> Result<usize, SchedulerError> {
        let mut ran = self.run_ready()?;

        if self.reactor.is_stopping() || self.shut_down.get() {
            return Ok(ran);
        }

        let timeout = if !block || self.has_runnable() {
            Some(Duration::ZERO)
        } else if self.reactor.has_work() {
            None
        } else {
            return Ok(ran);
        };

        ran += self.reactor.select(timeout)?;
        ran += self.run_ready()?;

        Ok(ran)
    }

    fn event_loop(&self) -> Result<(), SchedulerError> {
        assert!(!fiber::in_fiber(), "event_loop() called from inside a task");

        loop {
            if self.reactor.clear_stop() || self.shut_down.get() {
                info!("scheduler: event loop stopped");
                break;
            }

            if !self.reactor.has_work() && !self.has_runnable() {
                let pending = self.queue.borrow().pending_len();
                if pending > 0 {
                    warn!(
                        "scheduler: {pending} tasks are waiting for a worker but no worker can be released"
                    );
                }
                break;
            }

            self.pass(true)?;
        }

        if self.shut_down.get() {
            self.teardown();
        }

        Ok(())
    }

    fn process_events(&self) -> Result<usize, SchedulerError> {
        assert!(!fiber::in_fiber(), "process_events() called from inside a task");

        let ran = self.pass(false)?;

        if self.shut_down.get() {
            self.teardown();
        }

        Ok(ran)
    }

    fn shutdown(&self) {
        if self.shut_down.replace(true) {
            return;
        }

        info!("scheduler: shutting down");
        self.reactor.shutdown();

        if !fiber::in_fiber() {
            self.teardown();
        }
    }

    /// Terminates every task still alive and unregisters every client.
    /// Suspended fibers are dropped, which unwinds their stacks.
    fn teardown(&self) {
        if self.torn_down.replace(true) {
            return;
        }

        let pending = self.queue.borrow_mut().drain_pending();
        for task in pending {
            self.abandon(task);
        }

        self.queue.borrow_mut().clear_deferred();

        let fibers = self.pool.borrow_mut().drain_fibers();
        for fiber in fibers {
            let task = fiber.shared().task();
            if let Some(task) = &task {
                task.control().discard();
            }

            if std::thread::panicking() {
                // Unwinding a fiber stack in the middle of a panic aborts.
                std::mem::forget(fiber);
            } else {
                drop(fiber);
            }

            if let Some(task) = task {
                let control = task.control();
                control.set_state(TaskState::Terminated);
                self.unbind(control);
                task.on_terminated();
                self.report(control.id(), Err(TaskError::Killed));
            }
        }

        self.reactor.clear();
        self.reactor.clear_stop();
    }

    fn stats(&self) -> SchedulerStats {
        let pool = self.pool.borrow().stats();
        let queue = self.queue.borrow();
        let counters = self.counters.get();

        SchedulerStats {
            worker_fiber_total: pool.limit,
            worker_fiber_busy: pool.busy,
            worker_fiber_high_water: pool.high_water,
            worker_fibers_created: pool.created,
            task_queue_busy: queue.pending_len(),
            task_queue_limit: queue.limit(),
            tasks_scheduled: counters.scheduled,
            tasks_completed: counters.completed,
            tasks_failed: counters.failed,
            tasks_killed: counters.killed,
        }
    }

    fn count(&self, f: impl FnOnce(&mut TaskCounters)) {
        let mut counters = self.counters.get();
        f(&mut counters);
        self.counters.set(counters);
    }
}

impl Drop for SchedulerCore {
    fn drop(&mut self) {
        self.shut_down.set(true);
        self.teardown();
    }
}

/// Cooperative scheduler running tasks on a bounded pool of worker fibers.
///
/// Cheap to clone; every clone drives the same scheduler. Everything runs on
/// the thread that created it.
///
/// # Example
///
/// ```ignore
/// let scheduler = Scheduler::builder().worker_fiber_limit(4).build()?;
///
/// scheduler.schedule(task::from_fn(|cx| {
///     let event = FiberEvent::new(cx.select_fiber())?;
///     event.cede()?;
///     Ok(())
/// }))?;
///
/// scheduler.event_loop()?;
/// ```
#[derive(Clone)]
pub struct Scheduler {
    core: Rc<SchedulerCore>,
}

impl Scheduler {
    /// Creates an independent scheduler. See also [`init`](crate::runtime::init)
    /// for the per-thread instance.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let core = SchedulerCore::new(config)?;

        info!(
            "scheduler: initialized ({} workers, {} bytes stacks, {} queued tasks)",
            core.config.worker_fiber_limit,
            core.config.worker_fiber_stack_size,
            core.config.task_queue_limit
        );

        Ok(Self { core })
    }

    pub fn builder() -> crate::builder::SchedulerBuilder {
        crate::builder::SchedulerBuilder::new()
    }

    pub(crate) fn from_weak(core: &Weak<SchedulerCore>) -> Self {
        let core = core
            .upgrade()
            .unwrap_or_else(|| panic!("scheduler used after it was dropped"));

        Self { core }
    }

    pub(crate) fn core(&self) -> &Rc<SchedulerCore> {
        &self.core
    }

    /// Queues `task`. It starts on the next loop pass that finds a free
    /// worker.
    pub fn schedule<T: Task>(&self, task: T) -> Result<TaskHandle<T::Extensions>, SchedulerError> {
        self.core.schedule(task)
    }

    /// Runs loop passes until [`shutdown`](Self::shutdown) or until there is
    /// nothing left to wait for.
    ///
    /// # Panics
    /// Panics if called from inside a task.
    pub fn event_loop(&self) -> Result<(), SchedulerError> {
        self.core.event_loop()
    }

    /// Runs exactly one non-blocking pass. Returns how many fibers and
    /// callbacks ran.
    ///
    /// # Panics
    /// Panics if called from inside a task.
    pub fn process_events(&self) -> Result<usize, SchedulerError> {
        self.core.process_events()
    }

    /// Stops the event loop and terminates every remaining task. Called from
    /// inside a task, the teardown happens once the loop returns.
    pub fn shutdown(&self) {
        self.core.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.core.shut_down.get()
    }

    /// Replaces the hook receiving every task failure other than a kill.
    pub fn set_exception_handler<F>(&self, handler: F)
    where
        F: Fn(TaskId, &TaskError) + 'static,
    {
        *self.core.exception_handler.borrow_mut() = Rc::new(handler);
    }

    pub fn stats(&self) -> SchedulerStats {
        self.core.stats()
    }

    pub fn reactor(&self) -> &Rc<Reactor> {
        self.core.reactor()
    }

    pub fn reactor_stats(&self) -> ReactorStats {
        self.core.reactor.stats()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.core.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task;

    use std::cell::RefCell;

    fn small(workers: usize) -> Scheduler {
        Scheduler::new(SchedulerConfig {
            worker_fiber_limit: workers,
            worker_fiber_stack_size: 64 * 1024,
            task_queue_limit: 8,
            max_events: 8,
        })
        .unwrap()
    }

    #[test]
    fn a_task_runs_to_completion_on_one_pass() {
        let scheduler = small(1);
        let ran = Rc::new(Cell::new(false));

        let flag = ran.clone();
        let handle = scheduler
            .schedule(task::from_fn(move |_cx| {
                flag.set(true);
                Ok(())
            }))
            .unwrap();

        assert_eq!(handle.state(), TaskState::Created);
        scheduler.process_events().unwrap();

        assert!(ran.get());
        assert!(handle.is_terminated());
        assert_eq!(scheduler.stats().tasks_completed, 1);
        assert_eq!(scheduler.stats().worker_fiber_busy, 0);
    }

    #[test]
    fn yield_now_interleaves_tasks() {
        let scheduler = small(2);
        let trace = Rc::new(RefCell::new(Vec::new()));

        for name in ["a", "b"] {
            let trace = trace.clone();
            scheduler
                .schedule(task::from_fn(move |cx| {
                    trace.borrow_mut().push(format!("{name}1"));
                    cx.yield_now()?;
                    trace.borrow_mut().push(format!("{name}2"));
                    Ok(())
                }))
                .unwrap();
        }

        scheduler.event_loop().unwrap();

        assert_eq!(*trace.borrow(), ["a1", "b1", "a2", "b2"]);
        assert_eq!(scheduler.stats().tasks_completed, 2);
    }

    #[test]
    fn queue_limit_is_enforced() {
        let scheduler = Scheduler::new(SchedulerConfig {
            task_queue_limit: 1,
            ..SchedulerConfig::default()
        })
        .unwrap();

        scheduler.schedule(task::from_fn(|_| Ok(()))).unwrap();
        let second = scheduler.schedule(task::from_fn(|_| Ok(())));

        assert!(matches!(second, Err(SchedulerError::QueueFull { limit: 1 })));
    }

    #[test]
    fn failures_reach_the_exception_handler() {
        let scheduler = small(1);
        let seen = Rc::new(RefCell::new(Vec::new()));

        let sink = seen.clone();
        scheduler.set_exception_handler(move |id, error| {
            sink.borrow_mut().push((id, error.to_string()));
        });

        let handle = scheduler
            .schedule(task::from_fn(|_| Err(TaskError::Failed("boom".into()))))
            .unwrap();

        scheduler.process_events().unwrap();

        assert_eq!(*seen.borrow(), [(handle.id(), "task failed: boom".to_owned())]);
        assert_eq!(scheduler.stats().tasks_failed, 1);
    }

    #[test]
    fn shutdown_rejects_new_tasks() {
        let scheduler = small(1);
        scheduler.shutdown();

        assert!(scheduler.is_shut_down());
        assert!(matches!(
            scheduler.schedule(task::from_fn(|_| Ok(()))),
            Err(SchedulerError::ShutDown)
        ));
    }
}
