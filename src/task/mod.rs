//! Tasks: the user-facing unit of cooperative work.
//!
//! A task is scheduled on a [`Scheduler`], waits in the pending queue until a
//! worker fiber is free, and then runs its body on that fiber until it
//! returns. While running it suspends only at explicit points (I/O, event or
//! timer waits, [`TaskContext::yield_now`]).
//!
//! # Example
//!
//! ```ignore
//! use fiber_reactor::{Scheduler, SchedulerConfig, task};
//!
//! let scheduler = Scheduler::new(SchedulerConfig::default())?;
//! scheduler.schedule(task::from_fn(|cx| {
//!     cx.yield_now()?;
//!     Ok(())
//! }))?;
//! scheduler.event_loop()?;
//! ```
//!
//! # Lifecycle
//!
//! `Created -> Running -> (Suspended <-> Running)* -> Terminated`
//!
//! [`TaskHandle::kill`] marks a task for cancellation. A task that has not
//! started is terminated without running; a started task observes
//! [`TaskError::Killed`] at its next resume point, exactly once.
//!
//! [`Scheduler`]: crate::Scheduler

pub mod extension;

pub use extension::{ExceptionForwarding, Extension, Extensions, LegacyAdapter};

use crate::error::TaskError;
use crate::fiber::coroutine::Body;
use crate::fiber::{FiberRef, Message, Token};
use crate::reactor::Reactor;
use crate::runtime::Scheduler;
use crate::runtime::core::SchedulerCore;
use crate::select_fiber::SelectFiber;

use std::cell::{Cell, RefCell, RefMut};
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

/// Suspension token used by [`TaskContext::yield_now`].
pub const YIELD: Token = Token::new("yield");

/// Identifier assigned to a task when it is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Suspended,
    Terminated,
}

/// A unit of cooperative work.
pub trait Task: 'static {
    /// Per-instance extension state, e.g. `(ExceptionForwarding,)`.
    type Extensions: Extensions;

    /// The task body, run on a worker fiber.
    fn run(&mut self, cx: &TaskContext<Self::Extensions>) -> Result<(), TaskError>;

    /// Called once the task has terminated, however it terminated.
    fn on_terminated(&mut self, _outcome: &Result<(), TaskError>) {}

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// A task built from a closure. See [`from_fn`] and [`with_extensions`].
pub struct FnTask<F, E = ()> {
    body: Option<F>,
    _extensions: PhantomData<fn() -> E>,
}

impl<F, E> Task for FnTask<F, E>
where
    F: FnOnce(&TaskContext<E>) -> Result<(), TaskError> + 'static,
    E: Extensions,
{
    type Extensions = E;

    fn run(&mut self, cx: &TaskContext<E>) -> Result<(), TaskError> {
        match self.body.take() {
            Some(body) => body(cx),
            None => Ok(()),
        }
    }

    fn name(&self) -> &str {
        "fn-task"
    }
}

/// Wraps a closure as a task without extensions.
pub fn from_fn<F>(body: F) -> FnTask<F, ()>
where
    F: FnOnce(&TaskContext<()>) -> Result<(), TaskError> + 'static,
{
    FnTask {
        body: Some(body),
        _extensions: PhantomData,
    }
}

/// Wraps a closure as a task carrying the extensions `E`.
pub fn with_extensions<E, F>(body: F) -> FnTask<F, E>
where
    E: Extensions,
    F: FnOnce(&TaskContext<E>) -> Result<(), TaskError> + 'static,
{
    FnTask {
        body: Some(body),
        _extensions: PhantomData,
    }
}

/// Lifecycle bookkeeping shared by a task's handle, its context and the
/// scheduler.
pub(crate) struct TaskControl {
    id: TaskId,
    name: String,
    state: Cell<TaskState>,
    kill_requested: Cell<bool>,
    kill_delivered: Cell<bool>,
    discarded: Cell<bool>,
    fiber: RefCell<Option<FiberRef>>,
    select_fiber: RefCell<Option<Rc<SelectFiber>>>,
}

impl TaskControl {
    fn new(id: TaskId, name: String) -> Self {
        Self {
            id,
            name,
            state: Cell::new(TaskState::Created),
            kill_requested: Cell::new(false),
            kill_delivered: Cell::new(false),
            discarded: Cell::new(false),
            fiber: RefCell::new(None),
            select_fiber: RefCell::new(None),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.set(state);
    }

    pub(crate) fn request_kill(&self) {
        self.kill_requested.set(true);
    }

    pub(crate) fn kill_requested(&self) -> bool {
        self.kill_requested.get()
    }

    /// Consumes a pending kill request. Returns `true` at most once.
    pub(crate) fn take_kill_request(&self) -> bool {
        if self.kill_requested.get() && !self.kill_delivered.get() {
            self.kill_delivered.set(true);
            return true;
        }

        false
    }

    /// Marks a suspended task whose fiber is about to be dropped. The
    /// unwinding that follows must not be caught as a task panic.
    pub(crate) fn discard(&self) {
        self.discarded.set(true);
    }

    pub(crate) fn is_discarded(&self) -> bool {
        self.discarded.get()
    }

    pub(crate) fn assign(&self, fiber: FiberRef, select_fiber: Rc<SelectFiber>) {
        *self.fiber.borrow_mut() = Some(fiber);
        *self.select_fiber.borrow_mut() = Some(select_fiber);
    }

    pub(crate) fn fiber(&self) -> Option<FiberRef> {
        self.fiber.borrow().clone()
    }

    pub(crate) fn select_fiber(&self) -> Option<Rc<SelectFiber>> {
        self.select_fiber.borrow().clone()
    }

    pub(crate) fn take_select_fiber(&self) -> Option<Rc<SelectFiber>> {
        self.select_fiber.borrow_mut().take()
    }
}

/// Type-erased view of a scheduled task, as stored by the scheduler and by
/// the fiber running it.
pub(crate) trait TaskCell {
    fn control(&self) -> &TaskControl;

    /// Runs the extensions' resume hooks inside the task's fiber.
    fn on_resumed(&self) -> Result<(), TaskError>;

    /// Runs the extensions' termination hooks.
    fn on_terminated(&self);

    /// Takes the task body, to be run once on a worker fiber.
    fn into_body(self: Rc<Self>, core: Weak<SchedulerCore>) -> Body;

    /// Terminates a task that never started.
    fn abandon(&self);
}

/// State reachable from both the task's context and its handle.
pub(crate) struct TaskShared<E> {
    control: TaskControl,
    extensions: RefCell<E>,
}

pub(crate) struct TaskCore<T: Task> {
    shared: Rc<TaskShared<T::Extensions>>,
    task: RefCell<Option<T>>,
}

impl<T: Task> TaskCore<T> {
    pub(crate) fn new(id: TaskId, task: T) -> Rc<Self> {
        let name = task.name().to_owned();

        Rc::new(Self {
            shared: Rc::new(TaskShared {
                control: TaskControl::new(id, name),
                extensions: RefCell::new(T::Extensions::default()),
            }),
            task: RefCell::new(Some(task)),
        })
    }

    pub(crate) fn handle(&self, core: Weak<SchedulerCore>) -> TaskHandle<T::Extensions> {
        TaskHandle {
            shared: self.shared.clone(),
            core,
        }
    }
}

impl<T: Task> TaskCell for TaskCore<T> {
    fn control(&self) -> &TaskControl {
        &self.shared.control
    }

    fn on_resumed(&self) -> Result<(), TaskError> {
        self.shared.extensions.borrow_mut().on_resumed()
    }

    fn on_terminated(&self) {
        self.shared.extensions.borrow_mut().on_terminated();
    }

    fn into_body(self: Rc<Self>, core: Weak<SchedulerCore>) -> Body {
        let mut task = self
            .task
            .borrow_mut()
            .take()
            .unwrap_or_else(|| panic!("{} was started twice", self.shared.control.id()));

        let cx = TaskContext {
            shared: self.shared.clone(),
            core,
        };

        Box::new(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| task.run(&cx))) {
                Ok(outcome) => outcome,
                Err(payload) if cx.shared.control.is_discarded() => panic::resume_unwind(payload),
                Err(payload) => Err(TaskError::panicked(payload.as_ref())),
            };

            task.on_terminated(&outcome);
            outcome
        })
    }

    fn abandon(&self) {
        let task = self.task.borrow_mut().take();
        if let Some(mut task) = task {
            task.on_terminated(&Err(TaskError::Killed));
        }

        self.shared.control.set_state(TaskState::Terminated);
        self.on_terminated();
    }
}

/// What a running task sees of itself and its scheduler.
pub struct TaskContext<E = ()> {
    shared: Rc<TaskShared<E>>,
    core: Weak<SchedulerCore>,
}

impl<E: Extensions> TaskContext<E> {
    pub fn id(&self) -> TaskId {
        self.shared.control.id()
    }

    /// The worker fiber this task runs on.
    pub fn fiber(&self) -> FiberRef {
        self.shared
            .control
            .fiber()
            .unwrap_or_else(|| panic!("{} has no worker fiber", self.id()))
    }

    /// The registration adapter bound to this task's fiber. Whatever is still
    /// registered through it when the task terminates is unregistered.
    pub fn select_fiber(&self) -> Rc<SelectFiber> {
        self.shared
            .control
            .select_fiber()
            .unwrap_or_else(|| panic!("{} has no select fiber", self.id()))
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::from_weak(&self.core)
    }

    pub fn reactor(&self) -> Rc<Reactor> {
        self.scheduler().reactor().clone()
    }

    /// Mutable access to this task's extension state. Do not hold the guard
    /// across a suspend point.
    pub fn extensions(&self) -> RefMut<'_, E> {
        self.shared.extensions.borrow_mut()
    }

    pub fn kill_requested(&self) -> bool {
        self.shared.control.kill_requested()
    }

    /// Suspends this task on `token`; see [`crate::fiber::suspend`].
    pub fn suspend(&self, token: Token, payload: Message) -> Result<Message, TaskError> {
        self.fiber().suspend(token, payload)
    }

    /// Lets every other runnable task and pending readiness event go first,
    /// then continues on the next loop pass.
    pub fn yield_now(&self) -> Result<(), TaskError> {
        let fiber = self.fiber();
        self.scheduler().core().queue_resume(fiber.worker(), YIELD);
        fiber.suspend(YIELD, Message::None)?;

        Ok(())
    }
}

/// Handle to a scheduled task, usable from any other execution context.
pub struct TaskHandle<E = ()> {
    shared: Rc<TaskShared<E>>,
    core: Weak<SchedulerCore>,
}

impl<E> Clone for TaskHandle<E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            core: self.core.clone(),
        }
    }
}

impl<E: Extensions> TaskHandle<E> {
    pub fn id(&self) -> TaskId {
        self.shared.control.id()
    }

    pub fn name(&self) -> &str {
        self.shared.control.name()
    }

    pub fn state(&self) -> TaskState {
        self.shared.control.state()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == TaskState::Terminated
    }

    /// The worker fiber the task runs on, once started.
    pub fn fiber(&self) -> Option<FiberRef> {
        match self.state() {
            TaskState::Created | TaskState::Terminated => None,
            _ => self.shared.control.fiber(),
        }
    }

    /// Mutable access to the task's extension state, e.g. to set a pending
    /// exception while the task is suspended.
    pub fn extensions(&self) -> RefMut<'_, E> {
        self.shared.extensions.borrow_mut()
    }

    /// Requests cancellation. Has no effect on a terminated task.
    pub fn kill(&self) {
        let control = &self.shared.control;
        if control.state() == TaskState::Terminated {
            return;
        }

        control.request_kill();

        if let Some(core) = self.core.upgrade() {
            core.kill_task(control);
        }
    }

    /// Resumes the suspended task with `message`; see [`FiberRef::resume`].
    ///
    /// # Panics
    /// Panics if the task is not suspended on `token`.
    pub fn resume(&self, token: Token, message: Message) -> Message {
        match self.fiber() {
            Some(fiber) => fiber.resume(token, message),
            None => panic!("resume({token}) on {} in state {:?}", self.id(), self.state()),
        }
    }
}

impl<E> fmt::Debug for TaskHandle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.shared.control.id())
            .field("state", &self.shared.control.state())
            .finish()
    }
}
