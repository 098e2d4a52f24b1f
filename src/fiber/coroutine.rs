use crate::error::TaskError;
use crate::fiber::context;
use crate::fiber::pool::WorkerId;
use crate::fiber::{FiberRef, FiberState, Message, Suspension, Token};
use crate::runtime::core::SchedulerCore;
use crate::task::{TaskCell, TaskState};

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use log::debug;
use std::cell::{Cell, RefCell};
use std::ptr;
use std::rc::{Rc, Weak};

/// How a task body finished.
pub(crate) type Outcome = Result<(), TaskError>;

pub(crate) type Body = Box<dyn FnOnce() -> Outcome>;

type FiberYielder = Yielder<Message, Suspension>;

/// Result of running a fiber until it gives control back.
pub(crate) enum Resumed {
    Suspended(Message),
    Terminated(Outcome),
}

/// State visible from inside and outside a running fiber.
pub(crate) struct FiberShared {
    core: Weak<SchedulerCore>,
    worker: WorkerId,
    state: Cell<FiberState>,
    suspended_on: Cell<Option<Token>>,
    /// Bumped on every resume; lets deferred resumes detect they are stale.
    resumes: Cell<u64>,
    yielder: Cell<*const FiberYielder>,
    task: RefCell<Option<Rc<dyn TaskCell>>>,
}

impl FiberShared {
    pub(crate) fn worker(&self) -> WorkerId {
        self.worker
    }

    pub(crate) fn core(&self) -> &Weak<SchedulerCore> {
        &self.core
    }

    pub(crate) fn resumes(&self) -> u64 {
        self.resumes.get()
    }

    pub(crate) fn fiber_ref(&self) -> FiberRef {
        FiberRef::new(self.core.clone(), self.worker)
    }

    pub(crate) fn task(&self) -> Option<Rc<dyn TaskCell>> {
        self.task.borrow().clone()
    }

    pub(crate) fn suspend(&self, token: Token, payload: Message) -> Result<Message, TaskError> {
        let yielder = self.yielder.get();
        assert!(!yielder.is_null(), "suspend({token}) before the fiber started");

        self.state.set(FiberState::Suspended);
        self.suspended_on.set(Some(token));

        let task = self.task();
        if let Some(task) = &task {
            task.control().set_state(TaskState::Suspended);
        }

        // The yielder lives on this fiber's own stack for as long as the
        // body runs, and we are running on that stack right now.
        let message = unsafe { &*yielder }.suspend(Suspension { token, payload });

        match task {
            Some(task) => {
                task.control().set_state(TaskState::Running);

                // A pending kill wins over whatever the resumer sent.
                if task.control().take_kill_request() {
                    if let Message::Error(error) = message {
                        debug!(
                            "{}: forwarded error dropped by a pending kill: {error}",
                            task.control().id()
                        );
                    }
                    return Err(TaskError::Killed);
                }

                if let Message::Error(error) = message {
                    return Err(TaskError::Forwarded(error));
                }

                task.on_resumed()?;

                Ok(message)
            }
            None => match message {
                Message::Error(error) => Err(TaskError::Forwarded(error)),
                message => Ok(message),
            },
        }
    }
}

/// A coroutine running one task body on a worker's stack.
///
/// Owned by the worker pool. The body and the stack are married for one task
/// only: when the body returns, [`Fiber::into_stack`] gives the stack back so
/// the worker can start the next task on a pristine coroutine.
pub(crate) struct Fiber {
    shared: Rc<FiberShared>,
    coroutine: Coroutine<Message, Suspension, Outcome, DefaultStack>,
}

impl Fiber {
    pub(crate) fn new(
        stack: DefaultStack,
        core: Weak<SchedulerCore>,
        worker: WorkerId,
        task: Option<Rc<dyn TaskCell>>,
        body: Body,
    ) -> Self {
        let shared = Rc::new(FiberShared {
            core,
            worker,
            state: Cell::new(FiberState::Ready),
            suspended_on: Cell::new(None),
            resumes: Cell::new(0),
            yielder: Cell::new(ptr::null()),
            task: RefCell::new(task),
        });

        let inner = shared.clone();
        let coroutine = Coroutine::with_stack(
            stack,
            move |yielder: &FiberYielder, _start: Message| -> Outcome {
                inner.yielder.set(yielder as *const FiberYielder);
                let outcome = body();
                inner.yielder.set(ptr::null());
                outcome
            },
        );

        Self { shared, coroutine }
    }

    pub(crate) fn shared(&self) -> &Rc<FiberShared> {
        &self.shared
    }

    pub(crate) fn state(&self) -> FiberState {
        self.shared.state.get()
    }

    pub(crate) fn suspended_on(&self) -> Option<Token> {
        self.shared.suspended_on.get()
    }

    pub(crate) fn resumes(&self) -> u64 {
        self.shared.resumes.get()
    }

    /// Runs a fresh fiber until it first suspends or terminates.
    pub(crate) fn start(&mut self) -> Resumed {
        match self.state() {
            FiberState::Ready => self.enter(Message::None),
            state => panic!("start() on a {state:?} fiber"),
        }
    }

    /// Resumes a fiber suspended on `token`.
    ///
    /// # Panics
    /// Panics if the fiber is not suspended, or is suspended on another token.
    pub(crate) fn resume(&mut self, token: Token, message: Message) -> Resumed {
        match self.state() {
            FiberState::Suspended => {}
            state => panic!("resume({token}) on a {state:?} fiber"),
        }

        match self.suspended_on() {
            Some(expected) if expected == token => {}
            expected => panic!(
                "resume token mismatch: fiber is suspended on {expected:?}, resumed with {token}"
            ),
        }

        self.enter(message)
    }

    fn enter(&mut self, message: Message) -> Resumed {
        let shared = self.shared.clone();
        shared.state.set(FiberState::Running);
        shared.suspended_on.set(None);
        shared.resumes.set(shared.resumes.get().wrapping_add(1));

        let coroutine = &mut self.coroutine;
        let result = context::enter(shared.clone(), || coroutine.resume(message));

        match result {
            CoroutineResult::Yield(suspension) => {
                debug_assert_eq!(shared.suspended_on.get(), Some(suspension.token));
                Resumed::Suspended(suspension.payload)
            }
            CoroutineResult::Return(outcome) => {
                shared.state.set(FiberState::Terminated);
                Resumed::Terminated(outcome)
            }
        }
    }

    /// Detaches the task and returns the stack of a terminated fiber.
    pub(crate) fn into_stack(self) -> DefaultStack {
        debug_assert_eq!(self.state(), FiberState::Terminated);
        self.shared.task.borrow_mut().take();
        self.coroutine.into_stack()
    }
}
