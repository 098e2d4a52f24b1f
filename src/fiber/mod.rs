//! Stackful fibers and the token-tagged suspend/resume handshake.
//!
//! A fiber suspends with [`suspend`], naming *why* it waits with a
//! [`Token`], and is resumed through its [`FiberRef`] with the same token
//! and a [`Message`]. Resuming with any other token, or resuming a fiber
//! that is not suspended, is a bug in the caller and panics.
//!
//! # Example
//!
//! ```ignore
//! const READY: Token = Token::new("ready");
//!
//! // inside a task
//! let message = fiber::suspend(READY, Message::None)?;
//!
//! // elsewhere, e.g. in a readiness callback
//! fiber_ref.resume(READY, Message::Num(1));
//! ```

pub(crate) mod context;
pub(crate) mod coroutine;
pub(crate) mod pool;

pub use pool::WorkerId;

use crate::error::TaskError;
use crate::runtime::core::SchedulerCore;

use std::error::Error as StdError;
use std::fmt;
use std::rc::Weak;

/// Symbolic reason a fiber is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(&'static str);

impl Token {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Payload carried across a suspend/resume boundary.
#[derive(Debug, Default)]
pub enum Message {
    #[default]
    None,
    Num(u64),
    /// An error to be raised inside the resumed fiber as soon as its
    /// `suspend` returns.
    Error(Box<dyn StdError + 'static>),
}

impl Message {
    pub fn num(&self) -> Option<u64> {
        match self {
            Message::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn error<E>(error: E) -> Self
    where
        E: StdError + 'static,
    {
        Message::Error(Box::new(error))
    }
}

/// Lifecycle of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    Ready,
    Running,
    Suspended,
    Terminated,
}

/// What a fiber hands back to its resumer when it suspends.
#[derive(Debug)]
pub(crate) struct Suspension {
    pub(crate) token: Token,
    pub(crate) payload: Message,
}

/// Suspends the calling fiber until it is resumed with `token`.
///
/// `payload` is returned to whoever resumed this fiber. The returned message
/// is the one passed to [`FiberRef::resume`]; a [`Message::Error`] is turned
/// into [`TaskError::Forwarded`], and a pending kill into
/// [`TaskError::Killed`], before this function returns.
///
/// # Panics
/// Panics if called outside of a worker fiber.
pub fn suspend(token: Token, payload: Message) -> Result<Message, TaskError> {
    let fiber = context::current()
        .unwrap_or_else(|| panic!("suspend({token}) called outside of a worker fiber"));

    fiber.suspend(token, payload)
}

/// Whether the caller is running on a worker fiber.
pub fn in_fiber() -> bool {
    context::current().is_some()
}

/// The fiber the caller is running on, if any.
pub fn current() -> Option<FiberRef> {
    context::current().map(|fiber| fiber.fiber_ref())
}

/// Non-owning handle to a worker fiber.
///
/// The worker pool owns every fiber; a `FiberRef` names one by index and
/// assignment generation. Once the worker is released the handle goes stale
/// and resuming through it panics.
#[derive(Clone)]
pub struct FiberRef {
    pub(crate) core: Weak<SchedulerCore>,
    pub(crate) worker: WorkerId,
}

impl FiberRef {
    pub(crate) fn new(core: Weak<SchedulerCore>, worker: WorkerId) -> Self {
        Self { core, worker }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Resumes the fiber, which must be suspended on `token`, and runs it
    /// until it suspends again or terminates. Returns the payload of its next
    /// suspension, or [`Message::None`] if it terminated.
    ///
    /// # Panics
    /// Panics on a token mismatch, or if the fiber is not suspended, or if its
    /// worker was released.
    pub fn resume(&self, token: Token, message: Message) -> Message {
        let core = self
            .core
            .upgrade()
            .unwrap_or_else(|| panic!("resume({token}) after the scheduler was dropped"));

        core.resume_worker(self.worker, token, message)
    }

    /// Suspends the calling fiber, which must be the one this handle names.
    ///
    /// # Panics
    /// Panics if the caller is running on a different fiber or none at all.
    pub fn suspend(&self, token: Token, payload: Message) -> Result<Message, TaskError> {
        if !self.is_current() {
            panic!("suspend({token}) through a handle of a fiber that is not running");
        }

        suspend(token, payload)
    }

    /// Whether the caller is running on this fiber.
    pub fn is_current(&self) -> bool {
        context::current().is_some_and(|fiber| {
            fiber.worker() == self.worker && Weak::ptr_eq(fiber.core(), &self.core)
        })
    }

    /// Current state, or `Terminated` if the worker has been released.
    pub fn state(&self) -> FiberState {
        match self.core.upgrade() {
            Some(core) => core.fiber_state(self.worker),
            None => FiberState::Terminated,
        }
    }

    /// The token this fiber is suspended on, if it is suspended.
    pub fn suspended_on(&self) -> Option<Token> {
        self.core
            .upgrade()
            .and_then(|core| core.fiber_suspended_on(self.worker))
    }
}

impl PartialEq for FiberRef {
    fn eq(&self, other: &Self) -> bool {
        self.worker == other.worker && Weak::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for FiberRef {}

impl fmt::Debug for FiberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRef")
            .field("worker", &self.worker)
            .finish()
    }
}
