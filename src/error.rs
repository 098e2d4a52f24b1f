//! Error types shared by the scheduler, tasks and I/O conduits.
//!
//! Recoverable conditions are values: they travel through `Result` and the
//! `?` operator, including across a suspend/resume boundary. Protocol
//! violations (mismatched tokens, resuming a coroutine that is not
//! suspended) are bugs in the calling code and panic instead.

use std::any::Any;
use std::error::Error as StdError;
use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

/// Failures reported by an I/O operation on a single descriptor.
#[derive(Debug, Error)]
pub enum IoError {
    /// End of stream (or a similar condition) without an OS error code.
    #[error("{op} on fd {fd}: {message}")]
    Warning {
        fd: RawFd,
        op: &'static str,
        message: &'static str,
    },

    /// A system call failed with an errno-class code.
    #[error("{op} failed on fd {fd}: {source}")]
    Os {
        fd: RawFd,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The device itself reported an error when its status was queried.
    #[error("device error on fd {fd}: {source}")]
    Device {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    /// The descriptor did not become ready before its deadline.
    #[error("{op} timed out on fd {fd}")]
    TimedOut { fd: RawFd, op: &'static str },
}

impl IoError {
    /// Returns the raw OS error code, if this error carries one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            IoError::Os { source, .. } | IoError::Device { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Errors observed by a task, either at a suspend point or escaping `run()`.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task was killed; delivered once, at its next resume point.
    #[error("task was killed")]
    Killed,

    #[error(transparent)]
    Io(#[from] IoError),

    /// An error raised outside the task and redelivered inside it. The
    /// original error object is kept intact and can be downcast.
    #[error("{0}")]
    Forwarded(Box<dyn StdError + 'static>),

    /// A task-defined failure.
    #[error("task failed: {0}")]
    Failed(String),

    /// The task body panicked; carries the panic message.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Wraps an arbitrary error so it can be forwarded into a task.
    pub fn forward<E>(error: E) -> Self
    where
        E: StdError + 'static,
    {
        TaskError::Forwarded(Box::new(error))
    }

    /// Turns a caught panic payload into [`TaskError::Panicked`].
    pub(crate) fn panicked(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_owned()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "non-string panic payload".to_owned()
        };

        TaskError::Panicked(message)
    }

    pub fn is_killed(&self) -> bool {
        matches!(self, TaskError::Killed)
    }

    /// Returns the forwarded error downcast to `E`, if this is one.
    pub fn downcast_forwarded<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        match self {
            TaskError::Forwarded(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// Errors raised by scheduler construction and task scheduling.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The pending-task queue reached its configured limit.
    #[error("task queue is full ({limit} tasks pending)")]
    QueueFull { limit: usize },

    /// No scheduler is installed on this thread.
    #[error("scheduler is not initialized")]
    NotInitialized,

    /// A scheduler is already installed on this thread.
    #[error("scheduler is already initialized")]
    AlreadyInitialized,

    /// The scheduler has been shut down and accepts no more work.
    #[error("scheduler has been shut down")]
    ShutDown,

    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("scheduler OS resource failure: {0}")]
    Os(#[from] io::Error),
}
