//! Cooperative fiber scheduler over an `epoll` readiness multiplexer.
//!
//! Tasks run on a bounded pool of stackful worker fibers and suspend only at
//! explicit points: waiting for a descriptor, an event, a timer, or a yield.
//! Every suspension names a [`Token`], and a fiber may only be resumed with
//! the token it is suspended on.
//!
//! # Architecture
//!
//! - **Reactor**: the readiness multiplexer and its [`SelectClient`] contract
//! - **Fibers**: stackful coroutines, the token handshake, the worker pool
//! - **SelectFiber**: per-fiber adapter that keeps registrations cheap
//! - **Tasks**: user work units with kill, exception forwarding and extensions
//! - **Scheduler**: pending queue, worker assignment and the event loop
//! - **Sync / IO**: [`FiberEvent`], [`FiberTimer`] and the byte [`Conduit`]
//! - **SchedulerBuilder**: fluent builder for scheduler instantiation

mod builder;
pub mod error;
pub mod fiber;
pub mod io;
pub mod reactor;
pub mod runtime;
pub mod select_fiber;
pub mod sync;
pub mod task;

pub use builder::SchedulerBuilder;
pub use error::{IoError, SchedulerError, TaskError};
pub use fiber::{FiberRef, FiberState, Message, Token, WorkerId};
pub use io::Conduit;
pub use reactor::{EventMask, Reactor, ReactorStats, SelectClient};
pub use runtime::{Scheduler, SchedulerConfig, SchedulerStats};
pub use select_fiber::SelectFiber;
pub use sync::{FiberEvent, FiberTimer};
pub use task::{Task, TaskContext, TaskHandle, TaskId, TaskState};
