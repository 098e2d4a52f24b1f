//! Readiness multiplexer.
//!
//! This module wraps the kernel readiness facility (`epoll`) and dispatches
//! readiness to registered clients:
//! - [`core`]: the [`Reactor`] registration table and wait/dispatch loop
//! - [`client`]: the [`SelectClient`] contract implemented by waiters
//! - [`event`]: [`EventMask`] and the raw epoll wrapper
//! - [`timeout`]: per-client deadlines surfaced as synthetic events

pub mod client;
pub mod core;
pub mod event;
pub(crate) mod timeout;

pub use client::{SelectClient, same_client};
pub use self::core::{Reactor, ReactorStats};
pub use event::{EventMask, set_nonblocking};
