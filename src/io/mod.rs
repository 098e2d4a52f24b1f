//! Fiber-blocking byte streams.

pub mod conduit;

pub use conduit::{Conduit, IO_READY};
