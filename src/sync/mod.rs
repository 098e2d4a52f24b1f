//! Fiber-blocking synchronization built on readiness clients.
//!
//! - [`FiberEvent`]: a one-shot wake-up signal between fibers (`eventfd`)
//! - [`FiberTimer`]: suspends the calling fiber for a duration (`timerfd`)

pub mod event;
pub mod timer;

pub use event::FiberEvent;
pub use timer::FiberTimer;

use std::os::unix::io::RawFd;

/// Drains the 8-byte counter of an `eventfd` or `timerfd`. Returns `None` if
/// it was not readable.
pub(crate) fn read_counter(fd: RawFd) -> Option<u64> {
    let mut value: u64 = 0;
    let n = unsafe {
        libc::read(
            fd,
            &mut value as *mut u64 as *mut libc::c_void,
            size_of::<u64>(),
        )
    };

    (n == size_of::<u64>() as isize).then_some(value)
}
