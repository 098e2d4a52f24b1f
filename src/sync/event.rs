use crate::error::{IoError, TaskError};
use crate::fiber::{Message, Token};
use crate::reactor::{EventMask, SelectClient};
use crate::select_fiber::SelectFiber;

use log::trace;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

/// Token a fiber waiting on a [`FiberEvent`] is suspended on.
pub const EVENT_FIRED: Token = Token::new("event fired");

/// Wake-up signal for one waiting fiber, backed by an `eventfd`.
///
/// Any execution context may [`trigger`](Self::trigger) the event; the fiber
/// owning the event's [`SelectFiber`] [`wait`](Self::wait)s on it. A trigger
/// that happens before the wait is not lost: the wait completes on the next
/// loop pass.
///
/// # Example
///
/// ```ignore
/// let event = Rc::new(FiberEvent::new(cx.select_fiber())?);
///
/// let trigger = event.clone();
/// scheduler.schedule(task::from_fn(move |_| {
///     trigger.trigger()?;
///     Ok(())
/// }))?;
///
/// event.wait()?;
/// ```
pub struct FiberEvent {
    client: Rc<EventClient>,
}

struct EventClient {
    fd: RawFd,
    select_fiber: Rc<SelectFiber>,
}

impl FiberEvent {
    pub fn new(select_fiber: Rc<SelectFiber>) -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            client: Rc::new(EventClient { fd, select_fiber }),
        })
    }

    pub fn handle(&self) -> RawFd {
        self.client.fd
    }

    /// Signals the event. Never blocks.
    pub fn trigger(&self) -> io::Result<()> {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.client.fd,
                &one as *const u64 as *const libc::c_void,
                size_of::<u64>(),
            )
        };

        if n < 0 {
            let error = io::Error::last_os_error();
            // Only an overflowing counter blocks, and it is signalled anyway.
            if error.kind() != io::ErrorKind::WouldBlock {
                return Err(error);
            }
        }

        trace!("event: fd {} triggered", self.client.fd);
        Ok(())
    }

    /// Suspends the calling fiber until the event is triggered.
    ///
    /// # Panics
    /// Panics unless called on the fiber that owns this event's adapter.
    pub fn wait(&self) -> Result<(), TaskError> {
        let client: Rc<dyn SelectClient> = self.client.clone();
        self.client.select_fiber.wait_on(client, EVENT_FIRED)?;

        Ok(())
    }

    /// Triggers the event and waits on it: gives every other ready fiber a
    /// turn before the caller continues.
    pub fn cede(&self) -> Result<(), TaskError> {
        self.trigger().map_err(|source| IoError::Os {
            fd: self.client.fd,
            op: "trigger",
            source,
        })?;

        self.wait()
    }

    pub fn is_registered(&self) -> bool {
        let client: Rc<dyn SelectClient> = self.client.clone();
        self.client.select_fiber.is_registered(Some(&client))
    }
}

impl Drop for FiberEvent {
    fn drop(&mut self) {
        if self.is_registered() {
            if let Err(error) = self.client.select_fiber.unregister() {
                trace!("event: unregister of fd {} failed: {error}", self.client.fd);
            }
        }
    }
}

impl SelectClient for EventClient {
    fn handle(&self) -> RawFd {
        self.fd
    }

    fn interest(&self) -> EventMask {
        EventMask::READ
    }

    fn on_ready(&self, _events: EventMask) -> bool {
        if self.select_fiber.fiber().suspended_on() != Some(EVENT_FIRED) {
            // Keep the count for the next wait.
            return false;
        }

        super::read_counter(self.fd);
        self.select_fiber.resume_waiter(EVENT_FIRED, Message::None)
    }

    fn on_finalize(&self) {
        self.select_fiber.clear_if_bound(self);
    }
}

impl Drop for EventClient {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
