use crate::error::{IoError, TaskError};
use crate::fiber::{Message, Token};
use crate::reactor::{EventMask, SelectClient};
use crate::select_fiber::SelectFiber;

use log::trace;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::rc::Rc;
use std::time::Duration;

/// Token a fiber sleeping on a [`FiberTimer`] is suspended on.
pub const TIMER_EXPIRED: Token = Token::new("timer expired");

/// One-shot sleep for the fiber owning the timer's adapter, backed by a
/// `timerfd`.
pub struct FiberTimer {
    client: Rc<TimerClient>,
}

struct TimerClient {
    fd: RawFd,
    select_fiber: Rc<SelectFiber>,
}

impl FiberTimer {
    pub fn new(select_fiber: Rc<SelectFiber>) -> io::Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            client: Rc::new(TimerClient { fd, select_fiber }),
        })
    }

    pub fn handle(&self) -> RawFd {
        self.client.fd
    }

    /// Suspends the calling fiber for at least `duration`.
    pub fn wait(&self, duration: Duration) -> Result<(), TaskError> {
        self.arm(duration).map_err(|source| IoError::Os {
            fd: self.client.fd,
            op: "timerfd_settime",
            source,
        })?;

        let client: Rc<dyn SelectClient> = self.client.clone();
        self.client.select_fiber.wait_on(client, TIMER_EXPIRED)?;

        Ok(())
    }

    /// Rearming also resets the expiration count left by an earlier wait
    /// that was interrupted.
    fn arm(&self, duration: Duration) -> io::Result<()> {
        // An all-zero value would disarm the timer instead.
        let duration = duration.max(Duration::from_nanos(1));

        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: duration.as_secs() as libc::time_t,
                tv_nsec: duration.subsec_nanos() as libc::c_long,
            },
        };

        let rc = unsafe { libc::timerfd_settime(self.client.fd, 0, &spec, ptr::null_mut()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

impl Drop for FiberTimer {
    fn drop(&mut self) {
        let client: Rc<dyn SelectClient> = self.client.clone();
        if self.client.select_fiber.is_registered(Some(&client)) {
            if let Err(error) = self.client.select_fiber.unregister() {
                trace!("timer: unregister of fd {} failed: {error}", self.client.fd);
            }
        }
    }
}

impl SelectClient for TimerClient {
    fn handle(&self) -> RawFd {
        self.fd
    }

    fn interest(&self) -> EventMask {
        EventMask::READ
    }

    fn on_ready(&self, _events: EventMask) -> bool {
        super::read_counter(self.fd);
        self.select_fiber.resume_waiter(TIMER_EXPIRED, Message::None)
    }

    fn on_finalize(&self) {
        self.select_fiber.clear_if_bound(self);
    }
}

impl Drop for TimerClient {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
