use bitflags::bitflags;
use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLLOUT, EPOLLPRI, EPOLLRDHUP, F_GETFL, F_SETFL, O_NONBLOCK, close, epoll_create1,
    epoll_ctl, epoll_event, epoll_wait, fcntl,
};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

bitflags! {
    /// Readiness interest and readiness report for a descriptor.
    ///
    /// The kernel bits map one to one onto `EPOLL*`. [`EventMask::TIMEOUT`]
    /// never reaches the kernel: the multiplexer synthesises it when a
    /// client's deadline expires.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u32 {
        const READ = EPOLLIN as u32;
        const WRITE = EPOLLOUT as u32;
        const PRIORITY = EPOLLPRI as u32;
        const READ_HANGUP = EPOLLRDHUP as u32;
        const ERROR = EPOLLERR as u32;
        const HANGUP = EPOLLHUP as u32;
        const TIMEOUT = 1 << 24;
    }
}

impl EventMask {
    /// The bits that may be handed to `epoll_ctl`.
    pub(crate) fn kernel_bits(self) -> u32 {
        (self - EventMask::TIMEOUT).bits()
    }
}

/// Owned epoll instance.
pub(crate) struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { fd })
    }

    pub(crate) fn add(&self, fd: RawFd, interest: EventMask) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, interest)
    }

    pub(crate) fn modify(&self, fd: RawFd, interest: EventMask) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, interest)
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(EPOLL_CTL_DEL, fd, EventMask::empty())
    }

    fn ctl(&self, op: i32, fd: RawFd, interest: EventMask) -> io::Result<()> {
        let mut event = epoll_event {
            events: interest.kernel_bits(),
            u64: fd as u64,
        };

        let ret = unsafe { epoll_ctl(self.fd, op, fd, &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Blocks until at least one descriptor is ready or the timeout elapses.
    ///
    /// `None` waits forever. An interrupted wait reports zero events.
    pub(crate) fn wait(
        &self,
        events: &mut [epoll_event],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let timeout_ms = match timeout {
            None => -1,
            Some(duration) => {
                // Round up so a sub-millisecond deadline does not spin.
                let ms = duration.as_nanos().div_ceil(1_000_000);
                ms.min(i32::MAX as u128) as i32
            }
        };

        let n = unsafe {
            epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            let error = io::Error::last_os_error();
            if error.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(error);
        }

        Ok(n as usize)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            close(self.fd);
        }
    }
}

pub(crate) const EMPTY_EVENT: epoll_event = epoll_event { events: 0, u64: 0 };

/// Decodes the descriptor and readiness bits of a reported event.
pub(crate) fn decode(event: &epoll_event) -> (RawFd, EventMask) {
    let data = event.u64;
    let bits = event.events;

    (data as RawFd, EventMask::from_bits_truncate(bits))
}

/// Switches a descriptor to non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { fcntl(fd, F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    let ret = unsafe { fcntl(fd, F_SETFL, flags | O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

