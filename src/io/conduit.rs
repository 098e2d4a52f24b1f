use crate::error::{IoError, TaskError};
use crate::fiber::{Message, Token};
use crate::reactor::{EventMask, SelectClient, set_nonblocking};
use crate::select_fiber::SelectFiber;

use log::trace;
use std::cell::Cell;
use std::io;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

/// Token a fiber blocked in a [`Conduit`] operation is suspended on.
pub const IO_READY: Token = Token::new("io ready");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

impl Direction {
    fn op(self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    }
}

/// Byte stream over a non-blocking descriptor, blocking only the calling
/// fiber.
///
/// Reads and writes wait through two clients sharing the descriptor, so a
/// fiber alternating between them costs one `EPOLL_CTL_MOD` per switch and
/// repeated reads cost nothing. The conduit owns the descriptor and closes
/// it on drop.
///
/// A descriptor can only be waited on by one fiber at a time.
pub struct Conduit {
    fd: RawFd,
    reader: Rc<IoClient>,
    writer: Rc<IoClient>,
    select_fiber: Rc<SelectFiber>,
}

struct IoClient {
    fd: RawFd,
    direction: Direction,
    timeout: Cell<Option<Duration>>,
    select_fiber: Rc<SelectFiber>,
}

impl Conduit {
    /// Takes ownership of `io` and switches it to non-blocking mode.
    pub fn new<F: IntoRawFd>(io: F, select_fiber: Rc<SelectFiber>) -> io::Result<Self> {
        let fd = io.into_raw_fd();

        if let Err(error) = set_nonblocking(fd) {
            unsafe {
                libc::close(fd);
            }
            return Err(error);
        }

        let client = |direction| {
            Rc::new(IoClient {
                fd,
                direction,
                timeout: Cell::new(None),
                select_fiber: select_fiber.clone(),
            })
        };

        Ok(Self {
            fd,
            reader: client(Direction::Read),
            writer: client(Direction::Write),
            select_fiber,
        })
    }

    pub fn handle(&self) -> RawFd {
        self.fd
    }

    /// Deadline for each individual wait; `None` waits forever.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.reader.timeout.set(timeout);
        self.writer.timeout.set(timeout);
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.reader.timeout.get()
    }

    /// Reads at least one byte. End of stream is an [`IoError::Warning`].
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, TaskError> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };

            if n > 0 {
                return Ok(n as usize);
            }

            if n == 0 {
                return Err(IoError::Warning {
                    fd: self.fd,
                    op: "read",
                    message: "end of stream",
                }
                .into());
            }

            self.retry_or_fail(&self.reader)?;
        }
    }

    pub fn read_exact(&self, mut buf: &mut [u8]) -> Result<(), TaskError> {
        while !buf.is_empty() {
            let n = self.read(buf)?;
            buf = &mut buf[n..];
        }

        Ok(())
    }

    /// Writes at least one byte.
    pub fn write(&self, buf: &[u8]) -> Result<usize, TaskError> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };

            if n >= 0 {
                return Ok(n as usize);
            }

            self.retry_or_fail(&self.writer)?;
        }
    }

    pub fn write_all(&self, mut buf: &[u8]) -> Result<(), TaskError> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            buf = &buf[n..];
        }

        Ok(())
    }

    /// Inspects `errno` after a failed syscall: waits for readiness if the
    /// descriptor would block, fails otherwise.
    fn retry_or_fail(&self, client: &Rc<IoClient>) -> Result<(), TaskError> {
        let error = io::Error::last_os_error();

        match error.kind() {
            io::ErrorKind::WouldBlock => self.wait(client),
            io::ErrorKind::Interrupted => Ok(()),
            _ => Err(IoError::Os {
                fd: self.fd,
                op: client.direction.op(),
                source: error,
            }
            .into()),
        }
    }

    fn wait(&self, client: &Rc<IoClient>) -> Result<(), TaskError> {
        trace!("conduit: fd {} waits to {}", self.fd, client.direction.op());

        let handle: Rc<dyn SelectClient> = client.clone();
        let message = self.select_fiber.wait_on(handle, IO_READY)?;
        let events = EventMask::from_bits_retain(message.num().unwrap_or(0) as u32);

        if events.contains(EventMask::TIMEOUT) {
            return Err(IoError::TimedOut {
                fd: self.fd,
                op: client.direction.op(),
            }
            .into());
        }

        if events.contains(EventMask::ERROR) {
            if let Some(error) = self.device_error() {
                return Err(error.into());
            }
        }

        Ok(())
    }

    /// The pending error of a socket. Other descriptors report theirs through
    /// the next syscall instead.
    fn device_error(&self) -> Option<IoError> {
        let mut code: libc::c_int = 0;
        let mut len = size_of::<libc::c_int>() as libc::socklen_t;

        let rc = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut code as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };

        if rc < 0 || code == 0 {
            return None;
        }

        Some(IoError::Device {
            fd: self.fd,
            source: io::Error::from_raw_os_error(code),
        })
    }

    fn is_bound(&self) -> bool {
        let reader: Rc<dyn SelectClient> = self.reader.clone();
        let writer: Rc<dyn SelectClient> = self.writer.clone();

        self.select_fiber.is_registered(Some(&reader)) || self.select_fiber.is_registered(Some(&writer))
    }
}

impl Drop for Conduit {
    fn drop(&mut self) {
        if self.is_bound() {
            if let Err(error) = self.select_fiber.unregister() {
                trace!("conduit: unregister of fd {} failed: {error}", self.fd);
            }
        }

        unsafe {
            libc::close(self.fd);
        }
    }
}

impl SelectClient for IoClient {
    fn handle(&self) -> RawFd {
        self.fd
    }

    fn interest(&self) -> EventMask {
        match self.direction {
            Direction::Read => EventMask::READ | EventMask::READ_HANGUP,
            Direction::Write => EventMask::WRITE,
        }
    }

    fn on_ready(&self, events: EventMask) -> bool {
        self.select_fiber
            .resume_waiter(IO_READY, Message::Num(u64::from(events.bits())))
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout.get()
    }

    fn on_finalize(&self) {
        self.select_fiber.clear_if_bound(self);
    }
}
