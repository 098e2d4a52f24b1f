//! Per-fiber registration adapter.
//!
//! A fiber usually waits on one descriptor at a time and often on the same
//! one over and over (a connection reading request after request). The
//! adapter remembers the one client it last registered for its fiber and
//! picks the cheapest multiplexer operation for the next registration:
//!
//! | next client                         | multiplexer operation          |
//! |-------------------------------------|--------------------------------|
//! | none bound yet                      | register (one `EPOLL_CTL_ADD`) |
//! | the bound client itself             | refresh (no syscall)           |
//! | another client on the same handle   | change (one `EPOLL_CTL_MOD`)   |
//! | a client on a different handle      | unregister + register          |

use crate::error::{IoError, TaskError};
use crate::fiber::{FiberRef, Message, Token};
use crate::reactor::{Reactor, SelectClient, same_client};

use log::trace;
use std::cell::RefCell;
use std::io;
use std::ptr;
use std::rc::Rc;

/// Payload a waiter suspends with to stay registered after it is resumed.
pub const STAY_REGISTERED: u64 = 1;

pub struct SelectFiber {
    fiber: FiberRef,
    reactor: Rc<Reactor>,
    current: RefCell<Option<Rc<dyn SelectClient>>>,
}

impl SelectFiber {
    pub fn new(fiber: FiberRef, reactor: Rc<Reactor>) -> Self {
        Self {
            fiber,
            reactor,
            current: RefCell::new(None),
        }
    }

    pub fn fiber(&self) -> &FiberRef {
        &self.fiber
    }

    pub fn reactor(&self) -> &Rc<Reactor> {
        &self.reactor
    }

    /// Registers `client` for this fiber, replacing the client registered
    /// before. Returns `true` if the multiplexer was touched, `false` if the
    /// bound client was only refreshed.
    pub fn register(&self, client: Rc<dyn SelectClient>) -> io::Result<bool> {
        let bound = self.current.borrow().clone();

        let bound = match bound {
            Some(bound) => bound,
            None => {
                self.reactor.register(client.clone())?;
                self.bind(client);
                return Ok(true);
            }
        };

        if same_client(&bound, &client) {
            if self.reactor.is_registered(&bound) {
                self.reactor.refresh(&bound);
                return Ok(false);
            }

            // Dropped by the multiplexer behind our back.
            self.reactor.register(client)?;
            return Ok(true);
        }

        if bound.handle() == client.handle() {
            trace!("select fiber: fd {} changes client", client.handle());
            self.reactor.change(&bound, client.clone())?;
            self.bind(client);
            return Ok(true);
        }

        self.current.borrow_mut().take();
        self.reactor.unregister(&bound)?;
        self.reactor.register(client.clone())?;
        self.bind(client);

        Ok(true)
    }

    /// Unregisters the bound client. Returns `false` if none was bound.
    pub fn unregister(&self) -> io::Result<bool> {
        let bound = self.current.borrow_mut().take();

        match bound {
            Some(client) => {
                self.reactor.unregister(&client)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// With `Some(client)`, whether that client is the bound one; with `None`,
    /// whether no client is bound.
    pub fn is_registered(&self, client: Option<&Rc<dyn SelectClient>>) -> bool {
        match (self.current.borrow().as_ref(), client) {
            (Some(bound), Some(client)) => same_client(bound, client),
            (None, None) => true,
            _ => false,
        }
    }

    /// Forgets the bound client without touching the multiplexer. Used once
    /// the multiplexer has already let go of it.
    pub fn clear(&self) {
        self.current.borrow_mut().take();
    }

    /// [`clear`](Self::clear), but only if `client` is the bound one.
    pub fn clear_if_bound(&self, client: &dyn SelectClient) -> bool {
        let mut current = self.current.borrow_mut();

        let bound = current
            .as_ref()
            .is_some_and(|bound| ptr::addr_eq(Rc::as_ptr(bound), client as *const dyn SelectClient));

        if bound {
            current.take();
        }

        bound
    }

    /// Registers `client` and suspends the calling fiber on `token` until the
    /// client resumes it. The client stays registered afterwards, so waiting
    /// on it again costs no syscall.
    pub fn wait_on(&self, client: Rc<dyn SelectClient>, token: Token) -> Result<Message, TaskError> {
        let fd = client.handle();

        self.register(client).map_err(|source| IoError::Os {
            fd,
            op: "register",
            source,
        })?;

        self.fiber.suspend(token, Message::Num(STAY_REGISTERED))
    }

    /// Resumes the fiber if it is suspended on `token`, and translates the
    /// payload of its next suspension into the `on_ready` answer: `true`
    /// keeps the client registered.
    ///
    /// A fiber that is not waiting on `token` any more is left alone and the
    /// client is dropped from the multiplexer.
    pub fn resume_waiter(&self, token: Token, message: Message) -> bool {
        if self.fiber.suspended_on() != Some(token) {
            return false;
        }

        matches!(self.fiber.resume(token, message), Message::Num(n) if n != 0)
    }

    fn bind(&self, client: Rc<dyn SelectClient>) {
        *self.current.borrow_mut() = Some(client);
    }
}
