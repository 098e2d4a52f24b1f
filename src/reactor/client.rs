use crate::reactor::event::EventMask;

use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

/// Anything that wants readiness callbacks from the [`Reactor`].
///
/// Clients are shared with the reactor as `Rc<dyn SelectClient>`. The reactor
/// keeps a clone while registered but never owns the client's lifetime
/// beyond that.
///
/// [`Reactor`]: crate::reactor::Reactor
pub trait SelectClient {
    /// The OS descriptor this client waits on.
    fn handle(&self) -> RawFd;

    /// The readiness events this client is interested in.
    fn interest(&self) -> EventMask;

    /// Called with the reported events. Returning `false` makes the reactor
    /// unregister the client and then call [`on_finalize`](Self::on_finalize).
    fn on_ready(&self, events: EventMask) -> bool;

    /// Optional deadline, armed whenever the client is (re)registered.
    /// Expiry is delivered through [`on_ready`](Self::on_ready) with
    /// [`EventMask::TIMEOUT`].
    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn on_registered(&self) {}

    fn on_unregistered(&self) {}

    /// Called after the reactor removed the client because `on_ready`
    /// returned `false`.
    fn on_finalize(&self) {}
}

/// Identity comparison of two clients: the same object, not the same handle.
pub fn same_client(a: &Rc<dyn SelectClient>, b: &Rc<dyn SelectClient>) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
}
