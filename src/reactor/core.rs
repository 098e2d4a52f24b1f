use crate::reactor::client::{SelectClient, same_client};
use crate::reactor::event::{EMPTY_EVENT, Epoll, EventMask, decode};
use crate::reactor::timeout::TimeoutManager;

use libc::{EBADF, ENOENT, epoll_event};
use log::{debug, trace};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

/// Counters describing what the reactor asked of the kernel.
///
/// Every `epoll_ctl` issued is counted exactly once, so callers can observe
/// how many system calls a sequence of registrations cost.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReactorStats {
    /// Clients currently registered.
    pub registered: usize,
    /// `EPOLL_CTL_ADD` calls.
    pub register_calls: u64,
    /// `EPOLL_CTL_DEL` calls.
    pub unregister_calls: u64,
    /// `EPOLL_CTL_MOD` calls.
    pub modify_calls: u64,
    /// Hook and timeout refreshes that needed no system call.
    pub refresh_calls: u64,
    /// Readiness events delivered to clients.
    pub dispatched: u64,
    /// Synthetic timeout events delivered to clients.
    pub timeouts_fired: u64,
}

/// The readiness multiplexer: an epoll instance plus the descriptor to client
/// table and the per-client deadlines.
///
/// All methods take `&self`; no internal borrow is held while a client
/// callback runs, so callbacks may register and unregister clients freely.
pub struct Reactor {
    epoll: Epoll,
    events: RefCell<Vec<epoll_event>>,
    registry: RefCell<HashMap<RawFd, Rc<dyn SelectClient>>>,
    timeouts: RefCell<TimeoutManager>,
    stopped: Cell<bool>,
    stats: Cell<ReactorStats>,
}

impl Reactor {
    /// Creates a reactor reporting at most `max_events` events per wait.
    pub fn new(max_events: usize) -> io::Result<Self> {
        let epoll = Epoll::new()?;

        Ok(Self {
            epoll,
            events: RefCell::new(vec![EMPTY_EVENT; max_events.max(1)]),
            registry: RefCell::new(HashMap::new()),
            timeouts: RefCell::new(TimeoutManager::new()),
            stopped: Cell::new(false),
            stats: Cell::new(ReactorStats::default()),
        })
    }

    /// Registers `client` for its interest mask.
    ///
    /// A descriptor is registered at most once: registering a client whose
    /// handle is already in the table replaces the previous entry with a
    /// single `EPOLL_CTL_MOD`.
    pub fn register(&self, client: Rc<dyn SelectClient>) -> io::Result<()> {
        let fd = client.handle();
        let interest = client.interest();
        let previous = self.registry.borrow().get(&fd).cloned();

        match previous {
            Some(previous) => {
                self.epoll.modify(fd, interest)?;
                self.update_stats(|stats| stats.modify_calls += 1);
                trace!("reactor: mod fd {fd} interest {interest:?}");

                self.registry.borrow_mut().insert(fd, client.clone());
                self.timeouts.borrow_mut().disarm(fd);
                previous.on_unregistered();
            }
            None => {
                self.epoll.add(fd, interest)?;
                self.update_stats(|stats| stats.register_calls += 1);
                trace!("reactor: add fd {fd} interest {interest:?}");

                self.registry.borrow_mut().insert(fd, client.clone());
            }
        }

        self.arm_timeout(&client);
        client.on_registered();

        Ok(())
    }

    /// Unregisters `client` if it is the object currently registered for its
    /// handle. Returns whether anything was removed.
    pub fn unregister(&self, client: &Rc<dyn SelectClient>) -> io::Result<bool> {
        let fd = client.handle();

        let registered = match self.registry.borrow().get(&fd) {
            Some(current) => same_client(current, client),
            None => false,
        };

        if !registered {
            return Ok(false);
        }

        self.registry.borrow_mut().remove(&fd);
        self.timeouts.borrow_mut().disarm(fd);
        self.update_stats(|stats| stats.unregister_calls += 1);
        trace!("reactor: del fd {fd}");

        let result = match self.epoll.delete(fd) {
            Ok(()) => Ok(true),
            // The descriptor was closed before being unregistered; the
            // kernel has already dropped it from the interest list.
            Err(error) if matches!(error.raw_os_error(), Some(EBADF) | Some(ENOENT)) => {
                debug!("reactor: fd {fd} was already gone on unregister: {error}");
                Ok(true)
            }
            Err(error) => Err(error),
        };

        client.on_unregistered();

        result
    }

    /// Swaps the client registered for a handle from `old` to `new` with a
    /// single `EPOLL_CTL_MOD`.
    ///
    /// Both clients must share a handle. If `old` is not the registered
    /// client, `new` is simply registered.
    pub fn change(&self, old: &Rc<dyn SelectClient>, new: Rc<dyn SelectClient>) -> io::Result<()> {
        let fd = new.handle();

        if old.handle() != fd {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "change() requires both clients to share a handle",
            ));
        }

        if !self.is_registered(old) {
            return self.register(new);
        }

        let interest = new.interest();
        self.epoll.modify(fd, interest)?;
        self.update_stats(|stats| stats.modify_calls += 1);
        trace!("reactor: change fd {fd} interest {interest:?}");

        self.registry.borrow_mut().insert(fd, new.clone());
        self.timeouts.borrow_mut().disarm(fd);
        old.on_unregistered();

        self.arm_timeout(&new);
        new.on_registered();

        Ok(())
    }

    /// Re-runs the registration hooks and re-arms the deadline of an already
    /// registered client without touching the kernel.
    pub fn refresh(&self, client: &Rc<dyn SelectClient>) {
        let fd = client.handle();
        self.update_stats(|stats| stats.refresh_calls += 1);

        self.timeouts.borrow_mut().disarm(fd);
        client.on_unregistered();

        if self.is_registered(client) {
            self.arm_timeout(client);
        }
        client.on_registered();
    }

    /// Whether this exact client object is registered.
    pub fn is_registered(&self, client: &Rc<dyn SelectClient>) -> bool {
        match self.registry.borrow().get(&client.handle()) {
            Some(current) => same_client(current, client),
            None => false,
        }
    }

    pub fn registered_count(&self) -> usize {
        self.registry.borrow().len()
    }

    /// Whether waiting could ever produce an event.
    pub fn has_work(&self) -> bool {
        !self.registry.borrow().is_empty() || !self.timeouts.borrow().is_empty()
    }

    /// Waits up to `timeout` (forever if `None`) and dispatches every reported
    /// event, then every expired deadline. Returns how many callbacks ran.
    pub fn select(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let next_deadline = self.timeouts.borrow().next_remaining();
        let wait = match (timeout, next_deadline) {
            (Some(requested), Some(deadline)) => Some(requested.min(deadline)),
            (Some(requested), None) => Some(requested),
            (None, deadline) => deadline,
        };

        let ready: Vec<(RawFd, EventMask)> = {
            let mut events = self
                .events
                .try_borrow_mut()
                .unwrap_or_else(|_| panic!("Reactor::select re-entered from a client callback"));

            let n = self.epoll.wait(&mut events, wait)?;
            events.iter().take(n).map(decode).collect()
        };

        let mut dispatched = 0;

        for (fd, events) in ready {
            if self.dispatch(fd, events) {
                dispatched += 1;
            }
        }

        dispatched += self.expire_timeouts();

        Ok(dispatched)
    }

    /// Runs [`select`](Self::select) until [`shutdown`](Self::shutdown) is
    /// requested or nothing is left to wait for.
    pub fn event_loop(&self) -> io::Result<()> {
        loop {
            if self.stopped.replace(false) {
                debug!("reactor: event loop stopped");
                return Ok(());
            }

            if !self.has_work() {
                return Ok(());
            }

            self.select(None)?;
        }
    }

    /// Makes the running (or next) [`event_loop`](Self::event_loop) return
    /// after its current dispatch round.
    pub fn shutdown(&self) {
        self.stopped.set(true);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopped.get()
    }

    pub(crate) fn clear_stop(&self) -> bool {
        self.stopped.replace(false)
    }

    pub fn stats(&self) -> ReactorStats {
        let mut stats = self.stats.get();
        stats.registered = self.registry.borrow().len();
        stats
    }

    /// Unregisters every client, running their unregistration hooks.
    pub(crate) fn clear(&self) {
        let clients: Vec<Rc<dyn SelectClient>> =
            self.registry.borrow().values().cloned().collect();

        for client in clients {
            if let Err(error) = self.unregister(&client) {
                debug!("reactor: unregister during teardown failed: {error}");
            }
        }
    }

    fn dispatch(&self, fd: RawFd, events: EventMask) -> bool {
        let client = match self.registry.borrow().get(&fd) {
            Some(client) => client.clone(),
            None => return false,
        };

        self.update_stats(|stats| stats.dispatched += 1);
        trace!("reactor: fd {fd} ready {events:?}");

        if !client.on_ready(events) {
            self.finalize(&client);
        }

        true
    }

    fn expire_timeouts(&self) -> usize {
        let expired = self.timeouts.borrow_mut().take_expired();
        let mut fired = 0;

        for fd in expired {
            let client = match self.registry.borrow().get(&fd) {
                Some(client) => client.clone(),
                None => continue,
            };

            self.update_stats(|stats| stats.timeouts_fired += 1);
            trace!("reactor: fd {fd} timed out");
            fired += 1;

            if !client.on_ready(EventMask::TIMEOUT) {
                self.finalize(&client);
            }
        }

        fired
    }

    fn finalize(&self, client: &Rc<dyn SelectClient>) {
        match self.unregister(client) {
            Ok(true) => client.on_finalize(),
            // Unregistered (or replaced) from inside its own callback.
            Ok(false) => {}
            Err(error) => {
                debug!("reactor: unregister of finished client failed: {error}");
                client.on_finalize();
            }
        }
    }

    fn arm_timeout(&self, client: &Rc<dyn SelectClient>) {
        if let Some(timeout) = client.timeout() {
            self.timeouts.borrow_mut().arm(client.handle(), timeout);
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut ReactorStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::Cell;

    struct PipeClient {
        fd: RawFd,
        keep: bool,
        timeout: Option<Duration>,
        ready: Cell<u32>,
        last: Cell<EventMask>,
        registered: Cell<u32>,
        unregistered: Cell<u32>,
        finalized: Cell<u32>,
    }

    impl PipeClient {
        fn new(fd: RawFd, keep: bool) -> Rc<Self> {
            Rc::new(Self {
                fd,
                keep,
                timeout: None,
                ready: Cell::new(0),
                last: Cell::new(EventMask::empty()),
                registered: Cell::new(0),
                unregistered: Cell::new(0),
                finalized: Cell::new(0),
            })
        }
    }

    impl SelectClient for PipeClient {
        fn handle(&self) -> RawFd {
            self.fd
        }

        fn interest(&self) -> EventMask {
            EventMask::READ
        }

        fn on_ready(&self, events: EventMask) -> bool {
            self.ready.set(self.ready.get() + 1);
            self.last.set(events);
            self.keep
        }

        fn timeout(&self) -> Option<Duration> {
            self.timeout
        }

        fn on_registered(&self) {
            self.registered.set(self.registered.get() + 1);
        }

        fn on_unregistered(&self) {
            self.unregistered.set(self.unregistered.get() + 1);
        }

        fn on_finalize(&self) {
            self.finalized.set(self.finalized.get() + 1);
        }
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(res, 0, "pipe() failed");
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn reregistering_a_handle_replaces_the_entry() {
        let reactor = Reactor::new(8).unwrap();
        let (rfd, wfd) = pipe();

        let first = PipeClient::new(rfd, true);
        let second = PipeClient::new(rfd, true);
        reactor.register(first.clone()).unwrap();
        reactor.register(second.clone()).unwrap();

        let stats = reactor.stats();
        assert_eq!(stats.registered, 1);
        assert_eq!(stats.register_calls, 1);
        assert_eq!(stats.modify_calls, 1);
        assert_eq!(first.unregistered.get(), 1);

        let second_dyn: Rc<dyn SelectClient> = second.clone();
        assert!(reactor.is_registered(&second_dyn));

        reactor.unregister(&second_dyn).unwrap();
        close(rfd);
        close(wfd);
    }

    #[test]
    fn returning_false_unregisters_and_finalizes() {
        let reactor = Reactor::new(8).unwrap();
        let (rfd, wfd) = pipe();
        let client = PipeClient::new(rfd, false);
        reactor.register(client.clone()).unwrap();

        let wrote = unsafe { libc::write(wfd, [1u8].as_ptr() as *const _, 1) };
        assert_eq!(wrote, 1);

        let dispatched = reactor.select(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(dispatched, 1);
        assert_eq!(client.ready.get(), 1);
        assert!(client.last.get().contains(EventMask::READ));
        assert_eq!(client.finalized.get(), 1);
        assert_eq!(reactor.registered_count(), 0);

        close(rfd);
        close(wfd);
    }

    #[test]
    fn expired_deadline_is_delivered_through_on_ready() {
        let reactor = Reactor::new(8).unwrap();
        let (rfd, wfd) = pipe();
        let client = Rc::new(PipeClient {
            timeout: Some(Duration::from_millis(5)),
            ..Rc::into_inner(PipeClient::new(rfd, false)).unwrap()
        });
        reactor.register(client.clone()).unwrap();

        reactor.event_loop().unwrap();

        assert_eq!(client.last.get(), EventMask::TIMEOUT);
        assert_eq!(client.finalized.get(), 1);
        assert_eq!(reactor.stats().timeouts_fired, 1);

        close(rfd);
        close(wfd);
    }

    #[test]
    fn refresh_reruns_hooks_and_rearms_the_deadline() {
        let reactor = Reactor::new(8).unwrap();
        let (rfd, wfd) = pipe();
        let client = Rc::new(PipeClient {
            timeout: Some(Duration::from_millis(200)),
            ..Rc::into_inner(PipeClient::new(rfd, true)).unwrap()
        });
        let client_dyn: Rc<dyn SelectClient> = client.clone();
        reactor.register(client_dyn.clone()).unwrap();

        std::thread::sleep(Duration::from_millis(150));
        reactor.refresh(&client_dyn);
        assert_eq!(client.registered.get(), 2);
        assert_eq!(client.unregistered.get(), 1);

        // Past the first deadline, well before the refreshed one.
        std::thread::sleep(Duration::from_millis(100));
        reactor.select(Some(Duration::ZERO)).unwrap();
        assert_eq!(client.ready.get(), 0);

        let stats = reactor.stats();
        assert_eq!(stats.register_calls, 1);
        assert_eq!(stats.refresh_calls, 1);
        assert_eq!(stats.modify_calls, 0);
        assert_eq!(stats.timeouts_fired, 0);

        reactor.clear();
        close(rfd);
        close(wfd);
    }

    #[test]
    fn change_swaps_clients_with_one_modify() {
        let reactor = Reactor::new(8).unwrap();
        let (rfd, wfd) = pipe();
        let old: Rc<dyn SelectClient> = PipeClient::new(rfd, true);
        let new = PipeClient::new(rfd, true);

        reactor.register(old.clone()).unwrap();
        reactor.change(&old, new.clone()).unwrap();

        let stats = reactor.stats();
        assert_eq!(stats.register_calls, 1);
        assert_eq!(stats.unregister_calls, 0);
        assert_eq!(stats.modify_calls, 1);
        assert_eq!(new.registered.get(), 1);
        assert!(!reactor.is_registered(&old));

        reactor.clear();
        close(rfd);
        close(wfd);
    }
}
