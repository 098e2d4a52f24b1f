//! Deadline bookkeeping for registered clients.
//!
//! Each registered descriptor may carry one deadline. The reactor consults
//! [`TimeoutManager::next_remaining`] before every wait so it never blocks
//! past the earliest deadline, and drains [`TimeoutManager::take_expired`]
//! afterwards to deliver synthetic timeout events.

use std::collections::{BTreeSet, HashMap};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

#[derive(Default)]
pub(crate) struct TimeoutManager {
    /// Ordered by deadline, ties broken by arming order.
    deadlines: BTreeSet<(Instant, u64, RawFd)>,
    by_fd: HashMap<RawFd, (Instant, u64)>,
    next_seq: u64,
}

impl TimeoutManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Arms (or re-arms) the deadline for `fd`, `timeout` from now. A timeout
    /// too large to be represented leaves the descriptor without a deadline.
    pub(crate) fn arm(&mut self, fd: RawFd, timeout: Duration) {
        self.disarm(fd);

        let deadline = match Instant::now().checked_add(timeout) {
            Some(deadline) => deadline,
            None => return,
        };
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        self.deadlines.insert((deadline, seq, fd));
        self.by_fd.insert(fd, (deadline, seq));
    }

    pub(crate) fn disarm(&mut self, fd: RawFd) -> bool {
        match self.by_fd.remove(&fd) {
            Some((deadline, seq)) => self.deadlines.remove(&(deadline, seq, fd)),
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self, fd: RawFd) -> bool {
        self.by_fd.contains_key(&fd)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.by_fd.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_fd.is_empty()
    }

    /// Time left until the earliest deadline, zero if one already passed.
    pub(crate) fn next_remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        self.deadlines
            .first()
            .map(|(deadline, _, _)| deadline.saturating_duration_since(now))
    }

    /// Removes and returns every descriptor whose deadline has passed, in
    /// deadline order.
    pub(crate) fn take_expired(&mut self) -> Vec<RawFd> {
        let now = Instant::now();
        let mut expired = Vec::new();

        while let Some(&(deadline, seq, fd)) = self.deadlines.first() {
            if deadline > now {
                break;
            }
            self.deadlines.remove(&(deadline, seq, fd));
            self.by_fd.remove(&fd);
            expired.push(fd);
        }

        expired
    }
}
