//! Single-threaded readiness multiplexer with cancelable timers.
//!
//! `run_once` waits for at most one bounded interval and returns what became
//! ready; dispatch is left to the caller, which owns all mutable state.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::service::ServiceId;

/// What a readable descriptor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    Listen(ServiceId),
    Status(ServiceId),
    /// Self-pipe written by signal handlers.
    Signal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Unthrottle(ServiceId),
    Wakeup(ServiceId),
    /// Debug "run for N seconds" mode.
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Readable(Token),
    Timer(TimerKind),
}

#[derive(Debug)]
pub struct EventLoop {
    interest: BTreeMap<RawFd, Token>,
    timers: HashMap<TimerKind, Instant>,
    max_wait: Duration,
}

impl EventLoop {
    pub fn new(max_wait: Duration) -> Self {
        Self {
            interest: BTreeMap::new(),
            timers: HashMap::new(),
            max_wait,
        }
    }

    pub fn set_max_wait(&mut self, max_wait: Duration) {
        self.max_wait = max_wait;
    }

    /// Watch `fd` for read readiness. The caller keeps `fd` open until the
    /// matching [`disable_read`](Self::disable_read).
    pub fn enable_read(&mut self, fd: RawFd, token: Token) {
        if let Some(old) = self.interest.insert(fd, token)
            && old != token
        {
            panic!("fd {fd} registered for {old:?} and {token:?}");
        }
    }

    pub fn disable_read(&mut self, fd: RawFd) {
        self.interest.remove(&fd);
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.interest.contains_key(&fd)
    }

    /// Arm or re-arm a timer; re-arming replaces the previous deadline.
    pub fn arm_timer(&mut self, kind: TimerKind, delay: Duration, now: Instant) {
        self.timers.insert(kind, now + delay);
    }

    pub fn cancel_timer(&mut self, kind: TimerKind) -> bool {
        self.timers.remove(&kind).is_some()
    }

    pub fn timer_deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.timers.get(&kind).copied()
    }

    /// Time until the earliest timer, capped at the hard ceiling.
    pub fn next_wait(&self, now: Instant) -> Duration {
        self.timers
            .values()
            .map(|deadline| deadline.saturating_duration_since(now))
            .fold(self.max_wait, Duration::min)
    }

    /// One bounded wait. Returns ready descriptors first, then expired
    /// timers in deadline order. Expired timers are disarmed.
    pub fn run_once(&mut self) -> io::Result<Vec<Event>> {
        let wait = self.next_wait(Instant::now());
        let mut ms = u16::try_from(wait.as_millis()).unwrap_or(u16::MAX);
        if ms == 0 && !wait.is_zero() {
            ms = 1;
        }

        let mut events = Vec::new();
        let registered: Vec<(RawFd, Token)> = self.interest.iter().map(|(&fd, &t)| (fd, t)).collect();
        let mut fds: Vec<PollFd<'_>> = registered
            .iter()
            // SAFETY: every registered descriptor is owned by a live service
            // descriptor or the signal pipe, and is deregistered before it
            // is closed.
            .map(|&(fd, _)| PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN))
            .collect();

        match poll(&mut fds, PollTimeout::from(ms)) {
            Ok(0) | Err(Errno::EINTR) => {}
            Ok(_) => {
                for (pfd, &(fd, token)) in fds.iter().zip(&registered) {
                    let Some(revents) = pfd.revents() else {
                        continue;
                    };
                    if revents.contains(PollFlags::POLLNVAL) {
                        panic!("fd {fd} for {token:?} polled after close");
                    }
                    if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                        events.push(Event::Readable(token));
                    }
                }
            }
            Err(e) => return Err(io::Error::from(e)),
        }

        let now = Instant::now();
        let mut expired: Vec<(Instant, TimerKind)> = self
            .timers
            .iter()
            .filter(|&(_, deadline)| *deadline <= now)
            .map(|(&kind, &deadline)| (deadline, kind))
            .collect();
        expired.sort_by_key(|&(deadline, _)| deadline);
        for (_, kind) in expired {
            self.timers.remove(&kind);
            events.push(Event::Timer(kind));
        }

        Ok(events)
    }
}
