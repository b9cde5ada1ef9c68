//! Readiness-driven event loop.
//!
//! File events are registered per token (the raw fd) with a read/write mask;
//! masks merge into an existing registration, so adding a write interest to
//! a readable fd becomes a re-registration rather than a second one. Timer
//! events live in a min-heap keyed by deadline; the loop's poll timeout is
//! the delay to the earliest timer. A timer callback returning a positive
//! number of milliseconds is rescheduled that far into the future, anything
//! else removes it.
//!
//! Callbacks run on the reactor thread and must not block.

use std::time::{Duration, Instant};

use bitflags::bitflags;
use mio::{event::Source, Events, Interest, Poll, Token};

use crate::{minheap::MinHeap, server::Server};

pub type Result<T, E = EventError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("fd {token} out of range for event loop of size {size}")]
    OutOfRange { token: usize, size: usize },
    #[error("I/O related error")]
    Io(#[from] std::io::Error),
}

bitflags! {
    /// Readiness interests for one fd.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u8 {
        const READ = 1;
        const WRITE = 2;
    }
}

impl EventMask {
    fn interest(self) -> Option<Interest> {
        let mut interest = None;
        if self.contains(Self::READ) {
            interest = Some(Interest::READABLE);
        }
        if self.contains(Self::WRITE) {
            interest = Some(match interest {
                Some(i) => i | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        interest
    }
}

/// A file event delivered by one poll.
#[derive(Debug, Clone, Copy)]
pub struct Fired {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
}

/// Return value contract: > 0 reschedules after that many milliseconds.
pub type TimerCallback = fn(&mut Server) -> i64;

pub struct Timer {
    deadline: Instant,
    callback: TimerCallback,
}

fn timer_cmp(a: &Timer, b: &Timer) -> std::cmp::Ordering {
    a.deadline.cmp(&b.deadline)
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    fired: Vec<Fired>,
    /// Registered interests, indexed by token.
    masks: Vec<EventMask>,
    /// Highest registered token, for cheap compaction.
    maxfd: Option<usize>,
    timers: MinHeap<Timer>,
    stop: bool,
}

impl EventLoop {
    /// Create a loop able to track `size` concurrently registered fds.
    pub fn new(size: usize) -> Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(size.clamp(64, 4096)),
            fired: Vec::new(),
            masks: vec![EventMask::empty(); size],
            maxfd: None,
            timers: MinHeap::new(timer_cmp),
            stop: false,
        })
    }

    pub fn size(&self) -> usize {
        self.masks.len()
    }

    pub fn max_fd(&self) -> Option<usize> {
        self.maxfd
    }

    pub fn stop(&mut self) {
        self.stop = true;
    }

    pub fn stopped(&self) -> bool {
        self.stop
    }

    /// Merge `mask` into the fd's registration, registering it on first use.
    pub fn add_event(
        &mut self,
        source: &mut impl Source,
        token: usize,
        mask: EventMask,
    ) -> Result<()> {
        if token >= self.masks.len() {
            return Err(EventError::OutOfRange {
                token,
                size: self.masks.len(),
            });
        }
        let current = self.masks[token];
        let merged = current | mask;
        let Some(interest) = merged.interest() else {
            return Ok(());
        };
        if current.is_empty() {
            self.poll.registry().register(source, Token(token), interest)?;
        } else if merged != current {
            self.poll
                .registry()
                .reregister(source, Token(token), interest)?;
        }
        self.masks[token] = merged;
        if self.maxfd.map_or(true, |max| token > max) {
            self.maxfd = Some(token);
        }
        Ok(())
    }

    /// Drop `mask` from the fd's registration, deregistering it when no
    /// interest remains.
    pub fn del_event(&mut self, source: &mut impl Source, token: usize, mask: EventMask) {
        if token >= self.masks.len() {
            return;
        }
        let current = self.masks[token];
        if current.is_empty() {
            return;
        }
        let remaining = current - mask;
        let result = match remaining.interest() {
            Some(interest) => self
                .poll
                .registry()
                .reregister(source, Token(token), interest),
            None => self.poll.registry().deregister(source),
        };
        if let Err(err) = result {
            tracing::warn!(token, "failed to update event registration: {err}");
        }
        self.masks[token] = remaining;
        if remaining.is_empty() && self.maxfd == Some(token) {
            self.maxfd = self.masks[..token]
                .iter()
                .rposition(|m| !m.is_empty());
        }
    }

    pub fn interest(&self, token: usize) -> EventMask {
        self.masks.get(token).copied().unwrap_or(EventMask::empty())
    }

    /// Re-register an fd with its current interest to get a fresh readiness
    /// edge. Needed when a handler stopped consuming readiness early (for
    /// fairness caps): the kernel only reports edges, so without this the
    /// leftover work would wait for peer activity that may never come.
    pub fn rearm(&mut self, source: &mut impl Source, token: usize) {
        let Some(mask) = self.masks.get(token).copied() else {
            return;
        };
        let Some(interest) = mask.interest() else {
            return;
        };
        if let Err(err) = self
            .poll
            .registry()
            .reregister(source, Token(token), interest)
        {
            tracing::warn!(token, "failed to rearm event registration: {err}");
        }
    }

    /// Schedule a timer `after_ms` milliseconds from now.
    pub fn add_timer(&mut self, after_ms: u64, callback: TimerCallback) {
        self.timers.push(Timer {
            deadline: Instant::now() + Duration::from_millis(after_ms),
            callback,
        });
    }

    /// Delay until the earliest timer: zero if already due, `None` (wait
    /// forever) if no timers exist.
    pub fn next_timeout(&self) -> Option<Duration> {
        self.timers
            .peek()
            .map(|t| t.deadline.saturating_duration_since(Instant::now()))
    }

    /// Poll for readiness and collect the fired events. Events whose
    /// registration disappeared while earlier callbacks ran are filtered at
    /// dispatch time by the caller re-checking [`EventLoop::interest`].
    pub fn poll(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }
        self.fired.clear();
        for event in &self.events {
            self.fired.push(Fired {
                token: event.token().0,
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable(),
            });
        }
        Ok(())
    }

    pub fn take_fired(&mut self) -> Vec<Fired> {
        std::mem::take(&mut self.fired)
    }

    /// Pop the next due timer, if any.
    pub fn pop_due_timer(&mut self) -> Option<Timer> {
        if self.timers.peek()?.deadline <= Instant::now() {
            self.timers.pop()
        } else {
            None
        }
    }

    /// Run a popped timer against the server context, rescheduling it when
    /// the callback asks for it.
    pub fn run_timer(server: &mut Server, timer: Timer) {
        let after = (timer.callback)(server);
        if after > 0 {
            server.el.timers.push(Timer {
                deadline: Instant::now() + Duration::from_millis(after as u64),
                callback: timer.callback,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mio::net::TcpListener;

    use super::{EventLoop, EventMask};

    #[test]
    fn interest_merging() {
        let mut el = EventLoop::new(1024).unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let token = 100;

        assert_eq!(el.interest(token), EventMask::empty());
        el.add_event(&mut listener, token, EventMask::READ).unwrap();
        assert_eq!(el.interest(token), EventMask::READ);
        assert_eq!(el.max_fd(), Some(token));

        // Adding write merges rather than replacing.
        el.add_event(&mut listener, token, EventMask::WRITE).unwrap();
        assert_eq!(el.interest(token), EventMask::READ | EventMask::WRITE);

        el.del_event(&mut listener, token, EventMask::WRITE);
        assert_eq!(el.interest(token), EventMask::READ);

        el.del_event(&mut listener, token, EventMask::READ);
        assert_eq!(el.interest(token), EventMask::empty());
        assert_eq!(el.max_fd(), None);
    }

    #[test]
    fn out_of_range_fd_is_an_error() {
        let mut el = EventLoop::new(8).unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(el.add_event(&mut listener, 8, EventMask::READ).is_err());
        assert!(el.add_event(&mut listener, 9000, EventMask::READ).is_err());
    }

    #[test]
    fn timer_timeout_tracks_earliest() {
        let mut el = EventLoop::new(8).unwrap();
        assert!(el.next_timeout().is_none());
        assert!(el.pop_due_timer().is_none());

        el.add_timer(5000, |_| 0);
        el.add_timer(0, |_| 0);
        let timeout = el.next_timeout().unwrap();
        assert!(timeout <= Duration::from_millis(1));

        // The due timer pops, the far one stays.
        assert!(el.pop_due_timer().is_some());
        assert!(el.pop_due_timer().is_none());
        assert!(el.next_timeout().unwrap() > Duration::from_millis(1000));
    }

    #[test]
    fn listener_readiness_fires() {
        let mut el = EventLoop::new(1024).unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let token = 7;
        el.add_event(&mut listener, token, EventMask::READ).unwrap();

        let _conn = std::net::TcpStream::connect(addr).unwrap();
        let mut fired = Vec::new();
        for _ in 0..50 {
            el.poll(Some(Duration::from_millis(100))).unwrap();
            fired = el.take_fired();
            if !fired.is_empty() {
                break;
            }
        }
        assert!(fired.iter().any(|f| f.token == token && f.readable));
    }
}
