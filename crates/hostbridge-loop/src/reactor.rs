//! IO Reactor using the `polling` crate.
//!
//! The reactor owns the loop's multiplexer and its watch table. A watch is a
//! one-shot callback keyed by `(fd, direction)`. Read and write watches on the
//! same descriptor share a single poller registration whose interest is the
//! union of the live watches.
//!
//! Registrations are level-triggered. When an event arrives, every fired
//! watch is removed and the OS interest narrowed BEFORE any callback runs, so
//! a descriptor that stays ready cannot deliver the same edge twice.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use polling::{Event, Events, PollMode, Poller};
use tracing::{debug, trace};

use crate::error::LoopError;

// =============================================================================
// Direction / key
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchKey {
    pub fd: RawFd,
    pub direction: Direction,
}

impl WatchKey {
    pub fn new(fd: RawFd, direction: Direction) -> Self {
        Self { fd, direction }
    }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd {} ({})", self.fd, self.direction)
    }
}

pub(crate) type WatchCallback = Box<dyn FnOnce()>;

/// A watch that has been removed from the table and is waiting to run.
pub(crate) struct Fired {
    pub key: WatchKey,
    pub callback: WatchCallback,
}

/// A watch the reactor refused. The callback is handed back so the caller can
/// drop it outside its borrow of the reactor.
pub(crate) struct Rejected {
    pub error: LoopError,
    pub callback: WatchCallback,
}

// =============================================================================
// Per-descriptor watch state
// =============================================================================

struct FdEntry {
    fd: RawFd,
    read: Option<WatchCallback>,
    write: Option<WatchCallback>,
}

impl FdEntry {
    fn slot(&mut self, direction: Direction) -> &mut Option<WatchCallback> {
        match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }

    fn is_idle(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

// =============================================================================
// Reactor
// =============================================================================

pub(crate) struct Reactor {
    poller: Arc<Poller>,
    entries: HashMap<usize, FdEntry>, // token -> entry
    tokens: HashMap<RawFd, usize>,    // fd -> token
    next_token: usize,
    events: Events,
}

impl Reactor {
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        let capacity = NonZeroUsize::new(event_capacity).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            poller: Arc::new(Poller::new()?),
            entries: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 1, // Start at 1, reserve 0 for special use
            events: Events::with_capacity(capacity),
        })
    }

    /// Shared poller, used by remote threads to interrupt a blocking wait.
    pub fn poller(&self) -> Arc<Poller> {
        Arc::clone(&self.poller)
    }

    pub fn has_watch(&self, key: WatchKey) -> bool {
        self.tokens
            .get(&key.fd)
            .and_then(|token| self.entries.get(token))
            .is_some_and(|entry| match key.direction {
                Direction::Read => entry.read.is_some(),
                Direction::Write => entry.write.is_some(),
            })
    }

    pub fn watch_count(&self) -> usize {
        self.entries
            .values()
            .map(|e| usize::from(e.read.is_some()) + usize::from(e.write.is_some()))
            .sum()
    }

    /// Install a one-shot watch. The descriptor must stay open until the watch
    /// fires or is removed.
    pub fn add_watch(&mut self, key: WatchKey, callback: WatchCallback) -> Result<(), Rejected> {
        if let Some(&token) = self.tokens.get(&key.fd) {
            return self.attach(token, key, callback);
        }

        let token = self.next_token;
        self.next_token += 1;

        // Safety: the caller keeps fd open while it is watched, and every path
        // that drops the last watch deletes the registration.
        let added = unsafe {
            self.poller.add_with_mode(
                key.fd,
                Event::new(
                    token,
                    key.direction == Direction::Read,
                    key.direction == Direction::Write,
                ),
                PollMode::Level,
            )
        };
        if let Err(e) = added {
            return Err(Rejected {
                error: e.into(),
                callback,
            });
        }

        let mut entry = FdEntry {
            fd: key.fd,
            read: None,
            write: None,
        };
        *entry.slot(key.direction) = Some(callback);
        self.entries.insert(token, entry);
        self.tokens.insert(key.fd, token);

        debug!(fd = key.fd, direction = %key.direction, token, "registered descriptor");
        Ok(())
    }

    /// Add a direction to a descriptor that already has a registration.
    fn attach(&mut self, token: usize, key: WatchKey, callback: WatchCallback) -> Result<(), Rejected> {
        let Some(entry) = self.entries.get_mut(&token) else {
            let error = io::Error::other("watch table out of sync").into();
            return Err(Rejected { error, callback });
        };
        let slot = entry.slot(key.direction);
        if slot.is_some() {
            let error = LoopError::DuplicateWatch {
                fd: key.fd,
                direction: key.direction,
            };
            return Err(Rejected { error, callback });
        }
        *slot = Some(callback);

        if let Err(e) = self.sync_interest(token) {
            // Roll back so the table never claims a watch the OS lacks.
            let callback = self
                .entries
                .get_mut(&token)
                .and_then(|entry| entry.slot(key.direction).take());
            if let Some(callback) = callback {
                return Err(Rejected {
                    error: e.into(),
                    callback,
                });
            }
        }
        trace!(fd = key.fd, direction = %key.direction, token, "watch added");
        Ok(())
    }

    /// Detach a watch without running it. The caller drops the returned
    /// callback once its borrow of the reactor is released.
    pub fn remove_watch(&mut self, key: WatchKey) -> Option<WatchCallback> {
        let token = *self.tokens.get(&key.fd)?;
        let removed = self.entries.get_mut(&token)?.slot(key.direction).take()?;
        // Ignore errors here (fd might already be closed)
        let _ = self.sync_interest(token);
        trace!(fd = key.fd, direction = %key.direction, token, "watch removed");
        Some(removed)
    }

    /// Bring the OS interest in line with the live watches for `token`,
    /// deleting the registration once none remain.
    fn sync_interest(&mut self, token: usize) -> io::Result<()> {
        let Some(entry) = self.entries.get(&token) else {
            return Ok(());
        };
        let fd = entry.fd;

        if entry.is_idle() {
            self.entries.remove(&token);
            self.tokens.remove(&fd);
            unsafe {
                let borrowed = BorrowedFd::borrow_raw(fd);
                let _ = self.poller.delete(&borrowed);
            }
            debug!(fd, token, "deregistered descriptor");
            return Ok(());
        }

        let readable = entry.read.is_some();
        let writable = entry.write.is_some();
        unsafe {
            let borrowed = BorrowedFd::borrow_raw(fd);
            self.poller.modify_with_mode(
                &borrowed,
                Event::new(token, readable, writable),
                PollMode::Level,
            )
        }
    }

    /// Wait for readiness and detach every watch that fired.
    ///
    /// The returned callbacks have already been removed from the table; the
    /// caller runs them after releasing its borrow of the reactor.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Fired>> {
        self.events.clear();

        match self.poller.wait(&mut self.events, timeout) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        let ready: Vec<(usize, bool, bool)> = self
            .events
            .iter()
            .map(|ev| (ev.key, ev.readable, ev.writable))
            .collect();

        let mut fired = Vec::new();
        for (token, readable, writable) in ready {
            let Some(entry) = self.entries.get_mut(&token) else {
                continue;
            };
            let fd = entry.fd;
            trace!(fd, token, readable, writable, "readiness event");

            if readable {
                if let Some(callback) = entry.read.take() {
                    fired.push(Fired {
                        key: WatchKey::new(fd, Direction::Read),
                        callback,
                    });
                }
            }
            if writable {
                if let Some(callback) = entry.write.take() {
                    fired.push(Fired {
                        key: WatchKey::new(fd, Direction::Write),
                        callback,
                    });
                }
            }

            let _ = self.sync_interest(token);
        }

        Ok(fired)
    }

    /// Detach every watch without running it.
    pub fn drain(&mut self) -> Vec<WatchCallback> {
        let tokens: Vec<usize> = self.entries.keys().copied().collect();
        let mut callbacks = Vec::new();
        for token in tokens {
            if let Some(entry) = self.entries.get_mut(&token) {
                callbacks.extend(entry.read.take());
                callbacks.extend(entry.write.take());
            }
            let _ = self.sync_interest(token);
        }
        callbacks
    }
}
