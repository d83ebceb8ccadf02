//! Loop timers: [`sleep`], [`Sleep`], [`timeout`], [`Elapsed`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use pin_project_lite::pin_project;

use crate::executor::LoopHandle;

// =============================================================================
// Timer table (one per loop)
// =============================================================================

pub(crate) struct TimerEntry {
    deadline: Instant,
    waker: Waker,
}

pub(crate) struct Timers {
    entries: HashMap<u64, TimerEntry>,
    next_handle: u64,
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            next_handle: 1,
        }
    }
}

impl Timers {
    /// Register or update a timer. Returns the timer handle.
    /// If `old_handle` is live, only its waker is replaced.
    pub fn register(&mut self, deadline: Instant, waker: &Waker, old_handle: u64) -> u64 {
        if let Some(entry) = self.entries.get_mut(&old_handle) {
            entry.waker.clone_from(waker);
            return old_handle;
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.entries.insert(
            handle,
            TimerEntry {
                deadline,
                waker: waker.clone(),
            },
        );
        handle
    }

    pub fn cancel(&mut self, handle: u64) -> Option<Waker> {
        self.entries.remove(&handle).map(|e| e.waker)
    }

    /// Remove every timer due at `now`, returning their wakers.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Waker> {
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(h, _)| *h)
            .collect();
        expired
            .iter()
            .filter_map(|h| self.entries.remove(h).map(|e| e.waker))
            .collect()
    }

    /// Time until the earliest deadline; zero if one is already due.
    pub fn next_deadline(&self, now: Instant) -> Option<Duration> {
        self.entries
            .values()
            .map(|e| e.deadline.saturating_duration_since(now))
            .min()
    }

    pub fn drain(&mut self) -> Vec<Waker> {
        self.entries.drain().map(|(_, e)| e.waker).collect()
    }
}

// =============================================================================
// Sleep
// =============================================================================

/// Sleep for the given duration on the current loop.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep::until(Instant::now() + duration)
}

/// Future that completes at a deadline.
///
/// # Panics
///
/// Polling a `Sleep` outside [`HostLoop::block_on`](crate::HostLoop::block_on)
/// panics, since there is no loop to own the timer.
#[derive(Debug)]
pub struct Sleep {
    deadline: Instant,
    registration: Option<(LoopHandle, u64)>,
}

impl Sleep {
    pub fn until(deadline: Instant) -> Self {
        Self {
            deadline,
            registration: None,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_elapsed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn unregister(&mut self) {
        if let Some((host, handle)) = self.registration.take() {
            let waker = host.core.timers.borrow_mut().cancel(handle);
            drop(waker);
        }
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.is_elapsed() {
            self.unregister();
            return Poll::Ready(());
        }

        let host = match &self.registration {
            Some((host, _)) => host.clone(),
            None => LoopHandle::current()
                .unwrap_or_else(|| panic!("`Sleep` polled outside of a running HostLoop")),
        };
        let old_handle = self.registration.as_ref().map_or(0, |(_, h)| *h);
        let deadline = self.deadline;
        let handle = host
            .core
            .timers
            .borrow_mut()
            .register(deadline, cx.waker(), old_handle);
        self.registration = Some((host, handle));
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        self.unregister();
    }
}

// =============================================================================
// Timeout
// =============================================================================

/// The deadline of a [`timeout`] passed before its future completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline has elapsed")]
pub struct Elapsed;

/// Require `future` to complete within `duration`. The inner future is
/// dropped when the deadline wins.
pub fn timeout<F: Future>(duration: Duration, future: F) -> Timeout<F> {
    Timeout {
        future,
        sleep: sleep(duration),
    }
}

pin_project! {
    /// Future returned by [`timeout`].
    #[derive(Debug)]
    pub struct Timeout<F> {
        #[pin]
        future: F,
        sleep: Sleep,
    }
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output, Elapsed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(output) = this.future.poll(cx) {
            return Poll::Ready(Ok(output));
        }
        match Pin::new(this.sleep).poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(Elapsed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn waker() -> (Arc<CountingWaker>, Waker) {
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        (Arc::clone(&counter), Waker::from(counter))
    }

    #[test]
    fn expired_timers_are_removed() {
        let (_, w) = waker();
        let mut timers = Timers::default();
        let now = Instant::now();
        let due = timers.register(now, &w, 0);
        let later = timers.register(now + Duration::from_secs(60), &w, 0);
        assert_ne!(due, later);

        assert_eq!(timers.take_expired(now).len(), 1);
        assert!(timers.take_expired(now).is_empty());
        assert!(timers.cancel(later).is_some());
        assert_eq!(timers.next_deadline(now), None);
    }

    #[test]
    fn reregister_keeps_handle() {
        let (_, w) = waker();
        let mut timers = Timers::default();
        let deadline = Instant::now() + Duration::from_secs(1);
        let handle = timers.register(deadline, &w, 0);
        assert_eq!(timers.register(deadline, &w, handle), handle);
        assert_eq!(timers.entries.len(), 1);
    }

    #[test]
    fn next_deadline_saturates_at_zero() {
        let (_, w) = waker();
        let mut timers = Timers::default();
        let now = Instant::now();
        timers.register(now, &w, 0);
        assert_eq!(
            timers.next_deadline(now + Duration::from_millis(5)),
            Some(Duration::ZERO)
        );
    }
}
