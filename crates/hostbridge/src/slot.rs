//! Completion slot: the write-once result of one task.
//!
//! ```text
//!   engine thread                         host loop thread
//!   ─────────────                         ────────────────
//!   Resolver::resolve(v)
//!     claim  Pending → Resolving
//!     call_soon_threadsafe ─────────────► Slot::complete_on_host(v)
//!                                           publish  Resolving → Resolved
//!                                           release watch, wake awaiter
//!                                         Completion::poll
//!                                           consume  Resolved → Consumed
//! ```
//!
//! The claim is the only cross-thread step. A `Completion` dropped before its
//! value is delivered moves the slot to `Cancelled`, which turns a late
//! resolve into a no-op and makes an in-flight value drop on arrival.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use hostbridge_loop::LoopHandle;
use tracing::{debug, trace, warn};

use crate::error::BridgeError;
use crate::sync::{AtomicU8, Ordering};
use crate::task::{lock, TaskId, TaskShared, TaskState};

// =============================================================================
// Claim protocol
// =============================================================================

const PENDING: u8 = 0;
const RESOLVING: u8 = 1;
const RESOLVED: u8 = 2;
const CONSUMED: u8 = 3;
const CANCELLED: u8 = 4;
const FAULTED: u8 = 5;
/// A fault the awaiter has already read. Still abandons late resolves.
const FAULT_CONSUMED: u8 = 6;

#[doc(hidden)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    Pending,
    Resolving,
    Resolved,
    Consumed,
    Cancelled,
    Faulted,
}

/// Outcome of a resolve attempt.
#[doc(hidden)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// First resolve; the caller owns delivery.
    Won,
    /// The task was cancelled or faulted; the value is discarded.
    Abandoned,
    /// Someone already resolved this task.
    Taken,
}

/// Atomic state of one completion slot.
#[doc(hidden)]
pub struct ClaimCell(AtomicU8);

impl ClaimCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(PENDING))
    }

    pub fn state(&self) -> ClaimState {
        match self.0.load(Ordering::Acquire) {
            PENDING => ClaimState::Pending,
            RESOLVING => ClaimState::Resolving,
            RESOLVED => ClaimState::Resolved,
            CONSUMED | FAULT_CONSUMED => ClaimState::Consumed,
            CANCELLED => ClaimState::Cancelled,
            _ => ClaimState::Faulted,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire) == PENDING
    }

    /// Pending → Resolving. Any thread.
    pub fn claim(&self) -> Claim {
        match self
            .0
            .compare_exchange(PENDING, RESOLVING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Claim::Won,
            Err(CANCELLED | FAULTED | FAULT_CONSUMED) => Claim::Abandoned,
            Err(_) => Claim::Taken,
        }
    }

    /// Resolving → Resolved. Fails if the task was cancelled in between.
    pub fn publish(&self) -> bool {
        self.0
            .compare_exchange(RESOLVING, RESOLVED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Pending or Resolving → Cancelled.
    pub fn cancel(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current != PENDING && current != RESOLVING {
                return false;
            }
            match self
                .0
                .compare_exchange(current, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Pending → Faulted.
    pub fn fault(&self) -> bool {
        self.0
            .compare_exchange(PENDING, FAULTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Resolved or Faulted → Consumed. A consumed fault keeps abandoning
    /// late resolves.
    pub fn consume(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = match current {
                RESOLVED => CONSUMED,
                FAULTED => FAULT_CONSUMED,
                _ => return false,
            };
            match self
                .0
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for ClaimCell {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClaimCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ClaimCell").field(&self.state()).finish()
    }
}

// =============================================================================
// Slot
// =============================================================================

pub(crate) struct Slot<T> {
    pub(crate) shared: Arc<TaskShared>,
    value: Mutex<Option<T>>,
}

impl<T> Slot<T> {
    pub(crate) fn new(shared: Arc<TaskShared>) -> Self {
        Self {
            shared,
            value: Mutex::new(None),
        }
    }

    fn take_value(&self) -> Option<T> {
        lock(&self.value).take()
    }

    /// Runs on the host thread once a claimed value arrives.
    fn complete_on_host(&self, value: T) {
        let mut stored = lock(&self.value);
        if !self.shared.claim.publish() {
            trace!(task = %self.shared.id, "value arrived after cancellation; dropped");
            drop(stored);
            drop(value);
            return;
        }
        *stored = Some(value);
        drop(stored);
        trace!(task = %self.shared.id, "resolved");
        self.shared.settle_on_host();
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// The engine's handle for reporting a task's result.
///
/// Cloneable and usable from any thread. The task accepts exactly one
/// [`resolve`](Self::resolve) across all clones.
pub struct Resolver<T> {
    slot: Arc<Slot<T>>,
}

impl<T: Send + 'static> Resolver<T> {
    pub(crate) fn new(slot: Arc<Slot<T>>) -> Self {
        Self { slot }
    }

    /// Deliver the task's result to the host loop.
    ///
    /// A resolve after the task's [`Completion`] was dropped is discarded.
    /// If the loop has already closed the value is dropped with a warning.
    ///
    /// # Panics
    ///
    /// Panics if the task was already resolved.
    pub fn resolve(&self, value: T) {
        let task = self.slot.shared.id;
        match self.slot.shared.claim.claim() {
            Claim::Won => {}
            Claim::Abandoned => {
                debug!(task = %task, "late resolve ignored");
                return;
            }
            Claim::Taken => panic!("{}", BridgeError::DoubleResolve { task }),
        }

        let slot = Arc::clone(&self.slot);
        let posted = self
            .slot
            .shared
            .remote
            .call_soon_threadsafe(move || slot.complete_on_host(value));
        if let Err(e) = posted {
            warn!(task = %task, error = %e, "host loop gone; resolved value dropped");
        }
    }
}

impl<T> Resolver<T> {
    pub fn task_id(&self) -> TaskId {
        self.slot.shared.id
    }

    /// Lets the engine notice a cancelled task and stop early.
    pub fn state(&self) -> TaskState {
        self.slot.shared.state()
    }
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("task", &self.slot.shared.id)
            .field("claim", &self.slot.shared.claim)
            .finish()
    }
}

// =============================================================================
// Completion
// =============================================================================

/// Host-side awaitable for one launched task.
///
/// - `await` → `Ok(value)` once the engine resolves, or `Err` for a
///   bridge-level fault routed to the task
/// - polled again after that → `Err(BridgeError::AlreadyConsumed)`
/// - `drop` before completion → cancels the task and removes its watch
///
/// Lives on the host loop thread; not `Send`.
pub struct Completion<T> {
    slot: Arc<Slot<T>>,
    host: LoopHandle,
    done: bool,
}

impl<T> Completion<T> {
    pub(crate) fn new(slot: Arc<Slot<T>>, host: LoopHandle) -> Self {
        Self {
            slot,
            host,
            done: false,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.slot.shared.id
    }

    pub fn state(&self) -> TaskState {
        self.slot.shared.state()
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T, BridgeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(Err(BridgeError::AlreadyConsumed));
        }
        let shared = &this.slot.shared;

        match shared.claim.state() {
            ClaimState::Resolved => {
                if let Some(value) = this.slot.take_value() {
                    shared.claim.consume();
                    this.done = true;
                    return Poll::Ready(Ok(value));
                }
            }
            ClaimState::Faulted => {
                if let Some(error) = shared.take_fault() {
                    shared.claim.consume();
                    this.done = true;
                    return Poll::Ready(Err(error));
                }
            }
            ClaimState::Consumed | ClaimState::Cancelled => {
                this.done = true;
                return Poll::Ready(Err(BridgeError::AlreadyConsumed));
            }
            ClaimState::Pending | ClaimState::Resolving => {}
        }

        if this.host.is_closed() {
            this.done = true;
            return Poll::Ready(Err(BridgeError::LoopClosed));
        }
        shared.set_waker(cx.waker());
        Poll::Pending
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let shared = &self.slot.shared;
        if !shared.claim.cancel() {
            // Resolved but never awaited.
            drop(self.slot.take_value());
            return;
        }

        drop(shared.take_waker());
        match shared.take_registration() {
            Some(key) => {
                let removed = self.host.remove_watch(key.fd, key.direction);
                debug!(task = %shared.id, %key, removed, "cancelled; released watch");
            }
            None => debug!(task = %shared.id, "cancelled"),
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("task", &self.slot.shared.id)
            .field("state", &self.state())
            .finish()
    }
}
