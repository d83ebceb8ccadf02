//! Task bridge and launcher.
//!
//! A task is one in-flight unit of engine work. Launching builds its shared
//! state, hands the engine three capabilities (a [`Resolver`] and a read and
//! write [`Registrar`]) and returns the host-side [`Completion`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::Waker;

use hostbridge_loop::{Direction, LoopHandle, RemoteHandle, WatchKey};
use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::registrar::Registrar;
use crate::slot::{ClaimCell, ClaimState, Completion, Resolver, Slot};

/// Lock a mutex, recovering from poisoning. Every guarded value here is a
/// plain `Option` replaced in one step, so it is never left half-written.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Identity and state
// =============================================================================

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// The engine's entry point has not returned yet.
    Created,
    Running,
    /// Holding a descriptor registration that has not fired.
    WaitingOnIo,
    Completed,
    Cancelled,
}

// =============================================================================
// Shared task state
// =============================================================================

/// State reachable from the engine side. Everything except `claim` is only
/// written on the host loop thread; the mutexes make it `Sync`.
pub(crate) struct TaskShared {
    pub(crate) id: TaskId,
    pub(crate) claim: ClaimCell,
    pub(crate) remote: RemoteHandle,
    started: AtomicBool,
    fault: Mutex<Option<BridgeError>>,
    waker: Mutex<Option<Waker>>,
    registration: Mutex<Option<WatchKey>>,
}

impl TaskShared {
    fn new(remote: RemoteHandle) -> Self {
        Self {
            id: TaskId::next(),
            claim: ClaimCell::new(),
            remote,
            started: AtomicBool::new(false),
            fault: Mutex::new(None),
            waker: Mutex::new(None),
            registration: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        match self.claim.state() {
            ClaimState::Pending => {
                if lock(&self.registration).is_some() {
                    TaskState::WaitingOnIo
                } else if self.started.load(Ordering::Acquire) {
                    TaskState::Running
                } else {
                    TaskState::Created
                }
            }
            ClaimState::Resolving => TaskState::Running,
            ClaimState::Resolved | ClaimState::Consumed | ClaimState::Faulted => {
                TaskState::Completed
            }
            ClaimState::Cancelled => TaskState::Cancelled,
        }
    }

    pub(crate) fn registration(&self) -> Option<WatchKey> {
        *lock(&self.registration)
    }

    pub(crate) fn set_registration(&self, key: WatchKey) {
        *lock(&self.registration) = Some(key);
    }

    pub(crate) fn take_registration(&self) -> Option<WatchKey> {
        lock(&self.registration).take()
    }

    /// Forget `key` if it is still the active registration.
    pub(crate) fn clear_registration(&self, key: WatchKey) {
        let mut registration = lock(&self.registration);
        if *registration == Some(key) {
            *registration = None;
        }
    }

    pub(crate) fn set_waker(&self, waker: &Waker) {
        let mut slot = lock(&self.waker);
        match slot.as_mut() {
            Some(existing) => existing.clone_from(waker),
            None => *slot = Some(waker.clone()),
        }
    }

    pub(crate) fn take_waker(&self) -> Option<Waker> {
        lock(&self.waker).take()
    }

    pub(crate) fn take_fault(&self) -> Option<BridgeError> {
        lock(&self.fault).take()
    }

    /// Fail the task with a bridge-level fault. Host thread only.
    pub(crate) fn fault(&self, error: BridgeError) {
        let mut fault = lock(&self.fault);
        if !self.claim.fault() {
            debug!(task = %self.id, error = %error, "fault after task settled; dropped");
            return;
        }
        *fault = Some(error);
        drop(fault);
        self.settle_on_host();
    }

    /// The task just reached a terminal state on the host thread: release any
    /// watch it still holds and wake the awaiter.
    pub(crate) fn settle_on_host(&self) {
        if let Some(key) = self.take_registration() {
            if let Some(host) = LoopHandle::current() {
                let removed = host.remove_watch(key.fd, key.direction);
                debug!(task = %self.id, %key, removed, "completed while waiting; released watch");
            }
        }
        if let Some(waker) = self.take_waker() {
            waker.wake();
        }
    }
}

// =============================================================================
// Entry points
// =============================================================================

/// The engine's task-starting operation.
///
/// `start` runs synchronously inside [`Launcher::launch`] and must return
/// promptly, handing the actual work to the engine's own threads.
/// Implemented for every `FnOnce(Resolver<T>, Registrar, Registrar)`.
pub trait EntryPoint<T> {
    fn start(self, resolve: Resolver<T>, read: Registrar, write: Registrar);
}

impl<T, F> EntryPoint<T> for F
where
    F: FnOnce(Resolver<T>, Registrar, Registrar),
{
    fn start(self, resolve: Resolver<T>, read: Registrar, write: Registrar) {
        self(resolve, read, write)
    }
}

// =============================================================================
// Launcher
// =============================================================================

/// Starts engine tasks on one host loop.
#[derive(Clone, Debug)]
pub struct Launcher {
    host: LoopHandle,
}

impl Launcher {
    pub fn new(host: LoopHandle) -> Self {
        Self { host }
    }

    /// Launcher for the loop running on this thread.
    pub fn current() -> Result<Self> {
        LoopHandle::current()
            .map(Self::new)
            .ok_or(BridgeError::NoLoop)
    }

    pub fn host(&self) -> &LoopHandle {
        &self.host
    }

    /// Launch one task and return its awaitable without blocking.
    pub fn launch<T, E>(&self, entry: E) -> Completion<T>
    where
        T: Send + 'static,
        E: EntryPoint<T>,
    {
        let shared = Arc::new(TaskShared::new(self.host.remote()));
        let slot = Arc::new(Slot::new(Arc::clone(&shared)));
        let completion = Completion::new(Arc::clone(&slot), self.host.clone());
        debug!(task = %shared.id, loop_id = %self.host.id(), "launch");

        entry.start(
            Resolver::new(slot),
            Registrar::new(Arc::clone(&shared), Direction::Read),
            Registrar::new(Arc::clone(&shared), Direction::Write),
        );
        shared
            .started
            .store(true, Ordering::Release);

        completion
    }
}
