//! Readiness registrar: lets the engine borrow one host readiness edge at a
//! time for a descriptor it owns.
//!
//! A registrar is bound to one task and one direction. Registering installs a
//! one-shot host watch. When the descriptor becomes ready the host removes the
//! watch, clears the task's registration record, and only then calls the
//! engine's `on_ready` on the host thread. The engine re-registers if it must
//! wait again.

use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;

use hostbridge_loop::{Direction, LoopHandle, WatchKey};
use tracing::{trace, warn};

use crate::error::{BridgeError, Result};
use crate::task::{TaskId, TaskShared};

/// One-shot readiness signal handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub direction: Direction,
}

/// Capability to wait for one readiness direction on behalf of one task.
#[derive(Clone)]
pub struct Registrar {
    task: Arc<TaskShared>,
    direction: Direction,
}

impl Registrar {
    pub(crate) fn new(task: Arc<TaskShared>, direction: Direction) -> Self {
        Self { task, direction }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    /// Ask the host to call `on_ready` once `fd` is ready in this direction.
    ///
    /// On the host loop thread the watch is installed immediately and faults
    /// are returned: [`BridgeError::DuplicateRegistration`] if the pair is
    /// already watched, [`BridgeError::TaskAlreadyWaiting`] if this task holds
    /// another registration.
    ///
    /// From any other thread the request is queued onto the loop. `Ok` then
    /// only means it was queued; a fault found on arrival fails the task, and
    /// its `Completion` yields the error.
    ///
    /// Requests for a task that is already finished or cancelled are dropped
    /// without touching the host.
    pub fn register<F>(&self, fd: RawFd, on_ready: F) -> Result<()>
    where
        F: FnOnce(ReadyEvent) + Send + 'static,
    {
        let key = WatchKey::new(fd, self.direction);
        let remote = &self.task.remote;

        if remote.is_loop_thread() {
            let host = LoopHandle::current().filter(|host| host.id() == remote.loop_id());
            if let Some(host) = host {
                return install(&host, &self.task, key, on_ready);
            }
        }

        let task = Arc::clone(&self.task);
        remote
            .call_soon_threadsafe(move || {
                let Some(host) = LoopHandle::current() else {
                    return;
                };
                if let Err(error) = install(&host, &task, key, on_ready) {
                    warn!(task = %task.id, %key, error = %error, "queued registration rejected");
                    task.fault(error);
                }
            })
            .map_err(BridgeError::from)
    }
}

impl fmt::Debug for Registrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registrar")
            .field("task", &self.task.id)
            .field("direction", &self.direction)
            .finish()
    }
}

/// Install a watch for `task` on the host thread.
fn install<F>(host: &LoopHandle, task: &Arc<TaskShared>, key: WatchKey, on_ready: F) -> Result<()>
where
    F: FnOnce(ReadyEvent) + 'static,
{
    if !task.claim.is_pending() {
        trace!(task = %task.id, %key, "task settled; registration dropped");
        return Ok(());
    }
    if host.has_watch(key.fd, key.direction) {
        return Err(BridgeError::DuplicateRegistration {
            fd: key.fd,
            direction: key.direction,
        });
    }
    if let Some(active) = task.registration() {
        return Err(BridgeError::TaskAlreadyWaiting {
            task: task.id,
            key: active,
        });
    }

    let owner = Arc::clone(task);
    host.add_watch(key.fd, key.direction, move || {
        owner.clear_registration(key);
        trace!(task = %owner.id, %key, "ready");
        on_ready(ReadyEvent {
            fd: key.fd,
            direction: key.direction,
        });
    })?;
    task.set_registration(key);
    trace!(task = %task.id, %key, "waiting");
    Ok(())
}
