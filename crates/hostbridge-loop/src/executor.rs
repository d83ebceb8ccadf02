//! Single-threaded cooperative executor.
//!
//! # Design
//!
//! One `HostLoop` per thread. All executor state sits behind `RefCell`s on
//! the loop thread; a [`RemoteHandle`] is the only part that crosses threads.
//!
//! ```text
//!  foreign threads                          loop thread
//!  ───────────────                          ───────────
//!  RemoteHandle::call_soon_threadsafe ──┐
//!  Waker::wake (task / root)          ──┼──► RemoteQueue ──► drain_remote ─┐
//!                                       │     (SegQueue)                   │
//!                                       └──► Poller::notify                ▼
//!                                                             tick: calls, timers,
//!                                                             ready tasks, then park
//!                                                             in the reactor
//! ```
//!
//! # Borrow discipline
//!
//! Executor borrows are NEVER held while user code runs. Task polls, waker
//! fires, watch callbacks, scheduled closures and destructors of dropped
//! futures all happen after the relevant borrow is released, so any of them
//! may call back into the loop (spawn, add a watch, schedule a closure).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::os::fd::RawFd;
use std::pin::{pin, Pin};
use std::rc::Rc;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use polling::Poller;
use tracing::{debug, trace, warn};

use crate::config::LoopConfig;
use crate::error::{LoopError, Result};
use crate::reactor::{Direction, Reactor, Rejected, WatchKey};
use crate::sync::{AtomicBool, Ordering, RemoteQueue};
use crate::timer::Timers;

type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;
type LocalCall = Box<dyn FnOnce()>;
type RemoteCall = Box<dyn FnOnce() + Send>;

// =============================================================================
// Loop identity
// =============================================================================

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopId(u64);

impl LoopId {
    fn next() -> Self {
        Self(NEXT_LOOP_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loop-{}", self.0)
    }
}

// =============================================================================
// Remote side (the only state shared with other threads)
// =============================================================================

enum RemoteOp {
    Wake { slot: u32, generation: u32 },
    Call(RemoteCall),
}

struct Remote {
    id: LoopId,
    owner: ThreadId,
    queue: RemoteQueue<RemoteOp>,
    poller: Arc<Poller>,
    closed: AtomicBool,
}

impl Remote {
    fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    fn push(&self, op: RemoteOp) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LoopError::Closed);
        }
        self.queue.push(op);
        // The loop thread drains the queue before it parks again.
        if !self.is_loop_thread() {
            self.notify();
        }
        Ok(())
    }

    fn notify(&self) {
        if let Err(e) = self.poller.notify() {
            warn!(loop_id = %self.id, error = %e, "failed to interrupt reactor");
        }
    }
}

/// Thread-safe handle to a [`HostLoop`].
#[derive(Clone)]
pub struct RemoteHandle {
    remote: Arc<Remote>,
}

impl RemoteHandle {
    /// Schedule `f` to run on the loop thread during its next tick.
    ///
    /// Safe to call from any thread. Fails once the loop has been dropped.
    pub fn call_soon_threadsafe<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.remote.push(RemoteOp::Call(Box::new(f)))
    }

    pub fn is_loop_thread(&self) -> bool {
        self.remote.is_loop_thread()
    }

    pub fn loop_id(&self) -> LoopId {
        self.remote.id
    }

    pub fn is_closed(&self) -> bool {
        self.remote.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("loop_id", &self.remote.id)
            .finish()
    }
}

// =============================================================================
// Wakers
// =============================================================================

struct TaskWaker {
    remote: Arc<Remote>,
    slot: u32,
    generation: u32,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        // A closed loop has nothing left to poll.
        let _ = self.remote.push(RemoteOp::Wake {
            slot: self.slot,
            generation: self.generation,
        });
    }
}

/// Waker for the future passed to `block_on`, which has no task slot.
struct RootWaker {
    remote: Arc<Remote>,
    woken: AtomicBool,
}

impl RootWaker {
    fn take(&self) -> bool {
        self.woken.swap(false, Ordering::AcqRel)
    }

    fn is_set(&self) -> bool {
        self.woken.load(Ordering::Acquire)
    }
}

impl Wake for RootWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.woken.store(true, Ordering::Release);
        if !self.remote.is_loop_thread() {
            self.remote.notify();
        }
    }
}

// =============================================================================
// Task slots
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Empty,
    Idle,
    Scheduled,
    Running,
    /// Aborted from inside its own poll; dropped when the poll returns.
    Aborted,
}

struct TaskSlot {
    future: Option<LocalFuture>,
    waker: Option<Waker>,
    generation: u32,
    state: SlotState,
}

#[derive(Default)]
struct TaskTable {
    slots: Vec<TaskSlot>,
    free: Vec<u32>,
    live: usize,
}

impl TaskTable {
    fn insert(&mut self, future: LocalFuture, remote: &Arc<Remote>) -> (u32, u32) {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.slots.push(TaskSlot {
                    future: None,
                    waker: None,
                    generation: 0,
                    state: SlotState::Empty,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[id as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.future = Some(future);
        slot.waker = Some(Waker::from(Arc::new(TaskWaker {
            remote: Arc::clone(remote),
            slot: id,
            generation: slot.generation,
        })));
        slot.state = SlotState::Scheduled;
        let generation = slot.generation;
        self.live += 1;
        (id, generation)
    }

    fn get_mut(&mut self, id: u32, generation: u32) -> Option<&mut TaskSlot> {
        self.slots
            .get_mut(id as usize)
            .filter(|slot| slot.generation == generation && slot.state != SlotState::Empty)
    }

    /// Idle → Scheduled. Returns true if the caller must enqueue the task.
    fn schedule(&mut self, id: u32, generation: u32) -> bool {
        match self.get_mut(id, generation) {
            Some(slot) if slot.state == SlotState::Idle => {
                slot.state = SlotState::Scheduled;
                true
            }
            _ => false,
        }
    }

    fn begin_poll(&mut self, id: u32) -> Option<(LocalFuture, Waker)> {
        let slot = self.slots.get_mut(id as usize)?;
        if slot.state != SlotState::Scheduled {
            return None;
        }
        let future = slot.future.take()?;
        let waker = slot.waker.clone()?;
        slot.state = SlotState::Running;
        Some((future, waker))
    }

    /// Put a polled future back. Returns the future if it must be dropped.
    fn end_poll(&mut self, id: u32, future: LocalFuture, done: bool) -> Option<LocalFuture> {
        let slot = &mut self.slots[id as usize];
        match slot.state {
            SlotState::Running if !done => {
                slot.future = Some(future);
                slot.state = SlotState::Idle;
                None
            }
            _ => {
                self.release(id);
                Some(future)
            }
        }
    }

    fn abort(&mut self, id: u32, generation: u32) -> Option<LocalFuture> {
        let slot = self.get_mut(id, generation)?;
        match slot.state {
            SlotState::Running => {
                slot.state = SlotState::Aborted;
                None
            }
            SlotState::Idle | SlotState::Scheduled => {
                let future = slot.future.take();
                self.release(id);
                future
            }
            SlotState::Empty | SlotState::Aborted => None,
        }
    }

    fn release(&mut self, id: u32) {
        let slot = &mut self.slots[id as usize];
        slot.state = SlotState::Empty;
        slot.future = None;
        slot.waker = None;
        self.free.push(id);
        self.live -= 1;
    }

    fn drain(&mut self) -> Vec<LocalFuture> {
        let mut futures = Vec::new();
        for id in 0..self.slots.len() as u32 {
            if self.slots[id as usize].state != SlotState::Empty {
                futures.extend(self.slots[id as usize].future.take());
                self.release(id);
            }
        }
        futures
    }
}

// =============================================================================
// Core (loop-thread state)
// =============================================================================

pub(crate) struct Core {
    id: LoopId,
    config: LoopConfig,
    remote: Arc<Remote>,
    tasks: RefCell<TaskTable>,
    ready: RefCell<VecDeque<u32>>,
    calls: RefCell<VecDeque<LocalCall>>,
    pub(crate) timers: RefCell<Timers>,
    reactor: RefCell<Reactor>,
}

impl Core {
    fn new(config: LoopConfig) -> Result<Self> {
        let id = LoopId::next();
        let reactor = Reactor::new(config.event_capacity)?;
        let remote = Arc::new(Remote {
            id,
            owner: thread::current().id(),
            queue: RemoteQueue::new(),
            poller: reactor.poller(),
            closed: AtomicBool::new(false),
        });
        Ok(Self {
            id,
            config,
            remote,
            tasks: RefCell::new(TaskTable::default()),
            ready: RefCell::new(VecDeque::new()),
            calls: RefCell::new(VecDeque::new()),
            timers: RefCell::new(Timers::default()),
            reactor: RefCell::new(reactor),
        })
    }

    /// One pass over every work source. Returns true if anything ran.
    fn tick(&self) -> bool {
        let mut did_work = self.drain_remote();
        did_work |= self.run_calls();
        did_work |= self.fire_timers();
        did_work |= self.poll_tasks();
        did_work
    }

    fn drain_remote(&self) -> bool {
        let mut drained = 0usize;
        while drained < self.config.remote_budget {
            let Some(op) = self.remote.queue.pop() else {
                break;
            };
            drained += 1;
            match op {
                RemoteOp::Wake { slot, generation } => {
                    if self.tasks.borrow_mut().schedule(slot, generation) {
                        self.ready.borrow_mut().push_back(slot);
                    }
                }
                RemoteOp::Call(f) => f(),
            }
        }
        drained > 0
    }

    fn run_calls(&self) -> bool {
        // Closures queued while this batch runs wait for the next tick.
        let pending = self.calls.borrow().len();
        for _ in 0..pending {
            let Some(f) = self.calls.borrow_mut().pop_front() else {
                break;
            };
            f();
        }
        pending > 0
    }

    fn fire_timers(&self) -> bool {
        let expired = self.timers.borrow_mut().take_expired(Instant::now());
        let fired = !expired.is_empty();
        for waker in expired {
            waker.wake();
        }
        fired
    }

    fn poll_tasks(&self) -> bool {
        let pending = self.ready.borrow().len();
        for _ in 0..pending {
            let Some(id) = self.ready.borrow_mut().pop_front() else {
                break;
            };
            let Some((mut future, waker)) = self.tasks.borrow_mut().begin_poll(id) else {
                continue;
            };

            let mut cx = Context::from_waker(&waker);
            let done = future.as_mut().poll(&mut cx).is_ready();
            if done {
                trace!(loop_id = %self.id, slot = id, "task complete");
            }

            let dead = self.tasks.borrow_mut().end_poll(id, future, done);
            drop(dead);
        }
        pending > 0
    }

    /// Block in the reactor until readiness, a remote notification, the next
    /// timer deadline, or `max_park`.
    fn park(&self) {
        let timeout = self
            .timers
            .borrow()
            .next_deadline(Instant::now())
            .map_or(self.config.max_park, |d| d.min(self.config.max_park));

        let fired = self.reactor.borrow_mut().poll(Some(timeout));
        match fired {
            Ok(fired) => {
                for watch in fired {
                    trace!(fd = watch.key.fd, direction = %watch.key.direction, "watch fired");
                    (watch.callback)();
                }
            }
            Err(e) => {
                warn!(loop_id = %self.id, error = %e, "reactor wait failed");
                thread::sleep(timeout.min(Duration::from_millis(1)));
            }
        }
    }

    fn shutdown(&self) {
        self.remote.closed.store(true, Ordering::Release);

        // Take everything out first; destructors may call back into the loop.
        let futures = self.tasks.borrow_mut().drain();
        self.ready.borrow_mut().clear();
        let calls: Vec<LocalCall> = self.calls.borrow_mut().drain(..).collect();
        let watches = self.reactor.borrow_mut().drain();
        let timers = self.timers.borrow_mut().drain();
        let mut remote = Vec::new();
        while let Some(op) = self.remote.queue.pop() {
            remote.push(op);
        }

        debug!(
            loop_id = %self.id,
            tasks = futures.len(),
            watches = watches.len(),
            "host loop shut down"
        );

        drop(futures);
        drop(calls);
        drop(watches);
        drop(timers);
        drop(remote);
    }
}

// =============================================================================
// Current loop (thread-local)
// =============================================================================

thread_local! {
    static CURRENT: RefCell<Option<LoopHandle>> = const { RefCell::new(None) };
}

/// Marks a loop as current for the duration of `block_on`.
struct Enter {
    previous: Option<LoopHandle>,
}

impl Enter {
    fn new(handle: &LoopHandle) -> Self {
        let previous = CURRENT.with(|c| c.replace(Some(handle.clone())));
        Self { previous }
    }
}

impl Drop for Enter {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|c| {
            c.replace(previous);
        });
    }
}

// =============================================================================
// LoopHandle
// =============================================================================

/// Loop-thread handle to a [`HostLoop`]. Not `Send`.
#[derive(Clone)]
pub struct LoopHandle {
    pub(crate) core: Rc<Core>,
}

impl LoopHandle {
    /// The loop driving the current thread, if inside `block_on`.
    pub fn current() -> Option<Self> {
        CURRENT.with(|c| c.borrow().clone())
    }

    pub fn id(&self) -> LoopId {
        self.core.id
    }

    pub fn config(&self) -> &LoopConfig {
        &self.core.config
    }

    pub fn remote(&self) -> RemoteHandle {
        RemoteHandle {
            remote: Arc::clone(&self.core.remote),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.core.remote.closed.load(Ordering::Acquire)
    }

    /// Spawn a task on this loop. It first runs during the next tick.
    pub fn spawn_local<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let join = Rc::new(RefCell::new(JoinState::<F::Output>::default()));
        let sink = Rc::clone(&join);
        let task = async move {
            let output = future.await;
            let waker = {
                let mut state = sink.borrow_mut();
                state.output = Some(output);
                state.finished = true;
                state.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        };

        let (slot, generation) = self
            .core
            .tasks
            .borrow_mut()
            .insert(Box::pin(task), &self.core.remote);
        self.core.ready.borrow_mut().push_back(slot);
        trace!(loop_id = %self.core.id, slot, generation, "spawn");

        JoinHandle {
            join,
            core: Rc::clone(&self.core),
            slot,
            generation,
        }
    }

    /// Schedule `f` on this loop's next tick.
    pub fn call_soon<F>(&self, f: F)
    where
        F: FnOnce() + 'static,
    {
        self.core.calls.borrow_mut().push_back(Box::new(f));
    }

    /// Watch `fd` for one readiness edge in `direction`.
    ///
    /// The watch is removed before `callback` runs. A second watch for a pair
    /// that is still live fails with [`LoopError::DuplicateWatch`]. The
    /// descriptor must stay open until the watch fires or is removed.
    pub fn add_watch<F>(&self, fd: RawFd, direction: Direction, callback: F) -> Result<()>
    where
        F: FnOnce() + 'static,
    {
        let added = self
            .core
            .reactor
            .borrow_mut()
            .add_watch(WatchKey::new(fd, direction), Box::new(callback));
        match added {
            Ok(()) => Ok(()),
            Err(Rejected { error, callback }) => {
                drop(callback);
                Err(error)
            }
        }
    }

    /// Remove a watch without running it. Returns true if one was live.
    pub fn remove_watch(&self, fd: RawFd, direction: Direction) -> bool {
        let removed = self
            .core
            .reactor
            .borrow_mut()
            .remove_watch(WatchKey::new(fd, direction));
        removed.is_some()
    }

    pub fn has_watch(&self, fd: RawFd, direction: Direction) -> bool {
        self.core
            .reactor
            .borrow()
            .has_watch(WatchKey::new(fd, direction))
    }

    /// Number of live watches across all descriptors.
    pub fn watch_count(&self) -> usize {
        self.core.reactor.borrow().watch_count()
    }

    /// Number of spawned tasks that have not finished.
    pub fn live_tasks(&self) -> usize {
        self.core.tasks.borrow().live
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle").field("id", &self.core.id).finish()
    }
}

// =============================================================================
// HostLoop
// =============================================================================

/// A single-threaded host event loop.
///
/// Dropping the loop closes it: remaining tasks, watches and queued closures
/// are dropped, and [`RemoteHandle::call_soon_threadsafe`] starts failing.
pub struct HostLoop {
    handle: LoopHandle,
}

impl HostLoop {
    pub fn new() -> Result<Self> {
        Self::with_config(LoopConfig::default())
    }

    pub fn with_config(config: LoopConfig) -> Result<Self> {
        let core = Core::new(config)?;
        debug!(loop_id = %core.id, "host loop created");
        Ok(Self {
            handle: LoopHandle {
                core: Rc::new(core),
            },
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn remote(&self) -> RemoteHandle {
        self.handle.remote()
    }

    pub fn id(&self) -> LoopId {
        self.handle.id()
    }

    pub fn spawn_local<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.handle.spawn_local(future)
    }

    /// Run the loop until `future` completes.
    ///
    /// Other spawned tasks, watches, timers and scheduled closures make
    /// progress while `future` is pending.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let _enter = Enter::new(&self.handle);
        let core = &self.handle.core;

        let root = Arc::new(RootWaker {
            remote: Arc::clone(&core.remote),
            woken: AtomicBool::new(true),
        });
        let waker = Waker::from(Arc::clone(&root));
        let mut cx = Context::from_waker(&waker);
        let mut future = pin!(future);

        loop {
            if root.take() {
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    return output;
                }
            }

            if core.tick() || root.is_set() {
                continue;
            }

            core.park();
        }
    }
}

impl Drop for HostLoop {
    fn drop(&mut self) {
        self.handle.core.shutdown();
    }
}

impl fmt::Debug for HostLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostLoop").field("id", &self.id()).finish()
    }
}

// =============================================================================
// JoinHandle
// =============================================================================

struct JoinState<T> {
    output: Option<T>,
    waker: Option<Waker>,
    finished: bool,
}

impl<T> Default for JoinState<T> {
    fn default() -> Self {
        Self {
            output: None,
            waker: None,
            finished: false,
        }
    }
}

/// Handle to a task spawned with [`LoopHandle::spawn_local`].
///
/// - `await` → `Some(output)`, or `None` if the task was aborted
/// - `abort()` → drops the future
/// - `drop` (without await) → detaches; the task keeps running
pub struct JoinHandle<T> {
    join: Rc<RefCell<JoinState<T>>>,
    core: Rc<Core>,
    slot: u32,
    generation: u32,
}

impl<T> JoinHandle<T> {
    pub fn abort(&self) {
        let future = self
            .core
            .tasks
            .borrow_mut()
            .abort(self.slot, self.generation);
        drop(future);

        let waker = {
            let mut state = self.join.borrow_mut();
            if state.finished {
                return;
            }
            state.finished = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.borrow().finished
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let mut state = self.join.borrow_mut();
        if let Some(output) = state.output.take() {
            return Poll::Ready(Some(output));
        }
        if state.finished {
            return Poll::Ready(None);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn block_on_ready_future() {
        let host = HostLoop::new().unwrap();
        assert_eq!(host.block_on(async { 7 }), 7);
    }

    #[test]
    fn spawned_task_output_reaches_join_handle() {
        let host = HostLoop::new().unwrap();
        let handle = host.spawn_local(async { "done" });
        assert_eq!(host.block_on(handle), Some("done"));
        assert_eq!(host.handle().live_tasks(), 0);
    }

    #[test]
    fn abort_before_first_poll() {
        let host = HostLoop::new().unwrap();
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        let handle = host.spawn_local(async move { flag.set(true) });
        handle.abort();
        assert_eq!(host.block_on(handle), None);
        assert!(!ran.get());
    }

    #[test]
    fn call_soon_runs_in_fifo_order() {
        let host = HostLoop::new().unwrap();
        let handle = host.handle();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let order = Rc::clone(&order);
            handle.call_soon(move || order.borrow_mut().push(i));
        }
        host.block_on(crate::timer::sleep(Duration::from_millis(1)));
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn current_is_scoped_to_block_on() {
        let host = HostLoop::new().unwrap();
        assert!(LoopHandle::current().is_none());
        let id = host.block_on(async { LoopHandle::current().map(|h| h.id()) });
        assert_eq!(id, Some(host.id()));
        assert!(LoopHandle::current().is_none());
    }

    #[test]
    fn remote_fails_after_drop() {
        let host = HostLoop::new().unwrap();
        let remote = host.remote();
        drop(host);
        assert!(remote.is_closed());
        assert!(matches!(
            remote.call_soon_threadsafe(|| {}),
            Err(LoopError::Closed)
        ));
    }
}
