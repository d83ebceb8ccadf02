//! Host event loop: a single-threaded cooperative executor that owns one
//! I/O multiplexer.
//!
//! - **Tasks**: [`HostLoop::block_on`], [`LoopHandle::spawn_local`], [`JoinHandle`]
//! - **Scheduling**: [`LoopHandle::call_soon`] on the loop thread,
//!   [`RemoteHandle::call_soon_threadsafe`] from anywhere
//! - **Readiness**: [`LoopHandle::add_watch`] / [`LoopHandle::remove_watch`],
//!   one-shot watches keyed by `(fd, direction)`
//! - **Timers**: [`sleep`], [`timeout`]
//!
//! Nothing here is global: every piece of state belongs to one [`HostLoop`],
//! so independent loops can run side by side on different threads.

mod config;
mod error;
mod executor;
mod reactor;
pub mod sync;
mod timer;

pub use config::LoopConfig;
pub use error::{LoopError, Result};
pub use executor::{HostLoop, JoinHandle, LoopHandle, LoopId, RemoteHandle};
pub use reactor::{Direction, WatchKey};
pub use timer::{sleep, timeout, Elapsed, Sleep, Timeout};
