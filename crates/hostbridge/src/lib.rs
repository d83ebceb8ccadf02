//! Bridge between a single-threaded host loop and a foreign engine that runs
//! work on its own threads.
//!
//! ```text
//!  Launcher::launch(entry) ──► Completion<T>        (host loop thread)
//!        │
//!        └─ entry.start(Resolver<T>, Registrar(read), Registrar(write))
//!                 │                     │
//!                 │ resolve(v)          │ register(fd, on_ready)
//!                 ▼                     ▼
//!        call_soon_threadsafe      host watch, removed before on_ready runs
//! ```
//!
//! - [`Resolver`]: exactly one `resolve` per task, from any thread. A second
//!   one panics; one after cancellation is ignored.
//! - [`Registrar`]: one outstanding readiness wait per task, at most one
//!   watch per `(fd, direction)`.
//! - [`Completion`]: awaits the value; dropping it cancels the task and
//!   removes any watch it still holds.
//! - [`batch`]: runs many calls that never wait, without a slot per call.
//!
//! There is no global engine or loop: a [`Launcher`] is built from an
//! explicit [`hostbridge_loop::LoopHandle`].

mod batch;
mod error;
mod registrar;
mod slot;
mod sync;
mod task;

pub use batch::batch;
pub use error::{BridgeError, Result};
pub use registrar::{ReadyEvent, Registrar};
#[doc(hidden)]
pub use slot::{Claim, ClaimCell, ClaimState};
pub use slot::{Completion, Resolver};
pub use task::{EntryPoint, Launcher, TaskId, TaskState};
