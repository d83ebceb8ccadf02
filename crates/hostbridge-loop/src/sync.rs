//! Synchronization primitives abstraction for loom testing.
//!
//! When compiled with `--cfg loom`, this module uses loom's types which allow
//! deterministic concurrency testing. Otherwise, it uses std types.

#[cfg(loom)]
pub use loom::sync::atomic::{AtomicBool, Ordering};

#[cfg(not(loom))]
pub use std::sync::atomic::{AtomicBool, Ordering};

// =============================================================================
// RemoteQueue - lock-free multi-producer queue feeding the loop thread
// =============================================================================
//
// Under loom, we use a Mutex<VecDeque> since loom doesn't provide SegQueue.
// We test our *usage* of the queue, not crossbeam-queue itself.

#[cfg(not(loom))]
mod queue {
    use crossbeam_queue::SegQueue;

    pub struct RemoteQueue<T>(SegQueue<T>);

    impl<T> RemoteQueue<T> {
        pub const fn new() -> Self {
            Self(SegQueue::new())
        }

        pub fn push(&self, value: T) {
            self.0.push(value);
        }

        pub fn pop(&self) -> Option<T> {
            self.0.pop()
        }
    }

    impl<T> Default for RemoteQueue<T> {
        fn default() -> Self {
            Self::new()
        }
    }
}

#[cfg(loom)]
mod queue {
    use loom::sync::Mutex;
    use std::collections::VecDeque;

    pub struct RemoteQueue<T>(Mutex<VecDeque<T>>);

    impl<T> RemoteQueue<T> {
        pub fn new() -> Self {
            Self(Mutex::new(VecDeque::new()))
        }

        pub fn push(&self, value: T) {
            self.0.lock().unwrap().push_back(value);
        }

        pub fn pop(&self) -> Option<T> {
            self.0.lock().unwrap().pop_front()
        }
    }

    impl<T> Default for RemoteQueue<T> {
        fn default() -> Self {
            Self::new()
        }
    }
}

pub use queue::RemoteQueue;
