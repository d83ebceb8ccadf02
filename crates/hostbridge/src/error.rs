use std::os::fd::RawFd;

use hostbridge_loop::{Direction, LoopError, WatchKey};

use crate::task::TaskId;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Bridge-level faults.
///
/// Failures of the engine's own work never appear here: they travel through
/// [`Resolver::resolve`](crate::Resolver::resolve) as part of the value.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("task {task} resolved twice")]
    DoubleResolve { task: TaskId },

    #[error("descriptor {fd} already has an outstanding {direction} registration")]
    DuplicateRegistration { fd: RawFd, direction: Direction },

    #[error("task {task} is already waiting on {key}")]
    TaskAlreadyWaiting { task: TaskId, key: WatchKey },

    #[error("completion polled after it produced its output")]
    AlreadyConsumed,

    #[error("batched call {call} suspended; batched operations must finish without waiting")]
    BatchSuspended { call: u64 },

    #[error("batch needs at least one call")]
    EmptyBatch,

    #[error("no host loop is running on this thread")]
    NoLoop,

    #[error("host loop closed before the task completed")]
    LoopClosed,

    #[error("host loop error: {0}")]
    Loop(#[source] LoopError),
}

impl BridgeError {
    /// True for faults that mean the engine or caller broke the bridge
    /// contract, as opposed to a loop that went away underneath a task.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            BridgeError::DoubleResolve { .. }
                | BridgeError::DuplicateRegistration { .. }
                | BridgeError::TaskAlreadyWaiting { .. }
                | BridgeError::AlreadyConsumed
                | BridgeError::BatchSuspended { .. }
        )
    }
}

impl From<LoopError> for BridgeError {
    fn from(error: LoopError) -> Self {
        match error {
            LoopError::DuplicateWatch { fd, direction } => {
                BridgeError::DuplicateRegistration { fd, direction }
            }
            LoopError::Closed => BridgeError::LoopClosed,
            other => BridgeError::Loop(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn loop_errors_map_onto_bridge_faults() {
        let dup = BridgeError::from(LoopError::DuplicateWatch {
            fd: 4,
            direction: Direction::Write,
        });
        assert!(matches!(
            dup,
            BridgeError::DuplicateRegistration { fd: 4, direction: Direction::Write }
        ));
        assert!(dup.is_protocol_violation());

        assert!(matches!(BridgeError::from(LoopError::Closed), BridgeError::LoopClosed));

        let io = BridgeError::from(LoopError::Io(io::Error::other("boom")));
        assert!(matches!(io, BridgeError::Loop(LoopError::Io(_))));
        assert!(!io.is_protocol_violation());
    }

    #[test]
    fn messages() {
        let err = BridgeError::BatchSuspended { call: 3 };
        assert_eq!(
            err.to_string(),
            "batched call 3 suspended; batched operations must finish without waiting"
        );
        assert!(!BridgeError::NoLoop.is_protocol_violation());
        assert!(!BridgeError::EmptyBatch.is_protocol_violation());
    }
}
