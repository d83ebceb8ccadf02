use std::io;
use std::os::fd::RawFd;

use crate::reactor::Direction;

pub type Result<T> = std::result::Result<T, LoopError>;

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A watch for the same (descriptor, direction) pair is still live.
    #[error("descriptor {fd} already has a live {direction} watch")]
    DuplicateWatch { fd: RawFd, direction: Direction },

    #[error("host loop is closed")]
    Closed,
}
