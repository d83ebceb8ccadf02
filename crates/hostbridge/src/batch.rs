//! Batch fast path: many short calls under one boundary crossing.

use std::future::Future;
use std::pin::pin;
use std::task::{Context, Poll, Waker};

use tracing::{trace, warn};

use crate::error::{BridgeError, Result};

/// Run `op(0)`, `op(1)`, ... `op(count - 1)` back to back and return the last
/// result.
///
/// Each call's future is polled exactly once. Completion slots, registrars
/// and the host loop are not involved, so `op` must finish without waiting
/// on a timer or a descriptor. A future that returns `Pending` stops the
/// batch with [`BridgeError::BatchSuspended`].
pub fn batch<T, F, Fut>(mut op: F, count: u64) -> Result<T>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = T>,
{
    if count == 0 {
        return Err(BridgeError::EmptyBatch);
    }

    let mut cx = Context::from_waker(Waker::noop());
    let mut last = None;
    for call in 0..count {
        let mut future = pin!(op(call));
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(value) => last = Some(value),
            Poll::Pending => {
                warn!(call, count, "batched operation suspended");
                return Err(BridgeError::BatchSuspended { call });
            }
        }
    }

    trace!(count, "batch complete");
    last.ok_or(BridgeError::EmptyBatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    async fn no_op(i: u64) -> u64 {
        i
    }

    #[test]
    fn returns_last_result() {
        assert_eq!(batch(no_op, 1).unwrap(), 0);
        assert_eq!(batch(no_op, 1_000).unwrap(), 999);
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert!(matches!(batch(no_op, 0), Err(BridgeError::EmptyBatch)));
    }

    #[test]
    fn suspension_stops_the_batch() {
        let calls = Cell::new(0u64);
        let result = batch(
            |i| {
                calls.set(calls.get() + 1);
                async move {
                    if i == 3 {
                        std::future::pending::<()>().await;
                    }
                    i
                }
            },
            10,
        );
        let err = result.unwrap_err();
        assert!(matches!(err, BridgeError::BatchSuspended { call: 3 }));
        assert!(err.is_protocol_violation());
        assert_eq!(calls.get(), 4);
    }
}
