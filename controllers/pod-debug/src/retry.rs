//! Optimistic-concurrency retry.
//!
//! [`retry_on_conflict`] runs a read-modify-write operation and, when the write
//! is rejected because the object changed underneath it, runs the whole
//! operation again after a short delay. The operation must re-read the object
//! itself on every attempt.

use crate::backoff::ConflictBackoff;
use crate::error::ControllerError;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Runs `op` until it succeeds, fails with a non-conflict error, runs out of
/// attempts, or `cancel` fires.
///
/// - conflict on the last attempt: [`ControllerError::RetryExhausted`]
/// - any other error: returned as is, without retrying
/// - cancellation before an attempt or during a backoff sleep: [`ControllerError::Cancelled`]
pub async fn retry_on_conflict<T, F, Fut>(
    backoff: &ConflictBackoff,
    cancel: &CancellationToken,
    operation: &str,
    mut op: F,
) -> Result<T, ControllerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ControllerError>>,
{
    let steps = backoff.steps.max(1);
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(ControllerError::Cancelled(format!(
                "{operation} abandoned before attempt {}",
                attempt + 1
            )));
        }
        attempt += 1;

        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_conflict() => error,
            Err(error) => return Err(error),
        };

        if attempt >= steps {
            return Err(ControllerError::RetryExhausted {
                attempts: attempt,
                last: Box::new(error),
            });
        }

        let delay = backoff.delay_after(attempt);
        debug!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Write conflict, retrying with a fresh read"
        );

        tokio::select! {
            () = cancel.cancelled() => {
                return Err(ControllerError::Cancelled(format!(
                    "{operation} abandoned after {attempt} conflicting attempts"
                )));
            }
            () = tokio::time::sleep(delay) => {}
        }
    }
}
