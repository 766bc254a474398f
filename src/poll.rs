//! Bounded polling for asynchronous upstream jobs (media processing).

use std::future::Future;
use std::time::Duration;

use crate::error::{ErrorCode, ErrorInfo};

/// Outcome of one status check.
#[derive(Debug, Clone, PartialEq)]
pub enum PollResult<T> {
    /// Not finished yet; check again.
    Pending,
    /// Finished with a value.
    Done(T),
    /// Finished unsuccessfully.
    Failed(ErrorInfo),
}

/// Call `check` until it reports a terminal state or `max_attempts` checks
/// have run, sleeping `interval` between checks.
///
/// Running out of attempts is a terminal [`ErrorCode::RequestFailed`].
pub async fn poll_until<T, F, Fut>(
    mut check: F,
    interval: Duration,
    max_attempts: u32,
) -> Result<T, ErrorInfo>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollResult<T>>,
{
    for attempt in 1..=max_attempts {
        match check().await {
            PollResult::Done(value) => return Ok(value),
            PollResult::Failed(reason) => return Err(reason),
            PollResult::Pending => {
                tracing::debug!(attempt, max_attempts, "Still pending");
                if attempt < max_attempts {
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    Err(ErrorInfo::new(
        ErrorCode::RequestFailed,
        format!("still pending after {} attempts", max_attempts),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn returns_value_once_done() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = poll_until(
            move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    PollResult::Pending
                } else {
                    PollResult::Done("FINISHED")
                }
            },
            Duration::from_millis(1),
            5,
        )
        .await;

        assert_eq!(result, Ok("FINISHED"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failure_stops_polling() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = poll_until(
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                PollResult::Failed(ErrorInfo::new(ErrorCode::ApiError, "ERROR"))
            },
            Duration::from_millis(1),
            5,
        )
        .await;

        assert_eq!(result.unwrap_err().code, ErrorCode::ApiError);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_attempts_never_checks() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = tokio_test::block_on(poll_until(
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                PollResult::Pending
            },
            Duration::from_secs(60),
            0,
        ));

        assert_eq!(result.unwrap_err().code, ErrorCode::RequestFailed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn attempt_ceiling_is_terminal() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = poll_until(
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                PollResult::Pending
            },
            Duration::ZERO,
            3,
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.code, ErrorCode::RequestFailed);
        assert!(err.message.contains("3 attempts"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
