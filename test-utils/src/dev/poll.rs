// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Polling for a condition in tests
//!
//! [`wait_for_condition`] repeatedly invokes an async check until it
//! reports success, reports a permanent failure, or a time bound passes.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Result of one check of the condition
#[derive(Debug, thiserror::Error)]
pub enum CondCheckError<E> {
    /// the condition does not yet hold
    #[error("poll condition not yet ready")]
    NotYet,
    /// the condition failed in a way that polling will not fix
    #[error("non-retryable error while polling on condition")]
    Failed(#[from] E),
}

#[derive(Debug, thiserror::Error)]
pub enum Error<E> {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("non-retryable error while polling on condition")]
    PermanentError(E),
}

/// Waits for `cond` to succeed, checking every `poll_interval` for at most
/// `poll_max`.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let poll_start = Instant::now();
    loop {
        let duration = Instant::now().duration_since(poll_start);
        if duration > *poll_max {
            return Err(Error::TimedOut(duration));
        }

        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::NotYet) => (),
            Err(CondCheckError::Failed(e)) => {
                return Err(Error::PermanentError(e))
            }
        }

        tokio::time::sleep(*poll_interval).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_ready() {
        let calls = AtomicUsize::new(0);
        let calls = &calls;
        let n = wait_for_condition::<_, (), _, _>(
            || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    n if n < 3 => Err(CondCheckError::NotYet),
                    n => Ok(n),
                }
            },
            &Duration::from_millis(10),
            &Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(n, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out() {
        let err = wait_for_condition::<(), (), _, _>(
            || async { Err(CondCheckError::NotYet) },
            &Duration::from_millis(10),
            &Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::TimedOut(_)));
    }
}
