// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Waiting on hypervisor tasks
//!
//! The management API rejects or fails some calls for reasons that clear up
//! on their own: another task holds the object, a host network change was
//! rolled back, or a freshly created object is not yet visible to the call.
//! [`wait_for_result`] resubmits the operation with exponential backoff until
//! it succeeds, fails with any other fault, or the [`Context`] finishes.

use crate::context::Context;
use crate::fault::FaultKind;
use crate::Error;
use rand::Rng;
use slog::{debug, Logger};
use std::future::Future;
use std::time::Duration;
use vch_common::backoff::{Backoff, ExponentialBackoff};

const MIN_START_MS: u64 = 50;
const MAX_START_MS: u64 = 150;
const MAX_GROWTH: u32 = 16;

/// Whether the fault behind `err` is worth resubmitting the task for.
pub fn is_retryable(err: &Error) -> bool {
    err.is_fault(&FaultKind::TaskInProgress)
        || err.is_fault(&FaultKind::NetworkDisruptedAndConfigRolledBack)
        || err.is_fault(&FaultKind::InvalidArgument)
}

fn task_backoff() -> ExponentialBackoff {
    let start = Duration::from_millis(
        rand::thread_rng().gen_range(MIN_START_MS..=MAX_START_MS),
    );
    let mut policy = ExponentialBackoff {
        current_interval: start,
        initial_interval: start,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: start * MAX_GROWTH,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    };
    policy.reset();
    policy
}

/// Runs `op` until it produces a result, retrying transient task faults.
pub async fn wait_for_result<T, F, Fut>(
    ctx: &Context,
    log: &Logger,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut policy = task_backoff();
    loop {
        let err = match ctx.run(op()).await {
            Ok(result) => return Ok(result),
            Err(err) => err,
        };
        if !is_retryable(&err) {
            return Err(err);
        }

        // `max_elapsed_time` is unset, so the policy never runs dry.
        let delay = policy.next_backoff().unwrap_or(policy.max_interval);
        debug!(
            log,
            "retrying task after transient fault";
            "error" => %err,
            "delay" => ?delay,
        );
        ctx.sleep(delay).await?;
    }
}

/// As [`wait_for_result`], discarding the task result.
pub async fn wait<T, F, Fut>(
    ctx: &Context,
    log: &Logger,
    op: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    wait_for_result(ctx, log, op).await.map(|_| ())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fault::Fault;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vch_test_utils::dev::test_setup_log;

    #[tokio::test(start_paused = true)]
    async fn transient_faults_are_retried() {
        let logctx = test_setup_log("transient_faults_are_retried");
        let ctx = Context::background();
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        let result = wait_for_result(&ctx, &logctx.log, || async move {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err(Fault::task(FaultKind::TaskInProgress, "busy").into()),
                1 => Err(Fault::soap(
                    FaultKind::NetworkDisruptedAndConfigRolledBack,
                    "rolled back",
                )
                .into()),
                2 => Err(Fault::vim(FaultKind::InvalidArgument, "spec").into()),
                n => Ok(n),
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 3);
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn other_faults_return_immediately() {
        let logctx = test_setup_log("other_faults_return_immediately");
        let ctx = Context::background();
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        let err = wait(&ctx, &logctx.log, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::from(Fault::task(
                FaultKind::DuplicateName,
                "vch1 exists",
            )))
        })
        .await
        .unwrap_err();

        assert!(err.is_fault(&FaultKind::DuplicateName));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_ends_a_persistent_fault() {
        let logctx = test_setup_log("deadline_ends_a_persistent_fault");
        let ctx = Context::with_timeout(Duration::from_secs(10));

        let err = wait(&ctx, &logctx.log, || async {
            Err::<(), _>(Error::from(Fault::task(
                FaultKind::TaskInProgress,
                "busy",
            )))
        })
        .await
        .unwrap_err();

        assert!(err.is_deadline_exceeded());
        logctx.cleanup_successful();
    }

    #[test]
    fn backoff_is_capped_at_sixteen_times_the_start() {
        let close = |a: Duration, b: Duration| {
            a.abs_diff(b) < Duration::from_micros(10)
        };
        let mut policy = task_backoff();
        let start = policy.initial_interval;
        assert!(start >= Duration::from_millis(MIN_START_MS));
        assert!(start <= Duration::from_millis(MAX_START_MS));
        let waits: Vec<_> =
            (0..10).filter_map(|_| policy.next_backoff()).collect();
        assert_eq!(waits.len(), 10);
        assert!(close(waits[0], start));
        assert!(close(waits[1], start * 2));
        assert!(close(*waits.last().unwrap(), start * MAX_GROWTH));
    }
}
