// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Retrying operations that fail with `SystemError`
//!
//! Removing a snapshot from a vSAN datastore commonly fails with a
//! `SystemError` while the object store settles.  The fault can arrive in
//! any of the three envelopes.

use crate::context::Context;
use crate::fault::FaultKind;
use crate::Error;
use slog::{warn, Logger};
use std::future::Future;
use std::time::Duration;
use vch_common::backoff::{
    retry_notify, retry_policy_system_error, BackoffError,
};

pub fn is_system_error(err: &Error) -> bool {
    err.is_fault(&FaultKind::SystemError)
}

/// Runs `op`, retrying with backoff for as long as it fails with a
/// `SystemError` and both the policy and `ctx` allow.
pub async fn retry_on_system_error<T, F, Fut>(
    ctx: &Context,
    log: &Logger,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let attempt = move || {
        let fut = ctx.run(op());
        async move {
            fut.await.map_err(|err| {
                if is_system_error(&err) {
                    BackoffError::transient(err)
                } else {
                    BackoffError::permanent(err)
                }
            })
        }
    };
    let notify = |err: Error, delay: Duration| {
        warn!(
            log,
            "operation failed with a system error, retrying";
            "error" => %err,
            "delay" => ?delay,
        );
    };
    retry_notify(retry_policy_system_error(), attempt, notify).await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fault::Fault;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vch_test_utils::dev::test_setup_log;

    #[test]
    fn every_envelope_is_recognized() {
        for fault in [
            Fault::soap(FaultKind::SystemError, "soap"),
            Fault::vim(FaultKind::SystemError, "vim"),
            Fault::task(FaultKind::SystemError, "task"),
        ] {
            let err = Error::from(fault).context("remove snapshot");
            assert!(is_system_error(&err));
        }
        assert!(!is_system_error(&Error::from(Fault::task(
            FaultKind::InvalidState,
            "orphaned"
        ))));
    }

    #[tokio::test(start_paused = true)]
    async fn system_errors_are_retried() {
        let logctx = test_setup_log("system_errors_are_retried");
        let ctx = Context::background();
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        retry_on_system_error(&ctx, &logctx.log, || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::from(Fault::task(FaultKind::SystemError, "vsan")))
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_are_permanent() {
        let logctx = test_setup_log("other_errors_are_permanent");
        let ctx = Context::background();
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        let err = retry_on_system_error(&ctx, &logctx.log, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::from(Fault::task(
                FaultKind::ResourceInUse,
                "locked",
            )))
        })
        .await
        .unwrap_err();

        assert!(err.is_fault(&FaultKind::ResourceInUse));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        logctx.cleanup_successful();
    }
}
