// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operation deadline and cancellation
//!
//! Every operator-facing operation carries a [`Context`] whose deadline is
//! the operation timeout.  It is threaded through each hypervisor call and
//! retry loop so that work bails out at the next decision point once the
//! deadline passes or the caller cancels.

use crate::Error;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default bound on an operator-facing operation
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3 * 60);

#[derive(Clone, Debug)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Context { cancel: CancellationToken::new(), deadline: None }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Context {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// A child that is cancelled with `self` and whose deadline is the
    /// earlier of the parent's and `timeout` from now.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Context {
            cancel: self.cancel.child_token(),
            deadline: Some(match self.deadline {
                Some(parent) if parent < deadline => parent,
                _ => deadline,
            }),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Why this context is done, if it is.
    pub fn err(&self) -> Option<Error> {
        if self.cancel.is_cancelled() {
            return Some(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Some(Error::DeadlineExceeded)
            }
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> Error {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => Error::Cancelled,
                _ = tokio::time::sleep_until(deadline) => {
                    Error::DeadlineExceeded
                }
            },
            None => {
                self.cancel.cancelled().await;
                Error::Cancelled
            }
        }
    }

    /// Sleeps for `duration` unless the context finishes first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Error> {
        tokio::select! {
            err = self.done() => Err(err),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Runs `fut` to completion unless the context finishes first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            err = self.done() => Err(err),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_interrupts_sleep() {
        let ctx = Context::with_timeout(Duration::from_secs(1));
        let err = ctx.sleep(Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
        assert!(ctx.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn child_inherits_earlier_deadline_and_cancellation() {
        let parent = Context::with_timeout(Duration::from_secs(5));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());

        parent.cancel();
        assert!(matches!(child.err(), Some(Error::Cancelled)));
    }

    #[tokio::test]
    async fn background_never_finishes() {
        let ctx = Context::background();
        assert!(ctx.sleep(Duration::from_millis(1)).await.is_ok());
        assert!(ctx.err().is_none());
    }
}
