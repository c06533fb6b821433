// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Collecting exited children
//!
//! As the guest's init (or its child subreaper) the tether inherits every
//! orphaned process.  The [`Reaper`] waits for all of them, and routes the
//! exit status of the ones the tether started to whoever is interested:
//! session exits go to the tether's run loop, back-channel execs get their
//! status through a oneshot channel.  Anything else was adopted and is only
//! logged.

use crate::executor::ReapGuard;
use futures::{Stream, StreamExt};
use slog::{debug, info, warn, Logger};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// Who is waiting on a child
#[derive(Debug)]
pub enum Owner {
    Session(String),
    Exec(oneshot::Sender<i32>),
}

/// Children the tether started, by pid
///
/// Entries are inserted while holding the [`ReapGuard`] shared, so that the
/// reaper cannot collect a child before its entry exists.
pub type PidMap = Arc<Mutex<HashMap<u32, Owner>>>;

/// A session process that exited
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionExit {
    pub id: String,
    pub pid: u32,
    pub status: i32,
}

/// Source of exited children
pub trait ChildWaiter: Send + Sync {
    /// Collects one exited child without blocking, returning its pid and
    /// exit status.
    fn try_wait(&self) -> std::io::Result<Option<(u32, i32)>>;
}

/// `waitpid(-1, WNOHANG)`
pub struct HostWaiter;

impl ChildWaiter for HostWaiter {
    fn try_wait(&self) -> std::io::Result<Option<(u32, i32)>> {
        let mut status = 0;
        // SAFETY: waitpid only writes the status integer we pass.
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        match pid {
            0 => Ok(None),
            -1 => {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ECHILD) {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
            pid => {
                let code = if libc::WIFEXITED(status) {
                    libc::WEXITSTATUS(status)
                } else if libc::WIFSIGNALED(status) {
                    128 + libc::WTERMSIG(status)
                } else {
                    // stopped or continued
                    return self.try_wait();
                };
                Ok(Some((pid.unsigned_abs(), code)))
            }
        }
    }
}

/// Makes this process the reaper of its orphaned descendants.
pub fn become_subreaper() -> std::io::Result<()> {
    // SAFETY: PR_SET_CHILD_SUBREAPER takes a single integer argument.
    let rc = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// A [`ChildWaiter`] whose exits are queued by the test
#[derive(Default)]
pub struct FakeWaiter {
    exited: Mutex<VecDeque<(u32, i32)>>,
}

impl FakeWaiter {
    pub fn new() -> Arc<FakeWaiter> {
        Arc::new(FakeWaiter::default())
    }

    pub fn exit(&self, pid: u32, status: i32) {
        self.exited.lock().unwrap().push_back((pid, status));
    }
}

impl ChildWaiter for FakeWaiter {
    fn try_wait(&self) -> std::io::Result<Option<(u32, i32)>> {
        Ok(self.exited.lock().unwrap().pop_front())
    }
}

pub struct Reaper {
    log: Logger,
    waiter: Arc<dyn ChildWaiter>,
    pids: PidMap,
    reap_guard: ReapGuard,
    exits: mpsc::UnboundedSender<SessionExit>,
}

impl Reaper {
    pub(crate) fn new(
        log: Logger,
        waiter: Arc<dyn ChildWaiter>,
        pids: PidMap,
        reap_guard: ReapGuard,
        exits: mpsc::UnboundedSender<SessionExit>,
    ) -> Self {
        Reaper { log, waiter, pids, reap_guard, exits }
    }

    /// Collects every child that has exited so far.
    pub async fn reap(&self) {
        let _exclusive = self.reap_guard.write().await;
        loop {
            let (pid, status) = match self.waiter.try_wait() {
                Ok(Some(exited)) => exited,
                Ok(None) => break,
                Err(err) => {
                    warn!(self.log, "wait failed"; "error" => %err);
                    break;
                }
            };
            let owner = self.pids.lock().unwrap().remove(&pid);
            match owner {
                Some(Owner::Session(id)) => {
                    info!(self.log, "session exited";
                        "session" => &id, "pid" => pid, "status" => status);
                    let exit = SessionExit { id, pid, status };
                    if self.exits.send(exit).is_err() {
                        debug!(self.log, "tether gone; dropping exit");
                    }
                }
                Some(Owner::Exec(tx)) => {
                    debug!(self.log, "exec exited";
                        "pid" => pid, "status" => status);
                    let _ = tx.send(status);
                }
                None => {
                    info!(self.log, "reaped adopted zombie";
                        "pid" => pid, "status" => status);
                }
            }
        }
    }

    /// Reaps on every item of `ticks`, normally a SIGCHLD stream.
    pub async fn run<S>(self, mut ticks: S)
    where
        S: Stream + Unpin,
    {
        // Children may have exited before the stream was set up.
        self.reap().await;
        while ticks.next().await.is_some() {
            self.reap().await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use vch_test_utils::dev::test_setup_log;

    #[tokio::test]
    async fn routes_exits() {
        let logctx = test_setup_log("routes_exits");
        let waiter = FakeWaiter::new();
        let pids = PidMap::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reaper = Reaper::new(
            logctx.log.clone(),
            waiter.clone(),
            Arc::clone(&pids),
            ReapGuard::default(),
            tx,
        );

        let (exec_tx, exec_rx) = oneshot::channel();
        pids.lock().unwrap().insert(10, Owner::Session("web".to_string()));
        pids.lock().unwrap().insert(11, Owner::Exec(exec_tx));
        waiter.exit(10, 3);
        waiter.exit(11, 0);
        waiter.exit(99, 1);
        reaper.reap().await;

        assert_eq!(
            rx.recv().await,
            Some(SessionExit { id: "web".to_string(), pid: 10, status: 3 })
        );
        assert_eq!(exec_rx.await, Ok(0));
        assert!(pids.lock().unwrap().is_empty());

        // A pid is reported at most once.
        waiter.exit(10, 3);
        reaper.reap().await;
        assert!(rx.try_recv().is_err());
        logctx.cleanup_successful();
    }
}
