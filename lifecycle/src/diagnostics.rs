// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hypervisor logs around a failed operation
//!
//! Before an operation starts, the dispatcher notes where the management
//! server's log and each candidate host's log currently end.  If the
//! operation fails, everything written after that point is collected so
//! that the failure can be diagnosed without access to the hypervisor.

use crate::dispatcher::Dispatcher;
use slog::{debug, info, warn};
use vch_common::config::VchConfigSpec;
use vch_common::MoRef;

const VPXD_LOG_KEY: &str = "vpxd:vpxd.log";
const HOSTD_LOG_KEY: &str = "hostd";

/// Collection is retried this many times to pick up lines written while
/// the first batch was being read.
const COLLECT_PASSES: usize = 2;

#[derive(Clone, Debug)]
pub(crate) struct DiagnosticLog {
    pub key: String,
    /// Name of the file the collected lines are written to
    pub file: String,
    pub host: Option<MoRef>,
    /// First line that belongs to this operation
    pub start: i32,
    pub collect: bool,
}

impl Dispatcher {
    /// Records the current end of each log that could explain a failure of
    /// an operation on `spec`.
    pub(crate) async fn init_diagnostic_logs(&mut self, spec: &VchConfigSpec) {
        self.diagnostic_logs.clear();
        if self.hv.is_vc() {
            let about = self.hv.about();
            self.diagnostic_logs.insert(
                about.instance_uuid,
                DiagnosticLog {
                    key: VPXD_LOG_KEY.to_string(),
                    file: "vpxd.log".to_string(),
                    host: None,
                    start: 0,
                    collect: true,
                },
            );
        }

        let hosts = match spec.compute_resources.first() {
            Some(compute) => self.ctx.run(self.hv.hosts(compute)).await,
            None => Ok(Vec::new()),
        };
        match hosts {
            Ok(hosts) => {
                for host in hosts {
                    self.diagnostic_logs.insert(
                        host.value.clone(),
                        DiagnosticLog {
                            key: HOSTD_LOG_KEY.to_string(),
                            file: format!("hostd-{}.log", host.value),
                            host: Some(host),
                            start: 0,
                            collect: true,
                        },
                    );
                }
            }
            Err(err) => {
                warn!(self.log, "unable to list hosts for log collection";
                    "error" => %err);
            }
        }

        for (name, log) in self.diagnostic_logs.iter_mut() {
            // A start past the end yields only the header.
            let browse =
                self.hv.browse_log(log.host.as_ref(), &log.key, i32::MAX, 0);
            let header = self.ctx.run(browse).await;
            match header {
                Ok(header) => {
                    log.start = header.line_end;
                    debug!(self.log, "watching log";
                        "log" => name, "key" => &log.key, "start" => log.start);
                }
                Err(err) => {
                    warn!(self.log, "unable to read log, not collecting it";
                        "log" => name, "key" => &log.key, "error" => %err);
                    log.collect = false;
                }
            }
        }
    }

    /// Fetches everything written to the watched logs since
    /// [`Dispatcher::init_diagnostic_logs`].  Failures are only logged.
    pub(crate) async fn collect_diagnostic_logs(&self) {
        let ctx = self.cleanup_ctx();
        for (name, log) in &self.diagnostic_logs {
            if !log.collect {
                continue;
            }
            info!(self.log, "collecting log"; "log" => name, "key" => &log.key);

            let mut lines = Vec::new();
            let mut start = log.start;
            for _ in 0..COLLECT_PASSES {
                let browse =
                    self.hv.browse_log(log.host.as_ref(), &log.key, start, 0);
                let header = ctx.run(browse).await;
                match header {
                    Ok(header) if header.line_end < start => {
                        debug!(self.log, "log rolled over"; "log" => name);
                        start = 0;
                    }
                    Ok(header) => {
                        let done = header.line_end <= start;
                        start = header.line_end;
                        lines.extend(header.lines);
                        if done {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(self.log, "failed to collect log";
                            "log" => name, "key" => &log.key, "error" => %err);
                        break;
                    }
                }
            }

            let Some(dir) = &self.diagnostics_dir else {
                for line in &lines {
                    debug!(self.log, "{}", line; "log" => name);
                }
                continue;
            };
            let path = dir.join(&log.file);
            let contents: String =
                lines.iter().map(|line| format!("{line}\n")).collect();
            match tokio::fs::write(&path, contents).await {
                Ok(()) => info!(self.log, "wrote log";
                    "path" => %path, "lines" => lines.len()),
                Err(err) => warn!(self.log, "failed to write log";
                    "path" => %path, "error" => %err),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use vch_test_utils::dev::test_setup_log;
    use vsphere_utils::fakes::FakeHypervisor;
    use vsphere_utils::Context;

    #[tokio::test]
    async fn collects_only_new_lines() {
        let logctx = test_setup_log("collects_only_new_lines");
        let dir = camino_tempfile::tempdir().unwrap();
        let hv = Arc::new(FakeHypervisor::vcenter());
        hv.set_log(VPXD_LOG_KEY, vec!["old vpxd".to_string()]);
        hv.set_log(HOSTD_LOG_KEY, vec!["old hostd".to_string()]);

        let mut dispatcher = Dispatcher::new(
            hv.clone(),
            &logctx.log,
            false,
            Context::background(),
        )
        .with_diagnostics_dir(dir.path());
        let spec = VchConfigSpec {
            compute_resources: vec![hv.root_pool()],
            ..Default::default()
        };
        dispatcher.init_diagnostic_logs(&spec).await;
        assert_eq!(dispatcher.diagnostic_logs.len(), 2);

        hv.append_log(VPXD_LOG_KEY, &["task failed"]);
        dispatcher.collect_diagnostic_logs().await;

        let vpxd =
            std::fs::read_to_string(dir.path().join("vpxd.log")).unwrap();
        assert_eq!(vpxd, "task failed\n");
        let hostd = dir
            .path()
            .join(format!("hostd-{}.log", hv.host().value));
        assert_eq!(std::fs::read_to_string(hostd).unwrap(), "");
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn unreadable_log_is_skipped() {
        let logctx = test_setup_log("unreadable_log_is_skipped");
        let hv = Arc::new(FakeHypervisor::esx());
        let mut dispatcher = Dispatcher::new(
            hv.clone(),
            &logctx.log,
            false,
            Context::background(),
        );
        let spec = VchConfigSpec {
            compute_resources: vec![hv.root_pool()],
            ..Default::default()
        };
        dispatcher.init_diagnostic_logs(&spec).await;
        assert!(dispatcher.diagnostic_logs.values().all(|l| !l.collect));
        dispatcher.collect_diagnostic_logs().await;
        logctx.cleanup_successful();
    }
}
