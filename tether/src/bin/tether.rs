// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable that runs as init inside appliance and container VMs

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use futures::StreamExt;
use signal_hook::consts::signal::{SIGCHLD, SIGHUP, SIGUSR2};
use signal_hook_tokio::Signals;
use slog::{error, info, o};
use std::sync::Arc;
use vch_tether::config::ConfigFile;
use vch_tether::executor::{HostExecutor, ReapGuard};
use vch_tether::guestinfo::RpcTool;
use vch_tether::ops::HostOperations;
use vch_tether::reaper::{become_subreaper, HostWaiter};
use vch_tether::Tether;

#[derive(Parser, Debug)]
struct Args {
    /// Defaults apply when no file is given
    #[clap(long, action)]
    config_file: Option<Utf8PathBuf>,

    /// Overrides `tether.debug_level` from the config file
    #[clap(long, action)]
    debug_level: Option<u8>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let mut config = match &args.config_file {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("loading {path}"))?,
        None => ConfigFile::default(),
    };
    if let Some(level) = args.debug_level {
        config.tether.debug_level = Some(level);
    }

    let log = config
        .log
        .to_logger("tether")
        .context("failed to create logger")?;
    info!(&log, "config"; "tether_config" => ?config.tether);

    if let Err(err) = become_subreaper() {
        // Running as pid 1 makes this unnecessary.
        info!(&log, "not a child subreaper"; "error" => %err);
    }

    let signals = Signals::new([SIGCHLD, SIGHUP, SIGUSR2])
        .context("failed to register signal handlers")?;

    let reap_guard = ReapGuard::default();
    let guest_info = Arc::new(RpcTool::new(
        log.new(o!("component" => "guestinfo")),
        config.tether.rpctool.clone(),
        Arc::clone(&reap_guard),
    ));
    let executor = HostExecutor::new(
        log.new(o!("component" => "executor")),
        Arc::clone(&reap_guard),
    )
    .as_executor();
    let ops = Arc::new(HostOperations::new(
        log.new(o!("component" => "ops")),
        executor,
        config.tether.session_log_dir.clone(),
        config.tether.serial_log.clone(),
    ));
    let tether = Tether::new(
        log.new(o!("component" => "tether")),
        config.tether.clone(),
        guest_info,
        ops,
        reap_guard,
    );

    let (child_tx, child_rx) = futures::channel::mpsc::unbounded();
    tokio::spawn(tether.reaper(Arc::new(HostWaiter)).run(child_rx));

    let signal_task = {
        let tether = Arc::clone(&tether);
        let log = log.clone();
        let mut signals = signals.fuse();
        tokio::spawn(async move {
            while let Some(signal) = signals.next().await {
                match signal {
                    SIGCHLD => {
                        let _ = child_tx.unbounded_send(());
                    }
                    SIGHUP => {
                        info!(&log, "reload requested");
                        tether.request_reload();
                    }
                    SIGUSR2 => {
                        info!(&log, "stop requested");
                        tether.stop();
                    }
                    _ => (),
                }
            }
        })
    };

    if let Some(device) = config.tether.backchannel.clone() {
        tokio::spawn(vch_tether::backchannel::serve(
            log.clone(),
            device,
            Arc::clone(&tether),
        ));
    }

    let result = tether.run().await;
    signal_task.abort();
    if let Err(err) = &result {
        error!(&log, "tether failed"; "error" => %err);
    }
    result.context("running tether")
}
