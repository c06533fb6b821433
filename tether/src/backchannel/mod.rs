// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control channel between the appliance and the tether
//!
//! A serial port is synchronized with the [`handshake`], after which the
//! tether runs an SSH server over it.  When the client goes away the port is
//! reopened and the cycle starts again.

pub mod handshake;
pub mod requests;
pub mod ssh;

use crate::tether::Tether;
use camino::{Utf8Path, Utf8PathBuf};
use slog::{info, o, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;

/// Pause between back-channel sessions
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum BackchannelError {
    #[error("failed to open {path}")]
    Open {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("handshake failed")]
    Handshake(#[from] handshake::HandshakeError),
    #[error("no usable host key")]
    HostKey(#[from] russh_keys::Error),
    #[error(transparent)]
    Ssh(#[from] russh::Error),
}

/// Serves the back-channel on `device` until the task is dropped.
pub async fn serve(log: Logger, device: Utf8PathBuf, tether: Arc<Tether>) {
    let log = log.new(o!("component" => "backchannel"));
    loop {
        match serve_once(&log, &device, &tether).await {
            Ok(()) => info!(log, "back-channel session ended"),
            Err(err) => warn!(log, "back-channel session failed";
                "device" => %device, "error" => %err),
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
}

async fn serve_once(
    log: &Logger,
    device: &Utf8Path,
    tether: &Arc<Tether>,
) -> Result<(), BackchannelError> {
    let mut port = OpenOptions::new()
        .read(true)
        .write(true)
        .open(device)
        .await
        .map_err(|err| BackchannelError::Open { path: device.into(), err })?;
    let negotiated = handshake::server(log, &mut port).await?;
    info!(log, "back-channel synchronized"; "mode" => ?negotiated);

    let config = ssh::server_config(&tether.host_key().await)?;
    ssh::run(log, config, port, Arc::clone(tether)).await
}
