// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synthetic guest-operation commands
//!
//! The management plane's "start program in guest" operation is not allowed
//! to run arbitrary binaries on an appliance.  Only the names below are
//! recognized, and each maps to something the tether does itself.

use crate::ops::{BoxedOperations, OpsError};
use slog::{info, Logger};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use vch_common::config::VcApiStatus;

pub const ENABLE_SSH: &str = "enable-ssh";
pub const PASSWD: &str = "passwd";
pub use vch_common::config::TEST_VC_API;

const VC_API_PORT: u16 = 443;
const VC_API_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ToolboxError {
    #[error("program {0:?} is not supported")]
    Unsupported(String),
    #[error(transparent)]
    Ops(#[from] OpsError),
}

pub struct Toolbox {
    log: Logger,
    ops: BoxedOperations,
}

impl Toolbox {
    pub fn new(log: Logger, ops: BoxedOperations) -> Self {
        Toolbox { log, ops }
    }

    /// Runs the synthetic program `path` with `args`, returning its exit
    /// code.
    pub async fn start_program(
        &self,
        path: &str,
        args: &str,
    ) -> Result<i32, ToolboxError> {
        info!(self.log, "start program"; "path" => path);
        match path {
            ENABLE_SSH => {
                self.ops.enable_ssh(args).await?;
                Ok(0)
            }
            PASSWD => {
                self.ops.set_password(args).await?;
                Ok(0)
            }
            TEST_VC_API => Ok(test_vc_api(args).await as i32),
            other => Err(ToolboxError::Unsupported(other.to_string())),
        }
    }
}

/// Extracts `host:port` from a URL or bare host, defaulting the port.
fn parse_target(target: &str) -> Option<(String, u16)> {
    let target = target.trim();
    let rest = target.split_once("://").map_or(target, |(_, rest)| rest);
    let authority = rest.split('/').next()?;
    let authority =
        authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    if authority.is_empty() {
        return None;
    }

    if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, after) = bracketed.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None if after.is_empty() => VC_API_PORT,
            None => return None,
        };
        return Some((host.to_string(), port));
    }
    match authority.split_once(':') {
        Some((host, port)) if !host.is_empty() => {
            Some((host.to_string(), port.parse().ok()?))
        }
        Some(_) => None,
        None => Some((authority.to_string(), VC_API_PORT)),
    }
}

/// Checks whether the management API at `target` accepts connections.
pub async fn test_vc_api(target: &str) -> VcApiStatus {
    let Some((host, port)) = parse_target(target) else {
        return VcApiStatus::InvalidTarget;
    };
    let addrs: Vec<SocketAddr> =
        match tokio::net::lookup_host((host.as_str(), port)).await {
            Ok(addrs) => addrs.collect(),
            Err(_) => return VcApiStatus::Unresolvable,
        };
    if addrs.is_empty() {
        return VcApiStatus::Unresolvable;
    }
    for addr in addrs {
        let connect = TcpStream::connect(addr);
        if let Ok(Ok(_)) = tokio::time::timeout(VC_API_TIMEOUT, connect).await {
            return VcApiStatus::Reachable;
        }
    }
    VcApiStatus::Unreachable
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ops::FakeOperations;
    use tokio::net::TcpListener;
    use vch_test_utils::dev::test_setup_log;

    #[test]
    fn targets() {
        assert_eq!(
            parse_target("https://vc.example.com/sdk"),
            Some(("vc.example.com".to_string(), 443))
        );
        assert_eq!(
            parse_target("https://user@10.0.0.1:8443/sdk"),
            Some(("10.0.0.1".to_string(), 8443))
        );
        assert_eq!(
            parse_target("[fd00::1]:9443"),
            Some(("fd00::1".to_string(), 9443))
        );
        assert_eq!(parse_target("vc"), Some(("vc".to_string(), 443)));
        assert_eq!(parse_target(""), None);
        assert_eq!(parse_target("vc:notaport"), None);
        assert_eq!(parse_target("https:///sdk"), None);
    }

    #[tokio::test]
    async fn vc_api_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert_eq!(
            test_vc_api(&format!("https://{addr}/sdk")).await,
            VcApiStatus::Reachable
        );
        drop(listener);
        assert_eq!(
            test_vc_api(&format!("{addr}")).await,
            VcApiStatus::Unreachable
        );
        assert_eq!(test_vc_api("").await, VcApiStatus::InvalidTarget);
        assert_eq!(
            test_vc_api("does-not-exist.invalid").await,
            VcApiStatus::Unresolvable
        );
    }

    #[tokio::test]
    async fn only_synthetic_programs_run() {
        let logctx = test_setup_log("only_synthetic_programs_run");
        let ops = FakeOperations::new();
        let toolbox =
            Toolbox::new(logctx.log.clone(), ops.clone().as_operations());

        let keys = "ssh-ed25519 AAAA";
        assert_eq!(toolbox.start_program(ENABLE_SSH, keys).await.unwrap(), 0);
        assert_eq!(toolbox.start_program(PASSWD, "s3cret").await.unwrap(), 0);
        assert!(matches!(
            toolbox.start_program("/bin/sh", "-c reboot").await,
            Err(ToolboxError::Unsupported(_))
        ));
        assert_eq!(
            ops.calls(),
            vec!["enable-ssh ssh-ed25519 AAAA", "passwd s3cret"]
        );
        logctx.cleanup_successful();
    }
}
