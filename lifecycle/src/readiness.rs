// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Waiting for a VCH to serve its API
//!
//! A VCH is ready once its client network has an address and the Docker
//! API on that address reports the port layer as running.

use crate::appliance::docker_port;
use crate::dispatcher::{Dispatcher, InstallerData};
use crate::Error;
use serde::Deserialize;
use slog::{debug, info, warn};
use std::net::Ipv4Addr;
use std::time::Duration;
use vch_common::backoff::{retry_policy_poll, Backoff};
use vch_common::config::{VchConfigSpec, CLIENT_IP_KEY};
use vch_common::extraconfig;
use vsphere_utils::{Context, VirtualMachine};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const BACKEND_ENGINE_SUFFIX: &str = "Backend Engine";
const BACKEND_RUNNING: &str = "RUNNING";
const VOLUME_STORES_ROW: &str = "VolumeStores";

/// The parts of the Docker `/info` response that describe the VCH
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct DockerInfo {
    #[serde(default)]
    system_status: Option<Vec<[String; 2]>>,
}

impl DockerInfo {
    fn rows(&self) -> impl Iterator<Item = (&str, &str)> {
        self.system_status
            .iter()
            .flatten()
            .map(|[name, value]| (name.as_str(), value.as_str()))
    }

    pub fn backend_running(&self) -> bool {
        self.rows().any(|(name, value)| {
            name.ends_with(BACKEND_ENGINE_SUFFIX) && value == BACKEND_RUNNING
        })
    }

    pub fn volume_stores(&self) -> Vec<&str> {
        self.rows()
            .filter(|(name, _)| *name == VOLUME_STORES_ROW)
            .flat_map(|(_, value)| value.split_whitespace())
            .collect()
    }
}

impl Dispatcher {
    /// Waits up to `installer.timeout` for the VCH in `vm` to serve its
    /// API.  On timeout the appliance's view of itself is logged.
    pub(crate) async fn check_service_ready(
        &self,
        vm: &VirtualMachine,
        spec: &VchConfigSpec,
        installer: &InstallerData,
    ) -> Result<(), Error> {
        let ctx = self.ctx.child_with_timeout(installer.timeout);
        match self.wait_for_api(&ctx, vm, spec, installer).await {
            Ok(()) => Ok(()),
            Err(err) if ctx.is_done() => {
                warn!(self.log, "VCH API did not become ready";
                    "timeout" => ?installer.timeout, "error" => %err);
                self.log_appliance_state(vm).await;
                Err(Error::ReadinessTimeout(installer.timeout))
            }
            Err(err) => Err(err),
        }
    }

    async fn wait_for_api(
        &self,
        ctx: &Context,
        vm: &VirtualMachine,
        spec: &VchConfigSpec,
        installer: &InstallerData,
    ) -> Result<(), Error> {
        let ip = self.wait_for_client_ip(ctx, vm).await?;
        let tls = spec.host_certificate.as_ref().is_some_and(|c| !c.is_empty());
        let scheme = if tls { "https" } else { "http" };
        let url =
            format!("{scheme}://{ip}:{}/info", docker_port(spec, installer));
        let client = self.api_client(spec, installer, tls)?;
        info!(self.log, "waiting for VCH API"; "url" => &url);

        let mut policy = retry_policy_poll();
        loop {
            let probe = tokio::select! {
                err = ctx.done() => return Err(err.into()),
                probe = probe_info(&client, &url) => probe,
            };
            match probe {
                Ok(info) if info.backend_running() => {
                    self.check_volume_stores(spec, &info);
                    info!(self.log, "VCH API is ready"; "url" => &url);
                    return Ok(());
                }
                Ok(_) => debug!(self.log, "port layer is not running yet"),
                Err(err) => {
                    debug!(self.log, "VCH API is not reachable yet";
                        "error" => %err);
                }
            }
            let delay = policy.next_backoff().unwrap_or(policy.max_interval);
            ctx.sleep(delay).await?;
        }
    }

    /// Waits for the guest to publish a usable client network address.
    pub(crate) async fn wait_for_client_ip(
        &self,
        ctx: &Context,
        vm: &VirtualMachine,
    ) -> Result<Ipv4Addr, Error> {
        let mut policy = retry_policy_poll();
        loop {
            let value = vm
                .wait_for_key_in_extra_config(ctx, CLIENT_IP_KEY)
                .await
                .map_err(|e| e.context("wait for client address"))?;
            match value.parse::<Ipv4Addr>() {
                Ok(ip) if !ip.is_unspecified() => {
                    debug!(self.log, "client address"; "ip" => %ip);
                    return Ok(ip);
                }
                _ => {
                    debug!(self.log, "client address is not usable yet";
                        "value" => &value);
                }
            }
            let delay = policy.next_backoff().unwrap_or(policy.max_interval);
            ctx.sleep(delay).await?;
        }
    }

    fn api_client(
        &self,
        spec: &VchConfigSpec,
        installer: &InstallerData,
        tls: bool,
    ) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::ClientBuilder::new()
            .connect_timeout(PROBE_TIMEOUT)
            .timeout(PROBE_TIMEOUT);
        if tls {
            match &installer.client_certificate {
                Some(cert) if !cert.is_empty() => {
                    let pem = format!("{}\n{}", cert.cert, cert.key.expose());
                    builder = builder
                        .identity(reqwest::Identity::from_pem(pem.as_bytes())?);
                    if !spec.certificate_authorities.is_empty() {
                        let ca = reqwest::Certificate::from_pem(
                            spec.certificate_authorities.as_bytes(),
                        )?;
                        builder = builder.add_root_certificate(ca);
                    }
                }
                _ => {
                    warn!(self.log,
                        "no client certificate, skipping verification of the \
                         VCH API certificate");
                    builder = builder.danger_accept_invalid_certs(true);
                }
            }
        }
        Ok(builder.build()?)
    }

    fn check_volume_stores(&self, spec: &VchConfigSpec, info: &DockerInfo) {
        let online = info.volume_stores();
        for label in spec.volume_locations.keys() {
            if !online.contains(&label.as_str()) {
                warn!(self.log,
                    "VolumeStore ({}) cannot be brought online - check \
                     network, nfs server, and --volume-store configurations",
                    label);
            }
        }
    }

    /// Logs what the appliance has published about its networks and
    /// sessions.
    pub(crate) async fn log_appliance_state(&self, vm: &VirtualMachine) {
        let ctx = self.cleanup_ctx();
        let config = match vm.fetch_extra_config(&ctx).await {
            Ok(config) => config,
            Err(err) => {
                warn!(self.log, "unable to read appliance state";
                    "error" => %err);
                return;
            }
        };
        let spec: VchConfigSpec = match extraconfig::decode(&config, None) {
            Ok(spec) => spec,
            Err(err) => {
                warn!(self.log, "unable to decode appliance state";
                    "error" => %err);
                return;
            }
        };
        for (role, endpoint) in &spec.executor.networks {
            match endpoint.assigned_ip() {
                Some(ip) => info!(self.log, "network address";
                    "role" => role, "ip" => %ip),
                None => warn!(self.log, "network has no address";
                    "role" => role),
            }
        }
        for (id, session) in &spec.executor.sessions {
            let started = session.started.as_str();
            if session.is_started() {
                info!(self.log, "component started"; "component" => id);
            } else if started.is_empty() {
                warn!(self.log, "component not started"; "component" => id);
            } else {
                warn!(self.log, "component failed to start";
                    "component" => id, "status" => started);
            }
        }
    }
}

async fn probe_info(
    client: &reqwest::Client,
    url: &str,
) -> Result<DockerInfo, reqwest::Error> {
    client.get(url).send().await?.error_for_status()?.json().await
}
