// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reporting on a running VCH

use crate::appliance::docker_port;
use crate::dispatcher::{Dispatcher, InstallerData};
use crate::Error;
use slog::{info, warn};
use std::net::Ipv4Addr;
use vch_common::config::{
    VcApiStatus, VchConfigSpec, Version, CLIENT_IP_KEY, CLIENT_NETWORK,
    TEST_VC_API,
};
use vsphere_utils::object::PowerState;
use vsphere_utils::VirtualMachine;

const ADMIN_PORTAL_PORT: u16 = 2378;

/// What an operator needs to reach a VCH
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VchInfo {
    pub name: String,
    pub version: Version,
    pub power_state: PowerState,
    pub client_ip: Ipv4Addr,
    /// Value for `DOCKER_HOST`
    pub docker_host: String,
    pub admin_portal: String,
    pub api_ready: bool,
    /// Whether the appliance can reach the management API, if that could
    /// be determined
    pub vc_api: Option<VcApiStatus>,
}

impl Dispatcher {
    /// Describes the running VCH in `vm`.  A VCH whose API is not ready is
    /// still described; [`VchInfo::api_ready`] says so.
    pub async fn inspect_vch(
        &self,
        vm: &VirtualMachine,
        spec: &VchConfigSpec,
        installer: &InstallerData,
    ) -> Result<VchInfo, Error> {
        let power_state = vm.power_state(&self.ctx).await?;
        if power_state != PowerState::PoweredOn {
            return Err(Error::NotPoweredOn(power_state));
        }

        let client_ip = match spec
            .network(CLIENT_NETWORK)
            .and_then(|endpoint| endpoint.assigned_ip())
        {
            Some(ip) => ip,
            None => self.published_client_ip(vm).await?,
        };

        let api_ready =
            match self.check_service_ready(vm, spec, installer).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(self.log, "VCH API is not ready"; "error" => %err);
                    false
                }
            };

        let vc_api = match self.check_access_to_vc_api(vm, spec).await {
            Ok(status) => Some(status),
            Err(err) => {
                warn!(self.log, "unable to probe management API access";
                    "error" => %err);
                None
            }
        };

        let port = docker_port(spec, installer);
        let info = VchInfo {
            name: spec.name().to_string(),
            version: spec.version.clone(),
            power_state,
            client_ip,
            docker_host: format!("{client_ip}:{port}"),
            admin_portal: format!("https://{client_ip}:{ADMIN_PORTAL_PORT}"),
            api_ready,
            vc_api,
        };
        info!(self.log, "VCH";
            "name" => &info.name,
            "version" => %info.version,
            "DOCKER_HOST" => &info.docker_host,
            "admin portal" => &info.admin_portal,
            "api ready" => info.api_ready);
        Ok(info)
    }

    /// Asks the appliance whether it can reach the management API at
    /// `spec.target`.
    pub async fn check_access_to_vc_api(
        &self,
        vm: &VirtualMachine,
        spec: &VchConfigSpec,
    ) -> Result<VcApiStatus, Error> {
        let code = vm
            .run_guest_program(&self.ctx, TEST_VC_API, &spec.target)
            .await
            .map_err(|e| e.context("run management API probe"))?;
        VcApiStatus::from_code(code).ok_or(Error::VcApiProbe(code))
    }

    async fn published_client_ip(
        &self,
        vm: &VirtualMachine,
    ) -> Result<Ipv4Addr, Error> {
        let config = vm.fetch_extra_config(&self.ctx).await?;
        config
            .get(CLIENT_IP_KEY)
            .and_then(|value| value.parse::<Ipv4Addr>().ok())
            .filter(|ip| !ip.is_unspecified())
            .ok_or(Error::NoClientAddress)
    }
}
