// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Creating the appliance VM

use crate::dispatcher::{Dispatcher, InstallerData};
use crate::Error;
use slog::{debug, info, warn};
use std::collections::BTreeSet;
use vch_common::config::{
    SessionConfig, VchConfigSpec, BRIDGE_NETWORK, SECRET_KEY_VMX_KEY,
    UPDATE_IN_PROGRESS_KEY,
};
use vch_common::extraconfig::{self, ExtraConfig, SecretKey};
use vch_common::MoRef;
use vsphere_utils::ancestry;
use vsphere_utils::datastore::DatastorePath;
use vsphere_utils::object::{
    DatastoreInfo, DeviceChange, VirtualDevice, VmCreateSpec, VmReconfigSpec,
    DATACENTER, RESOURCE_POOL, VIRTUAL_APP,
};
use vsphere_utils::tasks;
use vsphere_utils::VirtualMachine;

pub const GUEST_ID: &str = "other3xLinux64Guest";
const DEFAULT_CPU_COUNT: u32 = 1;
const DEFAULT_MEMORY_MB: u64 = 2048;
const BRIDGE_VSWITCH: &str = "vSwitch0";

pub const DOCKER_TLS_PORT: u16 = 2376;
pub const DOCKER_PORT: u16 = 2375;
const PORT_LAYER_PORT: u16 = 8080;

/// Where the components of the appliance find their hypervisor objects
pub struct InventoryPaths {
    pub datacenter: String,
    pub cluster: String,
    pub pool: String,
    pub datastore: String,
    pub vm_folder: String,
}

/// The port the Docker API listens on.
pub fn docker_port(spec: &VchConfigSpec, installer: &InstallerData) -> u16 {
    if let Some(port) = installer.api_port {
        return port;
    }
    if spec.host_certificate.as_ref().is_some_and(|c| !c.is_empty()) {
        DOCKER_TLS_PORT
    } else {
        DOCKER_PORT
    }
}

/// Adds the sessions the appliance runs: the admin portal, the Docker
/// personality and the port layer.
pub fn components(
    spec: &mut VchConfigSpec,
    installer: &InstallerData,
    paths: &InventoryPaths,
) {
    let insecure = spec.insecure;
    let ds = format!("-ds={}", paths.datastore);
    let cluster = format!("-cluster={}", paths.cluster);
    let pool = format!("-pool={}", paths.pool);
    let vm_path = format!("-vm-path={}", paths.vm_folder);
    let mut args = vec!["-docker-host=unix:///var/run/docker.sock"];
    if insecure {
        args.push("-insecure");
    }
    args.extend([
        ds.as_str(),
        cluster.as_str(),
        pool.as_str(),
        vm_path.as_str(),
    ]);
    let mut vicadmin = SessionConfig::create("/sbin/vicadmin", &args);
    vicadmin.user = "vicadmin".to_string();
    vicadmin.group = "vicadmin".to_string();
    vicadmin.cmd.env = vec!["PATH=/sbin:/bin".to_string()];
    vicadmin.cmd.dir = "/home/vicadmin".to_string();
    vicadmin.restart = true;
    spec.add_component("vicadmin", vicadmin);

    let port = format!("-port={}", docker_port(spec, installer));
    let port_layer_port = format!("-port-layer-port={PORT_LAYER_PORT}");
    let mut personality = SessionConfig::create(
        "/sbin/docker-engine-server",
        &["-serveraddr=0.0.0.0", &port, &port_layer_port],
    );
    personality.cmd.env = proxy_env(installer);
    personality.restart = true;
    spec.add_component("docker-personality", personality);

    let sdk = format!("--sdk={}", spec.target);
    let datacenter = format!("--datacenter={}", paths.datacenter);
    let cluster = format!("--cluster={}", paths.cluster);
    let pool = format!("--pool={}", paths.pool);
    let datastore = format!("--datastore={}", paths.datastore);
    let vch = format!("--vch={}", spec.name());
    let port = format!("--port={PORT_LAYER_PORT}");
    let mut args = vec!["--host=localhost", port.as_str()];
    if insecure {
        args.push("--insecure");
    }
    args.extend([
        sdk.as_str(),
        datacenter.as_str(),
        cluster.as_str(),
        pool.as_str(),
        datastore.as_str(),
        vch.as_str(),
    ]);
    let mut port_layer =
        SessionConfig::create("/sbin/port-layer-server", &args);
    port_layer.cmd.env = proxy_env(installer);
    port_layer.restart = true;
    spec.add_component("port-layer", port_layer);
}

fn proxy_env(installer: &InstallerData) -> Vec<String> {
    let mut env = vec!["PATH=/sbin".to_string(), "GOTRACEBACK=all".to_string()];
    if let Some(proxy) = &installer.http_proxy {
        env.push(format!("HTTP_PROXY={proxy}"));
    }
    if let Some(proxy) = &installer.https_proxy {
        env.push(format!("HTTPS_PROXY={proxy}"));
    }
    env
}

/// Builds the VM that will run `spec`: controllers, one NIC per distinct
/// port-group, and guest-info holding the encoded configuration.
pub fn create_appliance_spec(
    log: &slog::Logger,
    spec: &VchConfigSpec,
    secret: &SecretKey,
    datastore: &str,
) -> Result<VmCreateSpec, Error> {
    // Keys below zero are placeholders the hypervisor replaces.
    let mut devices = vec![
        VirtualDevice::IdeController { key: -1 },
        VirtualDevice::ScsiController { key: -2, model: "pvscsi".to_string() },
    ];
    let mut seen = BTreeSet::new();
    for (role, endpoint) in &spec.executor.networks {
        if !seen.insert(endpoint.port_group.clone()) {
            info!(log, "network role shares a NIC";
                "role" => role, "port_group" => &endpoint.port_group_name);
            continue;
        }
        let key = -3 - i32::try_from(seen.len()).unwrap_or(i32::MAX - 3);
        devices.push(VirtualDevice::EthernetCard {
            key,
            network: endpoint.port_group.clone(),
            mac: String::new(),
        });
    }

    let mut extra_config = extraconfig::encode(spec, Some(secret))?;
    extra_config.insert(SECRET_KEY_VMX_KEY.to_string(), secret.encoded());
    extra_config.insert(UPDATE_IN_PROGRESS_KEY.to_string(), true.to_string());

    let size = &spec.appliance_size;
    Ok(VmCreateSpec {
        name: spec.name().to_string(),
        guest_id: GUEST_ID.to_string(),
        num_cpus: Some(size.cpu_count.unwrap_or(DEFAULT_CPU_COUNT)),
        memory_mb: Some(size.memory_mb.unwrap_or(DEFAULT_MEMORY_MB)),
        vm_path_name: format!("[{datastore}]"),
        devices,
        extra_config,
    })
}

impl Dispatcher {
    /// Creates the VCH described by `spec`.  On return `spec` carries the
    /// appliance's reference and the pool it was placed in.
    pub async fn create_vch(
        &mut self,
        spec: &mut VchConfigSpec,
        installer: &InstallerData,
    ) -> Result<(), Error> {
        spec.validate()?;
        self.init_diagnostic_logs(spec).await;
        let result = self.create(spec, installer).await;
        if let Err(err) = &result {
            warn!(self.log, "failed to create VCH";
                "name" => spec.name(), "error" => %err);
            self.collect_diagnostic_logs().await;
        }
        result
    }

    async fn create(
        &mut self,
        spec: &mut VchConfigSpec,
        installer: &InstallerData,
    ) -> Result<(), Error> {
        self.check_existence(spec).await?;
        let (ds, _) = self.image_datastore(spec).await?;
        let parent = pool_parent(spec)?;

        self.resolve_networks(spec).await?;
        let pool = self.create_pool(spec, installer).await?;

        let secret = SecretKey::generate();
        self.secret = Some(secret.clone());
        spec.executor.id =
            VchConfigSpec::creating_id(&parent.value, spec.name());

        let vm = self.create_appliance(spec, installer, &pool, &ds).await?;
        let result = self.start_appliance(&vm, spec, installer, &ds).await;
        let cleared =
            vm.set_update_in_progress(&self.cleanup_ctx(), false).await;
        if let Err(err) = cleared {
            warn!(self.log, "failed to clear update-in-progress flag";
                "vm" => %vm.moref(), "error" => %err);
        }
        result
    }

    /// Uploads images, creates volume stores and boots the new appliance.
    /// The appliance is flagged as updating for the whole of this.
    async fn start_appliance(
        &self,
        vm: &VirtualMachine,
        spec: &mut VchConfigSpec,
        installer: &InstallerData,
        ds: &DatastoreInfo,
    ) -> Result<(), Error> {
        let folder = ds.path(&vm.folder_name(&self.ctx).await?);
        self.upload_images(&folder, &installer.image_files).await?;
        self.create_volume_stores(spec).await?;

        info!(self.log, "powering on VCH appliance"; "vm" => %vm.moref());
        vm.power_on(&self.ctx).await?;
        self.set_mac_to_guest_info(vm, spec).await?;

        match self.check_service_ready(vm, spec, installer).await {
            Err(err) if self.force => {
                warn!(self.log, "VCH API is not ready, continuing";
                    "error" => %err);
                Ok(())
            }
            other => other,
        }
    }

    /// Places the VCH in a vApp (vCenter) or resource pool (ESX) of its own
    /// under the last compute resource, and records it there.
    async fn create_pool(
        &self,
        spec: &mut VchConfigSpec,
        installer: &InstallerData,
    ) -> Result<MoRef, Error> {
        let name = spec.name().to_string();
        let parent = pool_parent(spec)?;

        if let Some(existing) = self
            .child_named(&parent, &name, &[RESOURCE_POOL, VIRTUAL_APP])
            .await?
        {
            info!(self.log, "reusing existing pool"; "pool" => %existing.moref);
            spec.add_compute_resource(existing.moref.clone());
            return Ok(existing.moref);
        }

        let resources = &installer.vch_size;
        let pool = if self.hv.is_vc() {
            let dc = ancestry::nearest_of_kind(
                &self.ctx,
                self.hv.as_ref(),
                &parent,
                DATACENTER,
            )
            .await?;
            let folder = self.ctx.run(self.hv.vm_folder(&dc)).await?;
            let created = tasks::wait_for_result(&self.ctx, &self.log, || {
                self.hv.create_vapp(&parent, &name, resources, &folder)
            })
            .await;
            match created {
                Ok(vapp) => vapp,
                Err(err) if self.force => {
                    warn!(self.log,
                        "failed to create virtual app, using parent";
                        "parent" => %parent, "error" => %err);
                    return Ok(parent);
                }
                Err(err) => {
                    let err = err.context("failed to create virtual app");
                    return Err(err.into());
                }
            }
        } else {
            tasks::wait_for_result(&self.ctx, &self.log, || {
                self.hv.create_resource_pool(&parent, &name, resources)
            })
            .await
            .map_err(|e| e.context("failed to create resource pool"))?
        };
        info!(self.log, "created VCH pool"; "pool" => %pool);
        spec.add_compute_resource(pool.clone());
        Ok(pool)
    }

    /// Resolves each endpoint's port-group, creating the bridge port-group
    /// on a standalone host when asked to.
    async fn resolve_networks(
        &self,
        spec: &mut VchConfigSpec,
    ) -> Result<(), Error> {
        let compute = spec
            .compute_resources
            .first()
            .cloned()
            .ok_or(Error::NoComputeResource)?;
        let dc = ancestry::nearest_of_kind(
            &self.ctx,
            self.hv.as_ref(),
            &compute,
            DATACENTER,
        )
        .await?;
        let dc_path = self.ctx.run(self.hv.inventory_path(&dc)).await?;

        if !self.hv.is_vc() && spec.create_bridge_network {
            let hosts = self.ctx.run(self.hv.hosts(&compute)).await?;
            let host = hosts.first().ok_or_else(|| {
                vsphere_utils::Error::not_found("host", compute.to_string())
            })?;
            let name = spec.bridge_network.clone();
            let port_group = tasks::wait_for_result(&self.ctx, &self.log, || {
                self.hv.add_port_group(host, BRIDGE_VSWITCH, &name)
            })
            .await
            .map_err(|e| e.context(format!("create port-group {name:?}")))?;
            info!(self.log, "created bridge port-group"; "name" => &name);
            if let Some(bridge) = spec.executor.networks.get_mut(BRIDGE_NETWORK)
            {
                bridge.port_group = port_group;
                bridge.port_group_name = name;
            }
        }

        for endpoint in spec.executor.networks.values_mut() {
            if endpoint.port_group.is_empty() {
                let path =
                    format!("{}/network/{}", dc_path, endpoint.port_group_name);
                endpoint.port_group = self
                    .ctx
                    .run(self.hv.find_by_inventory_path(&path))
                    .await?
                    .ok_or_else(|| {
                        Error::NetworkNotFound(endpoint.port_group_name.clone())
                    })?;
                endpoint.inventory_path = path;
            }
            let lookup = self.hv.network(&endpoint.port_group);
            let network = match self.ctx.run(lookup).await {
                Ok(network) => network,
                Err(err) if err.is_not_found() => {
                    return Err(Error::NetworkNotFound(
                        endpoint.port_group_name.clone(),
                    ));
                }
                Err(err) => return Err(err.into()),
            };
            debug!(self.log, "resolved network";
                "role" => &endpoint.name, "port_group" => %network.moref);
            endpoint.port_group_name = network.name;
        }
        Ok(())
    }

    async fn create_appliance(
        &self,
        spec: &mut VchConfigSpec,
        installer: &InstallerData,
        pool: &MoRef,
        ds: &DatastoreInfo,
    ) -> Result<VirtualMachine, Error> {
        let secret = self.secret.clone().unwrap_or_else(SecretKey::generate);
        let create = create_appliance_spec(&self.log, spec, &secret, &ds.name)?;
        let dc = ancestry::nearest_of_kind(
            &self.ctx,
            self.hv.as_ref(),
            pool,
            DATACENTER,
        )
        .await?;
        let folder = self.ctx.run(self.hv.vm_folder(&dc)).await?;

        info!(self.log, "creating appliance"; "name" => spec.name());
        let moref = tasks::wait_for_result(&self.ctx, &self.log, || {
            self.hv.create_vm(&folder, pool, None, &create)
        })
        .await
        .map_err(|e| e.context("failed to create appliance"))?;
        let vm = self.vm(&moref);

        let old = extraconfig::encode(spec, None)?;
        spec.set_moref(&moref);
        let vm_folder = vm.folder_name(&self.ctx).await?;
        spec.bootstrap_image_path = ds
            .path(&vm_folder)
            .join(&installer.bootstrap_iso)
            .to_string();

        let paths = self.inventory_paths(spec, ds, &vm_folder).await?;
        components(spec, installer, &paths);

        let props = vm.properties(&self.ctx).await?;
        let controller = props
            .devices
            .iter()
            .find_map(|d| match d {
                VirtualDevice::IdeController { key } => Some(*key),
                _ => None,
            })
            .ok_or_else(|| {
                vsphere_utils::Error::not_found("IDE controller", spec.name())
            })?;
        let iso = ds.path(&vm_folder).join(&installer.appliance_iso);
        let update = VmReconfigSpec {
            device_changes: vec![DeviceChange::Add(VirtualDevice::Cdrom {
                key: -1,
                controller,
                iso: Some(iso.to_string()),
            })],
            extra_config: extraconfig::changes(
                &old,
                &extraconfig::encode(spec, Some(&secret))?,
            ),
        };
        vm.reconfigure(&self.ctx, &update)
            .await
            .map_err(|e| e.context("failed to configure appliance"))?;
        Ok(vm)
    }

    async fn inventory_paths(
        &self,
        spec: &VchConfigSpec,
        ds: &DatastoreInfo,
        vm_folder: &str,
    ) -> Result<InventoryPaths, Error> {
        let cluster =
            spec.compute_resources.first().ok_or(Error::NoComputeResource)?;
        let pool =
            spec.compute_resources.last().ok_or(Error::NoComputeResource)?;
        let dc = ancestry::nearest_of_kind(
            &self.ctx,
            self.hv.as_ref(),
            cluster,
            DATACENTER,
        )
        .await?;
        Ok(InventoryPaths {
            datacenter: self.ctx.run(self.hv.inventory_path(&dc)).await?,
            cluster: self.ctx.run(self.hv.inventory_path(cluster)).await?,
            pool: self.ctx.run(self.hv.inventory_path(pool)).await?,
            datastore: ds.name.clone(),
            vm_folder: vm_folder.to_string(),
        })
    }

    /// Records the MAC address the hypervisor gave each endpoint's NIC.
    pub async fn set_mac_to_guest_info(
        &self,
        vm: &VirtualMachine,
        spec: &mut VchConfigSpec,
    ) -> Result<(), Error> {
        let secret = self.secret.clone().ok_or(Error::SecretKeyNotFound)?;
        let props = vm.properties(&self.ctx).await?;
        let old = extraconfig::encode(spec, Some(&secret))?;
        for endpoint in spec.executor.networks.values_mut() {
            let mac = props.devices.iter().find_map(|d| match d {
                VirtualDevice::EthernetCard { network, mac, .. }
                    if *network == endpoint.port_group =>
                {
                    Some(mac.clone())
                }
                _ => None,
            });
            if let Some(mac) = mac {
                endpoint.mac = mac;
            }
        }
        let new = extraconfig::encode(spec, Some(&secret))?;
        let update = VmReconfigSpec {
            device_changes: Vec::new(),
            extra_config: changed_values(&old, &new),
        };
        if update.is_empty() {
            return Ok(());
        }
        vm.reconfigure(&self.ctx, &update)
            .await
            .map_err(|e| e.context("failed to set MAC addresses"))?;
        Ok(())
    }
}

fn pool_parent(spec: &VchConfigSpec) -> Result<MoRef, Error> {
    spec.compute_resources.last().cloned().ok_or(Error::NoComputeResource)
}

/// The entries of `new` whose value differs from `old`, ignoring sealed
/// values, which differ on every encoding.
fn changed_values(old: &ExtraConfig, new: &ExtraConfig) -> ExtraConfig {
    new.iter()
        .filter(|(key, value)| {
            !key.ends_with(extraconfig::SECRET_SUFFIX)
                && old.get(*key) != Some(*value)
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
