// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deleting a VCH
//!
//! The appliance holds the only record of what the VCH owns, so it is
//! removed last: if anything before it fails, running the delete again
//! finds the same VCH and picks up where the last attempt stopped.

use crate::dispatcher::Dispatcher;
use crate::Error;
use futures::future::join_all;
use slog::{debug, info, warn};
use std::sync::Mutex;
use vch_common::config::VchConfigSpec;
use vsphere_utils::object::{
    DeviceChange, PowerState, VirtualDevice, VmReconfigSpec, RESOURCE_POOL,
    VIRTUAL_APP, VIRTUAL_MACHINE,
};
use vsphere_utils::{tasks, VirtualMachine};

/// Which container VMs a delete may remove
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteContainers {
    /// Power off and remove every container
    All,
    /// Remove stopped containers; a running one fails the delete
    PoweredOff,
}

/// Whether a delete removes the VCH's volume stores
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteVolumeStores {
    All,
    None,
}

impl Dispatcher {
    /// Deletes the VCH described by `spec` together with its containers,
    /// images and, when asked, volume stores.  A VCH whose appliance no
    /// longer exists is already deleted.
    pub async fn delete_vch(
        &mut self,
        spec: &VchConfigSpec,
        containers: DeleteContainers,
        volume_stores: DeleteVolumeStores,
    ) -> Result<(), Error> {
        let Some(vm) = self.find_appliance_by_id(spec).await? else {
            info!(self.log, "appliance is not found, nothing to delete";
                "name" => spec.name());
            return Ok(());
        };
        self.init_diagnostic_logs(spec).await;
        let result = self.delete(&vm, spec, containers, volume_stores).await;
        if let Err(err) = &result {
            warn!(self.log, "failed to delete VCH";
                "name" => spec.name(), "error" => %err);
            self.collect_diagnostic_logs().await;
        }
        result
    }

    async fn delete(
        &self,
        vm: &VirtualMachine,
        spec: &VchConfigSpec,
        containers: DeleteContainers,
        volume_stores: DeleteVolumeStores,
    ) -> Result<(), Error> {
        if let Err(err) = self.delete_containers(vm, spec, containers).await {
            info!(self.log, "Specify --force to force delete");
            return Err(err);
        }

        let mut errors = Vec::new();
        if let Err(err) = self.delete_images(spec).await {
            errors.push(err.to_string());
        }
        if let Err(err) = self.detach_appliance_devices(vm).await {
            errors.push(err.to_string());
        }
        self.remove_bridge_network(spec).await;
        if !errors.is_empty() {
            // The appliance stays so that the delete can be run again.
            return Err(Error::Cleanup(errors.join("\n")));
        }

        self.delete_vm(vm, true).await?;
        if let Err(err) = self.destroy_pool_if_empty(spec).await {
            warn!(self.log, "VCH resource pool is not removed";
                "error" => %err);
        }

        info!(self.log, "removing volume stores");
        self.delete_volume_store_if_forced(spec, volume_stores).await
    }

    /// Deletes every VM in the VCH pool other than the appliance.
    async fn delete_containers(
        &self,
        appliance: &VirtualMachine,
        spec: &VchConfigSpec,
        containers: DeleteContainers,
    ) -> Result<(), Error> {
        let pool =
            spec.compute_resources.last().ok_or(Error::NoComputeResource)?;
        let children = self
            .ctx
            .run(self.hv.children(pool))
            .await
            .map_err(|e| e.context(format!("list VMs of {pool}")))?;
        let force = self.force || containers == DeleteContainers::All;
        let appliance = appliance.moref();

        let errors = Mutex::new(Vec::new());
        let deletes = children
            .into_iter()
            .filter(|child| {
                child.moref.kind == VIRTUAL_MACHINE
                    && child.moref != appliance
                    && child.name != spec.name()
            })
            .map(|child| {
                let errors = &errors;
                async move {
                    info!(self.log, "removing container VM";
                        "vm" => %child.moref, "name" => &child.name);
                    let vm = self.vm(&child.moref);
                    if let Err(err) = self.delete_vm(&vm, force).await {
                        errors.lock().unwrap().push(err.to_string());
                    }
                }
            });
        join_all(deletes).await;

        let errors = errors.into_inner().unwrap();
        if errors.is_empty() {
            Ok(())
        } else {
            debug!(self.log, "failed to delete container VMs";
                "errors" => ?errors);
            Err(Error::Children(errors.join("\n")))
        }
    }

    /// Destroys `vm` and its directory.  A running VM is powered off first
    /// only with `force`.
    async fn delete_vm(
        &self,
        vm: &VirtualMachine,
        force: bool,
    ) -> Result<(), Error> {
        let moref = vm.moref();
        let state = vm.power_state(&self.ctx).await;
        if !matches!(state, Ok(PowerState::PoweredOff)) {
            if !force {
                state?;
                let name = vm
                    .name(&self.ctx)
                    .await
                    .unwrap_or_else(|_| moref.to_string());
                return Err(Error::PoweredOn(name));
            }
            if let Err(err) = &state {
                warn!(self.log, "failed to get power state";
                    "vm" => %moref, "error" => %err);
            }
            if let Err(err) = vm.power_off(&self.ctx).await {
                debug!(self.log, "failed to power off, removing anyway";
                    "vm" => %moref, "error" => %err);
            }
        }

        let dir = match vm.ds_path(&self.ctx).await {
            Ok(dir) => Some(dir),
            Err(err) => {
                warn!(self.log,
                    "Failed to get actual folder name for VM. Will not attempt \
                     to delete additional data files in VM directory";
                    "vm" => %moref, "error" => %err);
                None
            }
        };

        tasks::wait(&self.ctx, &self.log, || self.hv.destroy(&moref))
            .await
            .map_err(|e| e.context(format!("Failed to destroy vm {moref}")))?;

        let Some(dir) = dir.filter(|d| !d.is_root()) else {
            return Ok(());
        };
        let ds = self.ctx.run(self.hv.datastore(&dir.datastore)).await;
        let removed = match ds {
            Ok(ds) => self.delete_datastore_files(&ds, &dir.path, true).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = removed {
            warn!(self.log, "VM path is not removed";
                "path" => %dir, "error" => %err);
        }
        Ok(())
    }

    /// Powers the appliance off and removes its NICs and disks, so that
    /// destroying it cannot take image or volume contents with it.
    async fn detach_appliance_devices(
        &self,
        vm: &VirtualMachine,
    ) -> Result<(), Error> {
        info!(self.log, "removing appliance VM network devices");
        if vm.power_state(&self.ctx).await? != PowerState::PoweredOff {
            vm.power_off(&self.ctx)
                .await
                .map_err(|e| e.context("failed to power off appliance"))?;
        }
        let props = vm.properties(&self.ctx).await?;
        let device_changes: Vec<_> = props
            .devices
            .into_iter()
            .filter(|d| {
                matches!(
                    d,
                    VirtualDevice::EthernetCard { .. }
                        | VirtualDevice::Disk { .. }
                )
            })
            .map(DeviceChange::Remove)
            .collect();
        if device_changes.is_empty() {
            info!(self.log, "no network device attached");
            return Ok(());
        }
        let update =
            VmReconfigSpec { device_changes, extra_config: Default::default() };
        vm.reconfigure(&self.ctx, &update).await?;
        Ok(())
    }

    /// Removes the bridge port-group this VCH created on a standalone host.
    async fn remove_bridge_network(&self, spec: &VchConfigSpec) {
        if self.hv.is_vc() || !spec.create_bridge_network {
            return;
        }
        let Some(compute) = spec.compute_resources.first() else {
            return;
        };
        let result = async {
            let hosts = self.ctx.run(self.hv.hosts(compute)).await?;
            let Some(host) = hosts.first() else {
                return Ok::<_, vsphere_utils::Error>(());
            };
            tasks::wait(&self.ctx, &self.log, || {
                self.hv.remove_port_group(host, &spec.bridge_network)
            })
            .await
        }
        .await;
        match result {
            Ok(()) => info!(self.log, "removed bridge network";
                "name" => &spec.bridge_network),
            Err(err) => warn!(self.log, "failed to remove bridge network";
                "name" => &spec.bridge_network, "error" => %err),
        }
    }

    /// Destroys the pool the VCH was placed in if it is the VCH's own and
    /// nothing else lives in it.
    async fn destroy_pool_if_empty(
        &self,
        spec: &VchConfigSpec,
    ) -> Result<(), Error> {
        let Some(pool) = spec.compute_resources.last() else {
            return Ok(());
        };
        if pool.kind != RESOURCE_POOL && pool.kind != VIRTUAL_APP {
            return Ok(());
        }
        let entity = self.ctx.run(self.hv.entity(pool)).await?;
        if entity.name != spec.name() {
            debug!(self.log, "VCH was not placed in a pool of its own";
                "pool" => %pool);
            return Ok(());
        }
        let children = self.ctx.run(self.hv.children(pool)).await?;
        if !children.is_empty() {
            warn!(self.log, "VCH resource pool is not empty, keeping it";
                "pool" => %pool, "children" => children.len());
            return Ok(());
        }
        tasks::wait(&self.ctx, &self.log, || self.hv.destroy(pool)).await?;
        info!(self.log, "removed VCH resource pool"; "pool" => %pool);
        Ok(())
    }
}
