// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconfiguring, upgrading and rolling back a VCH
//!
//! Both reconfigure and upgrade run as a transaction around a snapshot of
//! the appliance: the snapshot is taken before anything on the VM changes,
//! a failure reverts to it, and success removes the snapshot left by the
//! previous run.  The most recent snapshot is what a later rollback
//! returns to.  While any of this runs the appliance carries the
//! update-in-progress flag so that concurrent operations back off.

use crate::dispatcher::{Dispatcher, InstallerData};
use crate::Error;
use slog::{error, info, warn};
use vch_common::config::{Resources, VchConfigSpec, CLIENT_IP_KEY};
use vch_common::extraconfig::{self, SecretKey};
use vch_common::MoRef;
use vsphere_utils::datastore::DatastorePath;
use vsphere_utils::object::{
    DeviceChange, PowerState, SnapshotTree, VirtualDevice, VmReconfigSpec,
};
use vsphere_utils::VirtualMachine;

/// Prefix of the snapshot taken before a reconfigure or upgrade
pub const CONFIGURE_PREFIX: &str = "reconfigure for";
/// Prefix used by older installers, still recognized when cleaning up
pub const UPGRADE_PREFIX: &str = "upgrade for";

const SNAPSHOT_DESCRIPTION: &str = "configure snapshot";

/// Resource settings of the VCH pool before they were changed
struct SavedResources {
    pool: MoRef,
    resources: Resources,
}

fn is_configure_snapshot(name: &str) -> bool {
    name.starts_with(CONFIGURE_PREFIX) || name.starts_with(UPGRADE_PREFIX)
}

fn attached_isos(devices: &[VirtualDevice]) -> Vec<String> {
    devices
        .iter()
        .filter_map(|d| match d {
            VirtualDevice::Cdrom { iso: Some(iso), .. } => Some(iso.clone()),
            _ => None,
        })
        .collect()
}

impl Dispatcher {
    /// Applies `spec` to the VCH running in `vm`.  With `is_configure_op`
    /// the installer must match the VCH's version; otherwise this is an
    /// upgrade to `installer.version`.
    pub async fn configure(
        &mut self,
        vm: &VirtualMachine,
        spec: &mut VchConfigSpec,
        installer: &InstallerData,
        is_configure_op: bool,
    ) -> Result<(), Error> {
        self.check_version(spec, installer, is_configure_op)?;
        if !is_configure_op {
            spec.version = installer.version.clone();
        }

        self.lock_update(vm).await?;
        self.init_diagnostic_logs(spec).await;
        let result =
            self.configure_locked(vm, spec, installer, is_configure_op).await;
        if let Err(err) = &result {
            error!(self.log, "failed to configure VCH";
                "name" => spec.name(), "error" => %err);
            self.collect_diagnostic_logs().await;
        }
        self.unlock_update(vm).await;
        result
    }

    fn check_version(
        &self,
        spec: &VchConfigSpec,
        installer: &InstallerData,
        is_configure_op: bool,
    ) -> Result<(), Error> {
        let vch = &spec.version;
        let ours = &installer.version;
        if is_configure_op {
            if vch != ours && !self.force {
                return Err(Error::VersionMismatch {
                    vch: vch.clone(),
                    installer: ours.clone(),
                });
            }
        } else if vch.is_newer_than(ours) == Some(true) && !self.force {
            return Err(Error::NewerVersion {
                vch: vch.clone(),
                installer: ours.clone(),
            });
        }
        Ok(())
    }

    /// Takes the update-in-progress flag.  The read and the write are
    /// separate calls, so two dispatchers racing here can both succeed; the
    /// flag only guards against operations that do not overlap this window.
    async fn lock_update(&self, vm: &VirtualMachine) -> Result<(), Error> {
        if vm.is_update_in_progress(&self.ctx).await? {
            return Err(Error::UpdateInProgress);
        }
        vm.set_update_in_progress(&self.ctx, true).await?;
        Ok(())
    }

    async fn unlock_update(&self, vm: &VirtualMachine) {
        let ctx = self.cleanup_ctx();
        if let Err(err) = vm.set_update_in_progress(&ctx, false).await {
            error!(self.log, "failed to clear update-in-progress flag";
                "vm" => %vm.moref(), "error" => %err);
        }
    }

    /// Clears a stale update-in-progress flag left by an interrupted
    /// operation.
    pub async fn reset_update_in_progress(
        &self,
        vm: &VirtualMachine,
    ) -> Result<(), Error> {
        info!(self.log, "resetting update-in-progress flag";
            "vm" => %vm.moref());
        vm.set_update_in_progress(&self.ctx, false).await?;
        Ok(())
    }

    async fn configure_locked(
        &mut self,
        vm: &VirtualMachine,
        spec: &mut VchConfigSpec,
        installer: &InstallerData,
        is_configure_op: bool,
    ) -> Result<(), Error> {
        let secret = self.secret_for(vm).await?;
        let dir = vm.ds_path(&self.ctx).await?;
        let attached =
            attached_isos(&vm.properties(&self.ctx).await?.devices);

        self.upload_images(&dir, &installer.image_files).await?;
        let saved = match self.update_resource_settings(spec, installer).await
        {
            Ok(saved) => saved,
            Err(err) => {
                self.delete_upgrade_images(
                    &dir,
                    &installer.image_files,
                    &attached,
                )
                .await;
                return Err(err);
            }
        };

        spec.clear_started();
        spec.bootstrap_image_path =
            dir.join(&installer.bootstrap_iso).to_string();
        let old_snapshot = vm.current_snapshot_tree(&self.ctx).await?;
        let name = format!("{CONFIGURE_PREFIX} {}", spec.version.build_number)
            .trim()
            .to_string();
        info!(self.log, "creating appliance snapshot"; "snapshot" => &name);
        let snapshot = match vm
            .create_snapshot(&self.ctx, &name, SNAPSHOT_DESCRIPTION)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.delete_upgrade_images(
                    &dir,
                    &installer.image_files,
                    &attached,
                )
                .await;
                self.rollback_resource_settings(saved).await;
                return Err(err.into());
            }
        };

        let updated = self
            .update(vm, spec, installer, &secret, &dir, is_configure_op)
            .await;
        let err = match updated {
            Ok(()) => {
                self.remove_previous_snapshot(vm, old_snapshot).await;
                return Ok(());
            }
            Err(err) => err,
        };

        warn!(self.log, "failed to update VCH, rolling back";
            "error" => %err);
        if let Err(revert) = self
            .revert_and_restart(vm, &snapshot, spec, installer)
            .await
        {
            error!(self.log, "failed to revert appliance";
                "snapshot" => &name, "error" => %revert);
        }
        self.delete_upgrade_images(&dir, &installer.image_files, &attached)
            .await;
        if let Err(remove) =
            vm.remove_snapshot(&self.cleanup_ctx(), &snapshot).await
        {
            warn!(self.log, "Failed to clean up appliance upgrade snapshot";
                "error" => %remove);
            warn!(self.log,
                "Snapshot {} of appliance virtual machine {} MUST be removed \
                 manually before upgrade again",
                name, vm.moref());
        }
        self.rollback_resource_settings(saved).await;
        Err(err)
    }

    /// Powers the appliance off, writes the new configuration and image,
    /// then powers it on and waits for it to serve.
    async fn update(
        &self,
        vm: &VirtualMachine,
        spec: &VchConfigSpec,
        installer: &InstallerData,
        secret: &SecretKey,
        dir: &DatastorePath,
        is_configure_op: bool,
    ) -> Result<(), Error> {
        if vm.power_state(&self.ctx).await? != PowerState::PoweredOff {
            info!(self.log, "powering off appliance"; "vm" => %vm.moref());
            vm.power_off(&self.ctx).await?;
        }
        if is_configure_op {
            self.create_volume_stores(spec).await?;
        }

        let props = vm.properties(&self.ctx).await?;
        let current: VchConfigSpec =
            extraconfig::decode(&props.extra_config, None)?;
        let mut extra_config = extraconfig::changes(
            &extraconfig::encode(&current, None)?,
            &extraconfig::encode(spec, Some(secret))?,
        );
        // The guest republishes its address once it is up again.
        extra_config.insert(CLIENT_IP_KEY.to_string(), String::new());

        let iso = dir.join(&installer.appliance_iso).to_string();
        let device_changes = props
            .devices
            .iter()
            .filter_map(|d| match d {
                VirtualDevice::Cdrom { key, controller, iso: current }
                    if current.as_deref() != Some(iso.as_str()) =>
                {
                    Some(DeviceChange::Edit(VirtualDevice::Cdrom {
                        key: *key,
                        controller: *controller,
                        iso: Some(iso.clone()),
                    }))
                }
                _ => None,
            })
            .take(1)
            .collect();
        let update = VmReconfigSpec { device_changes, extra_config };
        vm.reconfigure(&self.ctx, &update)
            .await
            .map_err(|e| e.context("failed to reconfigure appliance"))?;

        info!(self.log, "powering on appliance"; "vm" => %vm.moref());
        vm.power_on(&self.ctx).await?;
        self.check_service_ready(vm, spec, installer).await
    }

    async fn update_resource_settings(
        &self,
        spec: &VchConfigSpec,
        installer: &InstallerData,
    ) -> Result<Option<SavedResources>, Error> {
        if !installer.vch_size_is_set {
            return Ok(None);
        }
        let pool =
            spec.compute_resources.last().ok_or(Error::NoComputeResource)?;
        let resources = self.ctx.run(self.hv.pool_resources(pool)).await?;
        info!(self.log, "updating VCH resource settings"; "pool" => %pool);
        self.ctx
            .run(self.hv.update_pool_resources(pool, &installer.vch_size))
            .await
            .map_err(|e| e.context("failed to update resource settings"))?;
        Ok(Some(SavedResources { pool: pool.clone(), resources }))
    }

    async fn rollback_resource_settings(&self, saved: Option<SavedResources>) {
        let Some(saved) = saved else {
            return;
        };
        let ctx = self.cleanup_ctx();
        let restored = ctx
            .run(self.hv.update_pool_resources(&saved.pool, &saved.resources))
            .await;
        if let Err(err) = restored {
            warn!(self.log, "failed to roll back resource settings";
                "pool" => %saved.pool, "error" => %err);
        }
    }

    async fn remove_previous_snapshot(
        &self,
        vm: &VirtualMachine,
        previous: Option<SnapshotTree>,
    ) {
        let Some(previous) = previous.filter(|s| is_configure_snapshot(&s.name))
        else {
            return;
        };
        info!(self.log, "removing previous snapshot";
            "snapshot" => &previous.name);
        if let Err(err) =
            vm.remove_snapshot(&self.cleanup_ctx(), &previous.snapshot).await
        {
            warn!(self.log, "failed to remove previous snapshot";
                "snapshot" => &previous.name, "error" => %err);
        }
    }

    /// Reverts to `snapshot` and brings the appliance back up.  Readiness
    /// of the restored VCH is reported but does not fail the revert.
    async fn revert_and_restart(
        &self,
        vm: &VirtualMachine,
        snapshot: &MoRef,
        spec: &VchConfigSpec,
        installer: &InstallerData,
    ) -> Result<(), Error> {
        let ctx = self.cleanup_ctx();
        info!(self.log, "reverting appliance"; "snapshot" => %snapshot);
        vm.revert_to_snapshot(&ctx, snapshot, true).await?;
        if vm.power_state(&ctx).await? != PowerState::PoweredOn {
            vm.power_on(&ctx).await?;
        }
        if let Err(err) = self.check_service_ready(vm, spec, installer).await {
            warn!(self.log, "restored VCH is not ready"; "error" => %err);
        }
        Ok(())
    }

    /// Returns the VCH in `vm` to the state saved by its last reconfigure
    /// or upgrade.
    pub async fn rollback(
        &mut self,
        vm: &VirtualMachine,
        spec: &mut VchConfigSpec,
        installer: &InstallerData,
    ) -> Result<(), Error> {
        self.lock_update(vm).await?;
        let result = self.rollback_locked(vm, spec, installer).await;
        self.unlock_update(vm).await;
        result
    }

    async fn rollback_locked(
        &self,
        vm: &VirtualMachine,
        spec: &mut VchConfigSpec,
        installer: &InstallerData,
    ) -> Result<(), Error> {
        spec.clear_started();
        let snapshot = vm
            .current_snapshot_tree(&self.ctx)
            .await?
            .ok_or(Error::NoRollbackSnapshot)?;
        info!(self.log, "rolling back"; "snapshot" => &snapshot.name);
        self.revert_and_restart(vm, &snapshot.snapshot, spec, installer)
            .await?;
        vm.remove_snapshot(&self.ctx, &snapshot.snapshot).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use vch_common::config::Version;
    use vch_test_utils::dev::test_setup_log;
    use vsphere_utils::fakes::FakeHypervisor;
    use vsphere_utils::Context;

    #[test]
    fn snapshot_prefixes() {
        assert!(is_configure_snapshot("reconfigure for 5000"));
        assert!(is_configure_snapshot("upgrade for 4000"));
        assert!(!is_configure_snapshot("before patching"));
    }

    #[test]
    fn attached_isos_lists_cdroms() {
        let devices = vec![
            VirtualDevice::IdeController { key: 200 },
            VirtualDevice::Cdrom {
                key: 3000,
                controller: 200,
                iso: Some("[LocalDS_0] vch1/appliance.iso".to_string()),
            },
            VirtualDevice::Cdrom { key: 3001, controller: 200, iso: None },
        ];
        assert_eq!(attached_isos(&devices), ["[LocalDS_0] vch1/appliance.iso"]);
    }

    #[test]
    fn version_checks() {
        let logctx = test_setup_log("version_checks");
        let hv = Arc::new(FakeHypervisor::esx());
        let old = Version::new("v1.4.0", "4000", "aaaa");
        let new = Version::new("v1.5.0", "5000", "bbbb");
        let spec = VchConfigSpec { version: old.clone(), ..Default::default() };
        let installer =
            InstallerData { version: new.clone(), ..Default::default() };

        let strict = Dispatcher::new(
            hv.clone(),
            &logctx.log,
            false,
            Context::background(),
        );
        assert!(matches!(
            strict.check_version(&spec, &installer, true),
            Err(Error::VersionMismatch { .. })
        ));
        strict.check_version(&spec, &installer, false).unwrap();

        let downgrade = VchConfigSpec { version: new, ..Default::default() };
        let installer = InstallerData { version: old, ..Default::default() };
        assert!(matches!(
            strict.check_version(&downgrade, &installer, false),
            Err(Error::NewerVersion { .. })
        ));

        let forced =
            Dispatcher::new(hv, &logctx.log, true, Context::background());
        forced.check_version(&downgrade, &installer, false).unwrap();
        forced.check_version(&downgrade, &installer, true).unwrap();
        logctx.cleanup_successful();
    }
}
