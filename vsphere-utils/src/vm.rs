// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A handle on one virtual machine
//!
//! [`VirtualMachine`] wraps the hypervisor calls that the dispatcher makes
//! against a VM.  Calls submitted through [`VirtualMachine::wait_for_result`]
//! recover from a VM whose inventory entry has gone invalid (for example
//! after its host reconnected): the VM is unregistered and registered again
//! from its `.vmx`, and the call retried once against the new reference.

use crate::ancestry;
use crate::context::Context;
use crate::datastore::DatastorePath;
use crate::fault::FaultKind;
use crate::hypervisor::BoxedHypervisor;
use crate::object::{
    ConnectionState, PowerState, SnapshotTree, VmProperties, VmReconfigSpec,
    DATACENTER,
};
use crate::retry;
use crate::tasks;
use crate::Error;
use slog::{debug, info, o, warn, Logger};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use vch_common::backoff::{retry_policy_poll, Backoff};
use vch_common::config::UPDATE_IN_PROGRESS_KEY;
use vch_common::extraconfig::ExtraConfig;
use vch_common::MoRef;

pub struct VirtualMachine {
    hv: BoxedHypervisor,
    // Replaced when the VM is re-registered.
    moref: Mutex<MoRef>,
    fixing: AtomicBool,
    log: Logger,
}

impl VirtualMachine {
    pub fn new(hv: BoxedHypervisor, moref: MoRef, log: &Logger) -> Self {
        let log = log.new(o!("vm" => moref.to_string()));
        VirtualMachine {
            hv,
            moref: Mutex::new(moref),
            fixing: AtomicBool::new(false),
            log,
        }
    }

    pub fn moref(&self) -> MoRef {
        self.moref.lock().unwrap().clone()
    }

    pub fn hypervisor(&self) -> &BoxedHypervisor {
        &self.hv
    }

    pub async fn properties(
        &self,
        ctx: &Context,
    ) -> Result<VmProperties, Error> {
        let moref = self.moref();
        ctx.run(self.hv.vm_properties(&moref)).await
    }

    pub async fn name(&self, ctx: &Context) -> Result<String, Error> {
        Ok(self.properties(ctx).await?.name)
    }

    pub async fn power_state(
        &self,
        ctx: &Context,
    ) -> Result<PowerState, Error> {
        Ok(self.properties(ctx).await?.power_state)
    }

    pub async fn fetch_extra_config(
        &self,
        ctx: &Context,
    ) -> Result<ExtraConfig, Error> {
        Ok(self.properties(ctx).await?.extra_config)
    }

    /// The directory holding the VM's files, e.g. `[LocalDS_0] vch1`.
    pub async fn ds_path(&self, ctx: &Context) -> Result<DatastorePath, Error> {
        let props = self.properties(ctx).await?;
        let vmx: DatastorePath = props.vmx_path.parse()?;
        Ok(vmx.parent())
    }

    /// The name of the VM's directory on its datastore.  This can differ
    /// from the VM name when the directory name was taken at creation.
    pub async fn folder_name(&self, ctx: &Context) -> Result<String, Error> {
        Ok(self.ds_path(ctx).await?.file_name().to_string())
    }

    /// Submits `op` against the current reference through
    /// [`tasks::wait_for_result`], repairing the VM and retrying once if the
    /// task fails because the VM is in an invalid state.
    pub async fn wait_for_result<T, F, Fut>(
        &self,
        ctx: &Context,
        mut op: F,
    ) -> Result<T, Error>
    where
        F: FnMut(MoRef) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let err =
            match tasks::wait_for_result(ctx, &self.log, || op(self.moref()))
                .await
            {
                Ok(result) => return Ok(result),
                Err(err) => err,
            };
        if !err.is_fault(&FaultKind::InvalidState) || !self.needs_fix(ctx).await
        {
            return Err(err);
        }
        if self
            .fixing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(err);
        }

        debug!(self.log, "trying to fix task failure"; "error" => %err);
        let fixed = self.fix_invalid_state(ctx).await;
        self.fixing.store(false, Ordering::SeqCst);
        if let Err(fix_err) = fixed {
            warn!(
                self.log,
                "failed to fix task failure";
                "error" => %fix_err,
            );
            return Err(err);
        }
        debug!(self.log, "fixed"; "vm" => %self.moref());
        tasks::wait_for_result(ctx, &self.log, || op(self.moref())).await
    }

    async fn needs_fix(&self, ctx: &Context) -> bool {
        match self.properties(ctx).await {
            Ok(props) => props.connection_state == ConnectionState::Invalid,
            Err(err) => {
                debug!(
                    self.log,
                    "unable to read connection state";
                    "error" => %err,
                );
                false
            }
        }
    }

    /// Unregisters the VM and registers it again from its `.vmx`, keeping
    /// its vApp or pool, host and name.
    async fn fix_invalid_state(&self, ctx: &Context) -> Result<(), Error> {
        let props = self.properties(ctx).await?;
        let name = props.name.clone();
        info!(self.log, "re-registering VM"; "name" => &name);

        let old = self.moref();
        ctx.run(self.hv.unregister_vm(&old))
            .await
            .map_err(|e| e.context(format!("unregister vm {:?}", name)))?;

        let host = props.host.as_ref();
        let moref = match &props.parent_vapp {
            Some(vapp) => {
                let vmx = &props.vmx_path;
                tasks::wait_for_result(ctx, &self.log, || {
                    self.hv.register_child_vm(vapp, vmx, &name, host)
                })
                .await
            }
            None => {
                let pool = props
                    .resource_pool
                    .clone()
                    .ok_or_else(|| Error::not_found("resource pool", &name))?;
                let folder = match &props.folder {
                    Some(folder) => folder.clone(),
                    None => {
                        let dc = ancestry::nearest_of_kind(
                            ctx,
                            self.hv.as_ref(),
                            &pool,
                            DATACENTER,
                        )
                        .await?;
                        ctx.run(self.hv.vm_folder(&dc)).await?
                    }
                };
                tasks::wait_for_result(ctx, &self.log, || {
                    self.hv.register_vm(
                        &folder,
                        &props.vmx_path,
                        &name,
                        &pool,
                        host,
                    )
                })
                .await
            }
        }
        .map_err(|e| e.context(format!("register vm {:?} back", name)))?;

        *self.moref.lock().unwrap() = moref;
        Ok(())
    }

    pub async fn power_on(&self, ctx: &Context) -> Result<(), Error> {
        self.wait_for_result(ctx, |vm| {
            let hv = self.hv.clone();
            async move { hv.power_on(&vm).await }
        })
        .await
    }

    pub async fn power_off(&self, ctx: &Context) -> Result<(), Error> {
        self.wait_for_result(ctx, |vm| {
            let hv = self.hv.clone();
            async move { hv.power_off(&vm).await }
        })
        .await
    }

    pub async fn reconfigure(
        &self,
        ctx: &Context,
        spec: &VmReconfigSpec,
    ) -> Result<(), Error> {
        self.wait_for_result(ctx, |vm| {
            let hv = self.hv.clone();
            async move { hv.reconfigure_vm(&vm, spec).await }
        })
        .await
    }

    pub async fn create_snapshot(
        &self,
        ctx: &Context,
        name: &str,
        description: &str,
    ) -> Result<MoRef, Error> {
        self.wait_for_result(ctx, |vm| {
            let hv = self.hv.clone();
            async move {
                hv.create_snapshot(&vm, name, description, false, false).await
            }
        })
        .await
    }

    pub async fn revert_to_snapshot(
        &self,
        ctx: &Context,
        snapshot: &MoRef,
        suppress_power_on: bool,
    ) -> Result<(), Error> {
        self.wait_for_result(ctx, |_| {
            let hv = self.hv.clone();
            async move {
                hv.revert_to_snapshot(snapshot, suppress_power_on).await
            }
        })
        .await
    }

    /// Removes one snapshot, consolidating disks and keeping its children,
    /// retrying while the datastore reports `SystemError`.
    pub async fn remove_snapshot(
        &self,
        ctx: &Context,
        snapshot: &MoRef,
    ) -> Result<(), Error> {
        retry::retry_on_system_error(ctx, &self.log, || {
            self.wait_for_result(ctx, |_| {
                let hv = self.hv.clone();
                async move { hv.remove_snapshot(snapshot, false, true).await }
            })
        })
        .await
    }

    /// Runs a program in the guest and returns its exit code.
    pub async fn run_guest_program(
        &self,
        ctx: &Context,
        path: &str,
        args: &str,
    ) -> Result<i64, Error> {
        let moref = self.moref();
        ctx.run(self.hv.run_guest_program(&moref, path, args)).await
    }

    pub async fn current_snapshot_tree(
        &self,
        ctx: &Context,
    ) -> Result<Option<SnapshotTree>, Error> {
        let Some(info) = self.properties(ctx).await?.snapshot else {
            return Ok(None);
        };
        let Some(current) = info.current else {
            return Ok(None);
        };
        Ok(find_snapshot(&info.root, |node| node.snapshot == current))
    }

    /// Waits until the guest publishes a non-empty value for `key`.  Fails
    /// if the VM leaves the powered-on state first.
    pub async fn wait_for_key_in_extra_config(
        &self,
        ctx: &Context,
        key: &str,
    ) -> Result<String, Error> {
        let mut policy = retry_policy_poll();
        loop {
            let props = self.properties(ctx).await?;
            if props.power_state != PowerState::PoweredOn {
                return Err(Error::PowerState(props.power_state));
            }
            if let Some(value) = props.extra_config.get(key) {
                if !value.is_empty() && value != "<nil>" {
                    return Ok(value.clone());
                }
            }
            let delay = policy.next_backoff().unwrap_or(policy.max_interval);
            ctx.sleep(delay).await.map_err(|e| {
                e.context(format!(
                    "unable to wait for extra config property {}",
                    key
                ))
            })?;
        }
    }

    pub async fn is_update_in_progress(
        &self,
        ctx: &Context,
    ) -> Result<bool, Error> {
        let config = self.fetch_extra_config(ctx).await?;
        Ok(config.get(UPDATE_IN_PROGRESS_KEY).is_some_and(|v| v == "true"))
    }

    pub async fn set_update_in_progress(
        &self,
        ctx: &Context,
        in_progress: bool,
    ) -> Result<(), Error> {
        let spec = VmReconfigSpec {
            device_changes: Vec::new(),
            extra_config: ExtraConfig::from([(
                UPDATE_IN_PROGRESS_KEY.to_string(),
                in_progress.to_string(),
            )]),
        };
        self.reconfigure(ctx, &spec).await
    }
}

/// Breadth-first search of a snapshot forest.
pub fn find_snapshot<P>(roots: &[SnapshotTree], pred: P) -> Option<SnapshotTree>
where
    P: Fn(&SnapshotTree) -> bool,
{
    let mut queue: VecDeque<&SnapshotTree> = roots.iter().collect();
    while let Some(node) = queue.pop_front() {
        if pred(node) {
            return Some(node.clone());
        }
        queue.extend(node.children.iter());
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fakes::{FakeHypervisor, Op};
    use crate::fault::Fault;
    use std::sync::Arc;
    use std::time::Duration;
    use vch_test_utils::dev::test_setup_log;

    fn tree(name: &str, id: &str, children: Vec<SnapshotTree>) -> SnapshotTree {
        SnapshotTree {
            snapshot: MoRef::new(crate::object::SNAPSHOT, id),
            name: name.to_string(),
            description: String::new(),
            children,
        }
    }

    #[test]
    fn snapshot_search_is_breadth_first() {
        let roots = vec![tree(
            "base",
            "snapshot-1",
            vec![
                tree(
                    "a",
                    "snapshot-2",
                    vec![tree("dup", "snapshot-4", vec![])],
                ),
                tree("dup", "snapshot-3", vec![]),
            ],
        )];
        let found = find_snapshot(&roots, |n| n.name == "dup").unwrap();
        assert_eq!(found.snapshot.value, "snapshot-3");
        assert!(find_snapshot(&roots, |n| n.name == "none").is_none());
    }

    #[tokio::test]
    async fn invalid_vm_is_reregistered_once() {
        let logctx = test_setup_log("invalid_vm_is_reregistered_once");
        let hv = Arc::new(FakeHypervisor::vcenter());
        let moref = hv.add_vm("vch1", &hv.root_pool());
        hv.set_connection_state(&moref, ConnectionState::Invalid);
        hv.inject_fault(
            Op::PowerOn,
            Fault::task(FaultKind::InvalidState, "invalid"),
            1,
        );

        let vm = VirtualMachine::new(hv.clone(), moref.clone(), &logctx.log);
        let ctx = Context::background();
        vm.power_on(&ctx).await.unwrap();

        assert_ne!(vm.moref(), moref);
        assert_eq!(hv.count(Op::UnregisterVm), 1);
        assert_eq!(hv.count(Op::RegisterVm), 1);
        assert_eq!(
            vm.power_state(&ctx).await.unwrap(),
            PowerState::PoweredOn
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn valid_vm_is_not_repaired() {
        let logctx = test_setup_log("valid_vm_is_not_repaired");
        let hv = Arc::new(FakeHypervisor::vcenter());
        let moref = hv.add_vm("vch1", &hv.root_pool());
        hv.inject_fault(
            Op::PowerOn,
            Fault::task(FaultKind::InvalidState, "invalid"),
            1,
        );

        let vm = VirtualMachine::new(hv.clone(), moref, &logctx.log);
        let err = vm.power_on(&Context::background()).await.unwrap_err();
        assert!(err.is_fault(&FaultKind::InvalidState));
        assert_eq!(hv.count(Op::UnregisterVm), 0);
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn key_wait_fails_when_powered_off() {
        let logctx = test_setup_log("key_wait_fails_when_powered_off");
        let hv = Arc::new(FakeHypervisor::vcenter());
        let moref = hv.add_vm("vch1", &hv.root_pool());
        let vm = VirtualMachine::new(hv.clone(), moref, &logctx.log);
        let ctx = Context::with_timeout(Duration::from_secs(5));

        let err = vm
            .wait_for_key_in_extra_config(&ctx, "guestinfo.vice..clientip")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PowerState(PowerState::PoweredOff)));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn update_in_progress_flag_round_trips() {
        let logctx = test_setup_log("update_in_progress_flag_round_trips");
        let hv = Arc::new(FakeHypervisor::vcenter());
        let moref = hv.add_vm("vch1", &hv.root_pool());
        let vm = VirtualMachine::new(hv.clone(), moref, &logctx.log);
        let ctx = Context::background();

        assert!(!vm.is_update_in_progress(&ctx).await.unwrap());
        vm.set_update_in_progress(&ctx, true).await.unwrap();
        assert!(vm.is_update_in_progress(&ctx).await.unwrap());
        vm.set_update_in_progress(&ctx, false).await.unwrap();
        assert!(!vm.is_update_in_progress(&ctx).await.unwrap());
        logctx.cleanup_successful();
    }
}
