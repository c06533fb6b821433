// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The slice of the management API the VCH components consume
//!
//! Calls that the management API runs as tasks resolve when the task
//! finishes; a failed task surfaces as [`crate::Fault::Task`].  Callers
//! normally submit them through [`crate::tasks::wait_for_result`] so that
//! transient faults are retried.

use crate::datastore::DatastorePath;
use crate::object::{
    About, ApiType, DatastoreInfo, LogHeader, ManagedEntity, NetworkInfo,
    VmCreateSpec, VmProperties, VmReconfigSpec,
};
use crate::Error;
use async_trait::async_trait;
use camino::Utf8Path;
use std::sync::Arc;
use vch_common::config::Resources;
use vch_common::MoRef;

pub type BoxedHypervisor = Arc<dyn Hypervisor>;

#[async_trait]
pub trait Hypervisor: Send + Sync {
    fn about(&self) -> About;

    fn is_vc(&self) -> bool {
        self.about().api_type == ApiType::VirtualCenter
    }

    // Inventory

    async fn entity(&self, moref: &MoRef) -> Result<ManagedEntity, Error>;

    async fn find_by_inventory_path(
        &self,
        path: &str,
    ) -> Result<Option<MoRef>, Error>;

    async fn inventory_path(&self, moref: &MoRef) -> Result<String, Error>;

    /// Immediate children: child pools and VMs of a pool or vApp, the
    /// contents of a folder.
    async fn children(
        &self,
        parent: &MoRef,
    ) -> Result<Vec<ManagedEntity>, Error>;

    /// The folder in which a datacenter's VMs are created.
    async fn vm_folder(&self, datacenter: &MoRef) -> Result<MoRef, Error>;

    /// Hosts that can run VMs placed in `compute`.
    async fn hosts(&self, compute: &MoRef) -> Result<Vec<MoRef>, Error>;

    // Resource pools and vApps

    async fn create_resource_pool(
        &self,
        parent: &MoRef,
        name: &str,
        resources: &Resources,
    ) -> Result<MoRef, Error>;

    async fn create_vapp(
        &self,
        parent: &MoRef,
        name: &str,
        resources: &Resources,
        folder: &MoRef,
    ) -> Result<MoRef, Error>;

    async fn pool_resources(&self, pool: &MoRef) -> Result<Resources, Error>;

    async fn update_pool_resources(
        &self,
        pool: &MoRef,
        resources: &Resources,
    ) -> Result<(), Error>;

    /// Destroys a VM, pool or vApp.
    async fn destroy(&self, moref: &MoRef) -> Result<(), Error>;

    // Virtual machines

    /// Creates a VM in `pool`; when `pool` is a vApp the VM becomes its
    /// child.
    async fn create_vm(
        &self,
        folder: &MoRef,
        pool: &MoRef,
        host: Option<&MoRef>,
        spec: &VmCreateSpec,
    ) -> Result<MoRef, Error>;

    async fn register_vm(
        &self,
        folder: &MoRef,
        vmx_path: &str,
        name: &str,
        pool: &MoRef,
        host: Option<&MoRef>,
    ) -> Result<MoRef, Error>;

    async fn register_child_vm(
        &self,
        vapp: &MoRef,
        vmx_path: &str,
        name: &str,
        host: Option<&MoRef>,
    ) -> Result<MoRef, Error>;

    async fn unregister_vm(&self, vm: &MoRef) -> Result<(), Error>;

    async fn vm_properties(&self, vm: &MoRef) -> Result<VmProperties, Error>;

    async fn reconfigure_vm(
        &self,
        vm: &MoRef,
        spec: &VmReconfigSpec,
    ) -> Result<(), Error>;

    async fn power_on(&self, vm: &MoRef) -> Result<(), Error>;

    async fn power_off(&self, vm: &MoRef) -> Result<(), Error>;

    async fn create_snapshot(
        &self,
        vm: &MoRef,
        name: &str,
        description: &str,
        memory: bool,
        quiesce: bool,
    ) -> Result<MoRef, Error>;

    async fn revert_to_snapshot(
        &self,
        snapshot: &MoRef,
        suppress_power_on: bool,
    ) -> Result<(), Error>;

    async fn remove_snapshot(
        &self,
        snapshot: &MoRef,
        remove_children: bool,
        consolidate: bool,
    ) -> Result<(), Error>;

    /// Starts a program through the guest operations API and returns its
    /// exit code.
    async fn run_guest_program(
        &self,
        vm: &MoRef,
        path: &str,
        args: &str,
    ) -> Result<i64, Error>;

    // Networks

    async fn network(&self, moref: &MoRef) -> Result<NetworkInfo, Error>;

    async fn add_port_group(
        &self,
        host: &MoRef,
        vswitch: &str,
        name: &str,
    ) -> Result<MoRef, Error>;

    async fn remove_port_group(
        &self,
        host: &MoRef,
        name: &str,
    ) -> Result<(), Error>;

    // Datastores

    async fn datastore(&self, name: &str) -> Result<DatastoreInfo, Error>;

    async fn make_directory(&self, path: &DatastorePath) -> Result<(), Error>;

    async fn upload_file(
        &self,
        local: &Utf8Path,
        dest: &DatastorePath,
    ) -> Result<(), Error>;

    async fn download_file(
        &self,
        path: &DatastorePath,
    ) -> Result<Vec<u8>, Error>;

    /// Lists the entries beneath `dir`, recursively if asked.  Fails with a
    /// `FileNotFound` fault if `dir` does not exist.
    async fn list_files(
        &self,
        dir: &DatastorePath,
        recursive: bool,
    ) -> Result<Vec<DatastorePath>, Error>;

    async fn delete_file(&self, path: &DatastorePath) -> Result<(), Error>;

    // Diagnostics

    /// Reads up to `lines` lines of the log `key` starting at line `start`,
    /// or to the end of the log when `lines` is zero.  A `start` past the
    /// end yields the header alone.
    async fn browse_log(
        &self,
        host: Option<&MoRef>,
        key: &str,
        start: i32,
        lines: i32,
    ) -> Result<LogHeader, Error>;
}
