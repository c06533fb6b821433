// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Managed-object model
//!
//! Hypervisor objects are only ever named by [`MoRef`]; the structures here
//! are property snapshots fetched through the [`crate::Hypervisor`] API.
//! Object families that come in several shapes (pools and vApps, standard
//! and distributed port-groups, local and vSAN datastores) are tagged
//! variants with a [`Capabilities`] set so that callers can stay
//! shape-agnostic.

use crate::datastore::DatastorePath;
use serde::{Deserialize, Serialize};
use vch_common::extraconfig::ExtraConfig;
use vch_common::MoRef;

pub const VIRTUAL_MACHINE: &str = "VirtualMachine";
pub const RESOURCE_POOL: &str = "ResourcePool";
pub const VIRTUAL_APP: &str = "VirtualApp";
pub const CLUSTER: &str = "ClusterComputeResource";
pub const COMPUTE_RESOURCE: &str = "ComputeResource";
pub const HOST: &str = "HostSystem";
pub const DATACENTER: &str = "Datacenter";
pub const FOLDER: &str = "Folder";
pub const DATASTORE: &str = "Datastore";
pub const NETWORK: &str = "Network";
pub const DISTRIBUTED_PORT_GROUP: &str = "DistributedVirtualPortgroup";
pub const OPAQUE_NETWORK: &str = "OpaqueNetwork";
pub const SNAPSHOT: &str = "VirtualMachineSnapshot";

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Orphaned,
    Inaccessible,
    Invalid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiType {
    VirtualCenter,
    HostAgent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct About {
    pub api_type: ApiType,
    pub instance_uuid: String,
    pub version: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub can_host_vms: bool,
    pub can_host_child_pools: bool,
    pub is_cluster_wide: bool,
}

/// Where VMs and pools may be placed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ComputeTarget {
    ResourcePool(MoRef),
    VirtualApp(MoRef),
    ClusterComputeResource(MoRef),
    HostSystem(MoRef),
}

impl ComputeTarget {
    pub fn from_moref(moref: &MoRef) -> Option<ComputeTarget> {
        let moref = moref.clone();
        match moref.kind.as_str() {
            RESOURCE_POOL => Some(ComputeTarget::ResourcePool(moref)),
            VIRTUAL_APP => Some(ComputeTarget::VirtualApp(moref)),
            CLUSTER => Some(ComputeTarget::ClusterComputeResource(moref)),
            HOST | COMPUTE_RESOURCE => Some(ComputeTarget::HostSystem(moref)),
            _ => None,
        }
    }

    pub fn moref(&self) -> &MoRef {
        match self {
            ComputeTarget::ResourcePool(m)
            | ComputeTarget::VirtualApp(m)
            | ComputeTarget::ClusterComputeResource(m)
            | ComputeTarget::HostSystem(m) => m,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            ComputeTarget::ResourcePool(_) => Capabilities {
                can_host_vms: true,
                can_host_child_pools: true,
                is_cluster_wide: false,
            },
            ComputeTarget::VirtualApp(_) => Capabilities {
                can_host_vms: true,
                can_host_child_pools: false,
                is_cluster_wide: false,
            },
            ComputeTarget::ClusterComputeResource(_) => Capabilities {
                can_host_vms: false,
                can_host_child_pools: false,
                is_cluster_wide: true,
            },
            ComputeTarget::HostSystem(_) => Capabilities::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkBacking {
    /// Host-local port-group on a standard switch
    Standard { name: String },
    Distributed { switch_uuid: String, port_group_key: String },
    Opaque { id: String, kind: String },
}

impl NetworkBacking {
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            can_host_vms: false,
            can_host_child_pools: false,
            is_cluster_wide: !matches!(self, NetworkBacking::Standard { .. }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkInfo {
    pub moref: MoRef,
    pub name: String,
    pub backing: NetworkBacking,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum DatastoreKind {
    Vmfs,
    Vsan,
    Nfs,
}

impl DatastoreKind {
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            can_host_vms: true,
            can_host_child_pools: false,
            is_cluster_wide: !matches!(self, DatastoreKind::Vmfs),
        }
    }

    /// Whether top-level directories are namespaces that must be emptied
    /// before they can be removed.
    pub fn is_namespace_managed(&self) -> bool {
        matches!(self, DatastoreKind::Vsan)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatastoreInfo {
    pub moref: MoRef,
    pub name: String,
    pub kind: DatastoreKind,
    pub url: String,
}

impl DatastoreInfo {
    pub fn path(&self, path: &str) -> DatastorePath {
        DatastorePath::new(&self.name, path)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagedEntity {
    pub moref: MoRef,
    pub name: String,
    pub parent: Option<MoRef>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VirtualDevice {
    EthernetCard { key: i32, network: MoRef, mac: String },
    Cdrom { key: i32, controller: i32, iso: Option<String> },
    IdeController { key: i32 },
    ScsiController { key: i32, model: String },
    Disk { key: i32, controller: i32, path: String },
}

impl VirtualDevice {
    pub fn key(&self) -> i32 {
        match self {
            VirtualDevice::EthernetCard { key, .. }
            | VirtualDevice::Cdrom { key, .. }
            | VirtualDevice::IdeController { key }
            | VirtualDevice::ScsiController { key, .. }
            | VirtualDevice::Disk { key, .. } => *key,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceChange {
    Add(VirtualDevice),
    Edit(VirtualDevice),
    Remove(VirtualDevice),
}

/// Everything needed to create a VM
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmCreateSpec {
    pub name: String,
    pub guest_id: String,
    pub num_cpus: Option<u32>,
    pub memory_mb: Option<u64>,
    /// Datastore on which the VM's folder is created, e.g. `[LocalDS_0]`
    pub vm_path_name: String,
    pub devices: Vec<VirtualDevice>,
    pub extra_config: ExtraConfig,
}

/// A change to an existing VM.  Extra-config entries with empty values
/// remove the key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmReconfigSpec {
    pub device_changes: Vec<DeviceChange>,
    pub extra_config: ExtraConfig,
}

impl VmReconfigSpec {
    pub fn is_empty(&self) -> bool {
        self.device_changes.is_empty() && self.extra_config.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotTree {
    pub snapshot: MoRef,
    pub name: String,
    pub description: String,
    pub children: Vec<SnapshotTree>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub current: Option<MoRef>,
    pub root: Vec<SnapshotTree>,
}

/// Snapshot of the properties of a VM the dispatcher cares about
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmProperties {
    pub moref: MoRef,
    pub name: String,
    pub uuid: String,
    pub power_state: PowerState,
    pub connection_state: ConnectionState,
    /// Path of the `.vmx`, e.g. `[LocalDS_0] vch1/vch1.vmx`
    pub vmx_path: String,
    pub folder: Option<MoRef>,
    pub resource_pool: Option<MoRef>,
    pub parent_vapp: Option<MoRef>,
    pub host: Option<MoRef>,
    pub tools_running: bool,
    pub extra_config: ExtraConfig,
    pub devices: Vec<VirtualDevice>,
    pub snapshot: Option<SnapshotInfo>,
}

/// Result of browsing a hypervisor log
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogHeader {
    pub line_start: i32,
    pub line_end: i32,
    pub lines: Vec<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn compute_targets_classify_by_kind() {
        let pool = MoRef::new(RESOURCE_POOL, "resgroup-1");
        let target = ComputeTarget::from_moref(&pool).unwrap();
        assert_eq!(target.moref(), &pool);
        assert!(target.capabilities().can_host_child_pools);

        let cluster = MoRef::new(CLUSTER, "domain-c7");
        let caps =
            ComputeTarget::from_moref(&cluster).unwrap().capabilities();
        assert!(caps.is_cluster_wide && !caps.can_host_vms);

        let ds = MoRef::new(DATASTORE, "ds");
        assert!(ComputeTarget::from_moref(&ds).is_none());
    }

    #[test]
    fn power_state_wire_names() {
        assert_eq!(PowerState::PoweredOn.to_string(), "poweredOn");
        assert_eq!(
            "poweredOff".parse::<PowerState>().unwrap(),
            PowerState::PoweredOff
        );
    }

    #[test]
    fn only_vsan_is_namespace_managed() {
        assert!(DatastoreKind::Vsan.is_namespace_managed());
        assert!(!DatastoreKind::Vmfs.is_namespace_managed());
        assert!(!DatastoreKind::Vmfs.capabilities().is_cluster_wide);
    }
}
