// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory [`Hypervisor`] for tests
//!
//! [`FakeHypervisor`] keeps a small inventory (one datacenter, one compute
//! resource with a root pool and a host, one datastore, one network) and
//! implements enough of the management API's behavior for the dispatcher to
//! be exercised end to end.  Tests can inject faults per operation, inspect
//! the calls made, and install a guest hook that runs when a VM powers on,
//! standing in for the in-guest components publishing their state.

use crate::datastore::DatastorePath;
use crate::fault::{Fault, FaultKind};
use crate::hypervisor::Hypervisor;
use crate::object::{
    About, ApiType, ConnectionState, DatastoreInfo, DatastoreKind,
    DeviceChange, LogHeader, ManagedEntity, NetworkBacking, NetworkInfo,
    PowerState, SnapshotInfo, SnapshotTree, VirtualDevice, VmCreateSpec,
    VmProperties, VmReconfigSpec, CLUSTER, COMPUTE_RESOURCE, DATACENTER,
    DATASTORE, FOLDER, HOST, NETWORK, RESOURCE_POOL, SNAPSHOT, VIRTUAL_APP,
    VIRTUAL_MACHINE,
};
use crate::Error;
use async_trait::async_trait;
use camino::Utf8Path;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use vch_common::config::Resources;
use vch_common::extraconfig::ExtraConfig;
use vch_common::MoRef;

pub const DATASTORE_NAME: &str = "LocalDS_0";
pub const NETWORK_NAME: &str = "VM Network";

/// Hypervisor operations, for fault injection and call accounting
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum Op {
    Entity,
    FindByInventoryPath,
    InventoryPath,
    Children,
    VmFolder,
    Hosts,
    CreateResourcePool,
    CreateVApp,
    PoolResources,
    UpdatePoolResources,
    Destroy,
    CreateVm,
    RegisterVm,
    RegisterChildVm,
    UnregisterVm,
    VmProperties,
    ReconfigureVm,
    PowerOn,
    PowerOff,
    CreateSnapshot,
    RevertToSnapshot,
    RemoveSnapshot,
    RunGuestProgram,
    Network,
    AddPortGroup,
    RemovePortGroup,
    Datastore,
    MakeDirectory,
    UploadFile,
    DownloadFile,
    ListFiles,
    DeleteFile,
    BrowseLog,
}

/// Invoked with the VM's name and guest-info when a VM powers on
pub type GuestHook = Arc<dyn Fn(&str, &mut ExtraConfig) + Send + Sync>;

#[derive(Clone, Debug)]
struct Entity {
    name: String,
    parent: Option<MoRef>,
}

#[derive(Clone, Debug)]
struct SavedState {
    vm: MoRef,
    power_state: PowerState,
    extra_config: ExtraConfig,
    devices: Vec<VirtualDevice>,
}

#[derive(Clone, Debug)]
struct Vm {
    name: String,
    uuid: String,
    power_state: PowerState,
    connection_state: ConnectionState,
    vmx_path: DatastorePath,
    folder: MoRef,
    pool: MoRef,
    host: Option<MoRef>,
    extra_config: ExtraConfig,
    devices: Vec<VirtualDevice>,
    snapshot: SnapshotInfo,
}

struct InjectedFault {
    op: Op,
    fault: Fault,
    remaining: usize,
}

struct Inventory {
    next_id: u64,
    entities: BTreeMap<MoRef, Entity>,
    vms: BTreeMap<MoRef, Vm>,
    pools: BTreeMap<MoRef, Resources>,
    networks: BTreeMap<MoRef, NetworkInfo>,
    datastores: BTreeMap<String, DatastoreInfo>,
    dirs: BTreeSet<DatastorePath>,
    files: BTreeMap<DatastorePath, Vec<u8>>,
    snapshots: BTreeMap<MoRef, SavedState>,
    logs: BTreeMap<String, Vec<String>>,
    // Unregistered VMs, by vmx path, so that they can be registered again
    parked: BTreeMap<DatastorePath, Vm>,
    guest_programs: BTreeMap<String, i64>,
    faults: Vec<InjectedFault>,
    calls: Vec<Op>,
    guest_hook: Option<GuestHook>,
}

impl Inventory {
    fn mint(&mut self, kind: &str, prefix: &str) -> MoRef {
        self.next_id += 1;
        MoRef::new(kind, format!("{}-{}", prefix, self.next_id))
    }

    fn add_entity(
        &mut self,
        kind: &str,
        prefix: &str,
        name: &str,
        parent: Option<&MoRef>,
    ) -> MoRef {
        let moref = self.mint(kind, prefix);
        self.entities.insert(
            moref.clone(),
            Entity { name: name.to_string(), parent: parent.cloned() },
        );
        moref
    }

    fn entity(&self, moref: &MoRef) -> Option<ManagedEntity> {
        if let Some(vm) = self.vms.get(moref) {
            return Some(ManagedEntity {
                moref: moref.clone(),
                name: vm.name.clone(),
                parent: Some(vm.folder.clone()),
            });
        }
        self.entities.get(moref).map(|e| ManagedEntity {
            moref: moref.clone(),
            name: e.name.clone(),
            parent: e.parent.clone(),
        })
    }

    fn path_of(&self, moref: &MoRef) -> Option<String> {
        let entity = self.entity(moref)?;
        match &entity.parent {
            Some(parent) => {
                Some(format!("{}/{}", self.path_of(parent)?, entity.name))
            }
            None => Some(format!("/{}", entity.name)),
        }
    }

    fn children(&self, parent: &MoRef) -> Vec<ManagedEntity> {
        let mut children: Vec<ManagedEntity> = self
            .entities
            .iter()
            .filter(|(_, e)| e.parent.as_ref() == Some(parent))
            .map(|(moref, e)| ManagedEntity {
                moref: moref.clone(),
                name: e.name.clone(),
                parent: e.parent.clone(),
            })
            .collect();
        children.extend(
            self.vms
                .iter()
                .filter(|(_, vm)| &vm.pool == parent || &vm.folder == parent)
                .filter_map(|(moref, _)| self.entity(moref)),
        );
        children
    }

    fn take_fault(&mut self, op: Op) -> Option<Fault> {
        self.calls.push(op);
        let injected = self
            .faults
            .iter_mut()
            .find(|f| f.op == op && f.remaining > 0)?;
        injected.remaining -= 1;
        Some(injected.fault.clone())
    }

    fn vm(&self, moref: &MoRef) -> Result<&Vm, Error> {
        self.vms.get(moref).ok_or_else(|| not_found(moref))
    }

    fn vm_mut(&mut self, moref: &MoRef) -> Result<&mut Vm, Error> {
        self.vms.get_mut(moref).ok_or_else(|| not_found(moref))
    }

    fn snapshot(&self, moref: &MoRef) -> Result<SavedState, Error> {
        self.snapshots.get(moref).cloned().ok_or_else(|| not_found(moref))
    }

    fn exists(&self, path: &DatastorePath) -> bool {
        path.is_root()
            || self.dirs.contains(path)
            || self.files.contains_key(path)
    }

    fn make_dirs(&mut self, path: &DatastorePath) {
        let mut dir = path.clone();
        while !dir.is_root() {
            self.dirs.insert(dir.clone());
            dir = dir.parent();
        }
    }

    fn write_file(&mut self, path: &DatastorePath, contents: Vec<u8>) {
        self.make_dirs(&path.parent());
        self.files.insert(path.clone(), contents);
    }

    fn write_vmx(&mut self, moref: &MoRef) {
        let Some(vm) = self.vms.get(moref) else {
            return;
        };
        let mut vmx = format!("displayName = \"{}\"\n", vm.name);
        for (key, value) in &vm.extra_config {
            vmx.push_str(&format!("{} = \"{}\"\n", key, value));
        }
        let path = vm.vmx_path.clone();
        self.write_file(&path, vmx.into_bytes());
    }

    fn network_by_name(&self, name: &str) -> Option<MoRef> {
        self.networks
            .iter()
            .find(|(_, n)| n.name == name)
            .map(|(moref, _)| moref.clone())
    }
}

fn not_found(moref: &MoRef) -> Error {
    Fault::vim(
        FaultKind::ManagedObjectNotFound,
        format!(
            "The object '{}' has already been deleted or has not been \
             completely created",
            moref
        ),
    )
    .into()
}

fn file_not_found(path: &DatastorePath) -> Error {
    Fault::vim(FaultKind::FileNotFound, format!("File {} was not found", path))
        .into()
}

pub struct FakeHypervisor {
    about: About,
    datacenter: MoRef,
    vm_folder: MoRef,
    compute: MoRef,
    root_pool: MoRef,
    host: MoRef,
    inner: Mutex<Inventory>,
}

impl FakeHypervisor {
    /// A vCenter with one cluster
    pub fn vcenter() -> Self {
        Self::build(ApiType::VirtualCenter)
    }

    /// A standalone ESX host
    pub fn esx() -> Self {
        Self::build(ApiType::HostAgent)
    }

    fn build(api_type: ApiType) -> Self {
        let mut inv = Inventory {
            next_id: 0,
            entities: BTreeMap::new(),
            vms: BTreeMap::new(),
            pools: BTreeMap::new(),
            networks: BTreeMap::new(),
            datastores: BTreeMap::new(),
            dirs: BTreeSet::new(),
            files: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            logs: BTreeMap::new(),
            parked: BTreeMap::new(),
            guest_programs: BTreeMap::new(),
            faults: Vec::new(),
            calls: Vec::new(),
            guest_hook: None,
        };

        let (dc_name, compute_kind, compute_name) = match api_type {
            ApiType::VirtualCenter => ("DC0", CLUSTER, "DC0_C0"),
            ApiType::HostAgent => {
                ("ha-datacenter", COMPUTE_RESOURCE, "localhost")
            }
        };
        let datacenter =
            inv.add_entity(DATACENTER, "datacenter", dc_name, None);
        let vm_folder =
            inv.add_entity(FOLDER, "group-v", "vm", Some(&datacenter));
        let host_folder =
            inv.add_entity(FOLDER, "group-h", "host", Some(&datacenter));
        let network_folder =
            inv.add_entity(FOLDER, "group-n", "network", Some(&datacenter));
        let datastore_folder =
            inv.add_entity(FOLDER, "group-s", "datastore", Some(&datacenter));
        let compute = inv.add_entity(
            compute_kind,
            "domain-c",
            compute_name,
            Some(&host_folder),
        );
        let root_pool = inv.add_entity(
            RESOURCE_POOL,
            "resgroup",
            "Resources",
            Some(&compute),
        );
        inv.pools.insert(root_pool.clone(), Resources::default());
        let host = inv.add_entity(HOST, "host", "host0", Some(&compute));

        let ds = inv.add_entity(
            DATASTORE,
            "datastore",
            DATASTORE_NAME,
            Some(&datastore_folder),
        );
        inv.datastores.insert(
            DATASTORE_NAME.to_string(),
            DatastoreInfo {
                moref: ds,
                name: DATASTORE_NAME.to_string(),
                kind: DatastoreKind::Vmfs,
                url: format!("ds:///vmfs/volumes/{}/", DATASTORE_NAME),
            },
        );

        let net = inv.add_entity(
            NETWORK,
            "network",
            NETWORK_NAME,
            Some(&network_folder),
        );
        inv.networks.insert(
            net.clone(),
            NetworkInfo {
                moref: net,
                name: NETWORK_NAME.to_string(),
                backing: NetworkBacking::Standard {
                    name: NETWORK_NAME.to_string(),
                },
            },
        );

        let about = About {
            api_type,
            instance_uuid: match api_type {
                ApiType::VirtualCenter => {
                    "dbed6e0c-bd88-4ef6-b594-21283e1c677f".to_string()
                }
                ApiType::HostAgent => String::new(),
            },
            version: "6.5.0".to_string(),
        };

        FakeHypervisor {
            about,
            datacenter,
            vm_folder,
            compute,
            root_pool,
            host,
            inner: Mutex::new(inv),
        }
    }

    pub fn datacenter(&self) -> MoRef {
        self.datacenter.clone()
    }

    /// The cluster (vCenter) or compute resource (ESX)
    pub fn compute_resource(&self) -> MoRef {
        self.compute.clone()
    }

    pub fn root_pool(&self) -> MoRef {
        self.root_pool.clone()
    }

    pub fn host(&self) -> MoRef {
        self.host.clone()
    }

    pub fn network_ref(&self, name: &str) -> Option<MoRef> {
        self.inner.lock().unwrap().network_by_name(name)
    }

    /// Adds a distributed port-group named `name`.
    pub fn add_distributed_network(&self, name: &str) -> MoRef {
        let mut inv = self.inner.lock().unwrap();
        let folder = inv
            .entities
            .iter()
            .find(|(m, e)| m.kind == FOLDER && e.name == "network")
            .map(|(m, _)| m.clone());
        let moref = inv.add_entity(
            crate::object::DISTRIBUTED_PORT_GROUP,
            "dvportgroup",
            name,
            folder.as_ref(),
        );
        inv.networks.insert(
            moref.clone(),
            NetworkInfo {
                moref: moref.clone(),
                name: name.to_string(),
                backing: NetworkBacking::Distributed {
                    switch_uuid: "50 36 6b 2c".to_string(),
                    port_group_key: moref.value.clone(),
                },
            },
        );
        moref
    }

    /// Adds a powered-off VM with no guest-info to `pool`.
    pub fn add_vm(&self, name: &str, pool: &MoRef) -> MoRef {
        let mut inv = self.inner.lock().unwrap();
        let moref = inv.mint(VIRTUAL_MACHINE, "vm");
        let uuid = format!("4201{:028x}", inv.next_id);
        let dir = DatastorePath::new(DATASTORE_NAME, name);
        inv.make_dirs(&dir);
        inv.vms.insert(
            moref.clone(),
            Vm {
                name: name.to_string(),
                uuid,
                power_state: PowerState::PoweredOff,
                connection_state: ConnectionState::Connected,
                vmx_path: dir.join(&format!("{}.vmx", name)),
                folder: self.vm_folder.clone(),
                pool: pool.clone(),
                host: Some(self.host.clone()),
                extra_config: ExtraConfig::new(),
                devices: Vec::new(),
                snapshot: SnapshotInfo::default(),
            },
        );
        inv.write_vmx(&moref);
        moref
    }

    pub fn set_connection_state(&self, vm: &MoRef, state: ConnectionState) {
        if let Some(vm) = self.inner.lock().unwrap().vms.get_mut(vm) {
            vm.connection_state = state;
        }
    }

    pub fn set_power_state(&self, vm: &MoRef, state: PowerState) {
        if let Some(vm) = self.inner.lock().unwrap().vms.get_mut(vm) {
            vm.power_state = state;
        }
    }

    pub fn set_extra_config(&self, vm: &MoRef, key: &str, value: &str) {
        let mut inv = self.inner.lock().unwrap();
        if let Some(state) = inv.vms.get_mut(vm) {
            state.extra_config.insert(key.to_string(), value.to_string());
        }
        inv.write_vmx(vm);
    }

    pub fn extra_config(&self, vm: &MoRef) -> Option<ExtraConfig> {
        self.inner.lock().unwrap().vms.get(vm).map(|v| v.extra_config.clone())
    }

    pub fn vm_power_state(&self, vm: &MoRef) -> Option<PowerState> {
        self.inner.lock().unwrap().vms.get(vm).map(|v| v.power_state)
    }

    /// Current and total snapshot names of `vm`
    pub fn snapshot_names(&self, vm: &MoRef) -> Vec<String> {
        let inv = self.inner.lock().unwrap();
        let Some(vm) = inv.vms.get(vm) else {
            return Vec::new();
        };
        let mut names = Vec::new();
        let mut stack: Vec<&SnapshotTree> = vm.snapshot.root.iter().collect();
        while let Some(node) = stack.pop() {
            names.push(node.name.clone());
            stack.extend(node.children.iter());
        }
        names.sort();
        names
    }

    pub fn vm_count(&self) -> usize {
        self.inner.lock().unwrap().vms.len()
    }

    pub fn pool_exists(&self, pool: &MoRef) -> bool {
        self.inner.lock().unwrap().pools.contains_key(pool)
    }

    pub fn add_file(&self, path: &DatastorePath, contents: &[u8]) {
        self.inner.lock().unwrap().write_file(path, contents.to_vec());
    }

    pub fn add_dir(&self, path: &DatastorePath) {
        self.inner.lock().unwrap().make_dirs(path);
    }

    pub fn file_exists(&self, path: &DatastorePath) -> bool {
        self.inner.lock().unwrap().exists(path)
    }

    pub fn set_log(&self, key: &str, lines: Vec<String>) {
        self.inner.lock().unwrap().logs.insert(key.to_string(), lines);
    }

    pub fn append_log(&self, key: &str, lines: &[&str]) {
        let mut inv = self.inner.lock().unwrap();
        let log = inv.logs.entry(key.to_string()).or_default();
        log.extend(lines.iter().map(|l| l.to_string()));
    }

    pub fn set_guest_program_result(&self, path: &str, code: i64) {
        self.inner
            .lock()
            .unwrap()
            .guest_programs
            .insert(path.to_string(), code);
    }

    pub fn set_guest_hook(&self, hook: GuestHook) {
        self.inner.lock().unwrap().guest_hook = Some(hook);
    }

    /// Fails the next `count` calls of `op` with `fault`.
    pub fn inject_fault(&self, op: Op, fault: Fault, count: usize) {
        self.inner.lock().unwrap().faults.push(InjectedFault {
            op,
            fault,
            remaining: count,
        });
    }

    pub fn calls(&self) -> Vec<Op> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn count(&self, op: Op) -> usize {
        self.inner.lock().unwrap().calls.iter().filter(|c| **c == op).count()
    }

    fn begin(
        &self,
        op: Op,
    ) -> Result<std::sync::MutexGuard<'_, Inventory>, Error> {
        let mut inv = self.inner.lock().unwrap();
        match inv.take_fault(op) {
            Some(fault) => Err(fault.into()),
            None => Ok(inv),
        }
    }
}

fn duplicate(name: &str) -> Error {
    Fault::vim(
        FaultKind::DuplicateName,
        format!("The name '{}' already exists.", name),
    )
    .into()
}

fn invalid_power_state(state: PowerState) -> Error {
    Fault::task(
        FaultKind::InvalidPowerState,
        format!(
            "The attempted operation cannot be performed in the current \
             state ({}).",
            state
        ),
    )
    .into()
}

fn assign_keys(inv: &mut Inventory, devices: &mut [VirtualDevice]) {
    for device in devices.iter_mut() {
        inv.next_id += 1;
        let next = i32::try_from(inv.next_id).unwrap_or(i32::MAX);
        match device {
            VirtualDevice::EthernetCard { key, mac, .. } => {
                if *key <= 0 {
                    *key = 4000 + next;
                }
                if mac.is_empty() {
                    *mac = format!(
                        "00:50:56:{:02x}:{:02x}:{:02x}",
                        (next >> 16) & 0xff,
                        (next >> 8) & 0xff,
                        next & 0xff
                    );
                }
            }
            VirtualDevice::Cdrom { key, .. }
            | VirtualDevice::IdeController { key }
            | VirtualDevice::ScsiController { key, .. }
            | VirtualDevice::Disk { key, .. } => {
                if *key <= 0 {
                    *key = 1000 + next;
                }
            }
        }
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    fn about(&self) -> About {
        self.about.clone()
    }

    async fn entity(&self, moref: &MoRef) -> Result<ManagedEntity, Error> {
        let inv = self.begin(Op::Entity)?;
        inv.entity(moref).ok_or_else(|| not_found(moref))
    }

    async fn find_by_inventory_path(
        &self,
        path: &str,
    ) -> Result<Option<MoRef>, Error> {
        let inv = self.begin(Op::FindByInventoryPath)?;
        let path = path.trim_end_matches('/');
        let found = inv
            .entities
            .keys()
            .chain(inv.vms.keys())
            .find(|moref| inv.path_of(moref).as_deref() == Some(path))
            .cloned();
        Ok(found)
    }

    async fn inventory_path(&self, moref: &MoRef) -> Result<String, Error> {
        let inv = self.begin(Op::InventoryPath)?;
        inv.path_of(moref).ok_or_else(|| not_found(moref))
    }

    async fn children(
        &self,
        parent: &MoRef,
    ) -> Result<Vec<ManagedEntity>, Error> {
        let inv = self.begin(Op::Children)?;
        if inv.entity(parent).is_none() {
            return Err(not_found(parent));
        }
        Ok(inv.children(parent))
    }

    async fn vm_folder(&self, datacenter: &MoRef) -> Result<MoRef, Error> {
        let _inv = self.begin(Op::VmFolder)?;
        if *datacenter != self.datacenter {
            return Err(not_found(datacenter));
        }
        Ok(self.vm_folder.clone())
    }

    async fn hosts(&self, compute: &MoRef) -> Result<Vec<MoRef>, Error> {
        let inv = self.begin(Op::Hosts)?;
        let mut current = Some(compute.clone());
        while let Some(moref) = current {
            if moref.kind == CLUSTER || moref.kind == COMPUTE_RESOURCE {
                return Ok(inv
                    .children(&moref)
                    .into_iter()
                    .map(|e| e.moref)
                    .filter(|m| m.kind == HOST)
                    .collect());
            }
            if moref.kind == HOST {
                return Ok(vec![moref]);
            }
            current = inv.entity(&moref).and_then(|e| e.parent);
        }
        Err(not_found(compute))
    }

    async fn create_resource_pool(
        &self,
        parent: &MoRef,
        name: &str,
        resources: &Resources,
    ) -> Result<MoRef, Error> {
        let mut inv = self.begin(Op::CreateResourcePool)?;
        if !inv.pools.contains_key(parent) {
            return Err(not_found(parent));
        }
        if inv.children(parent).iter().any(|c| c.name == name) {
            return Err(duplicate(name));
        }
        let pool =
            inv.add_entity(RESOURCE_POOL, "resgroup", name, Some(parent));
        inv.pools.insert(pool.clone(), resources.clone());
        Ok(pool)
    }

    async fn create_vapp(
        &self,
        parent: &MoRef,
        name: &str,
        resources: &Resources,
        folder: &MoRef,
    ) -> Result<MoRef, Error> {
        let mut inv = self.begin(Op::CreateVApp)?;
        if self.about.api_type != ApiType::VirtualCenter {
            return Err(Fault::vim(
                FaultKind::Other("NotSupported".to_string()),
                "vApps require vCenter",
            )
            .into());
        }
        if !inv.pools.contains_key(parent) || inv.entity(folder).is_none() {
            return Err(not_found(parent));
        }
        if inv.children(parent).iter().any(|c| c.name == name) {
            return Err(duplicate(name));
        }
        let vapp =
            inv.add_entity(VIRTUAL_APP, "resgroup-v", name, Some(parent));
        inv.pools.insert(vapp.clone(), resources.clone());
        Ok(vapp)
    }

    async fn pool_resources(&self, pool: &MoRef) -> Result<Resources, Error> {
        let inv = self.begin(Op::PoolResources)?;
        inv.pools.get(pool).cloned().ok_or_else(|| not_found(pool))
    }

    async fn update_pool_resources(
        &self,
        pool: &MoRef,
        resources: &Resources,
    ) -> Result<(), Error> {
        let mut inv = self.begin(Op::UpdatePoolResources)?;
        let current = inv.pools.get_mut(pool).ok_or_else(|| not_found(pool))?;
        *current = resources.clone();
        Ok(())
    }

    async fn destroy(&self, moref: &MoRef) -> Result<(), Error> {
        let mut inv = self.begin(Op::Destroy)?;
        if let Some(vm) = inv.vms.get(moref) {
            if vm.power_state != PowerState::PoweredOff {
                return Err(invalid_power_state(vm.power_state));
            }
            let dir = vm.vmx_path.parent();
            inv.vms.remove(moref);
            inv.snapshots.retain(|_, s| &s.vm != moref);
            // Destroying a VM removes its own files but leaves uploads.
            inv.files.retain(|path, _| {
                !dir.contains(path) || path.file_name().ends_with(".iso")
            });
            return Ok(());
        }
        if inv.pools.contains_key(moref) {
            if !inv.children(moref).is_empty() {
                return Err(Fault::task(
                    FaultKind::ResourceInUse,
                    format!("{} is not empty", moref),
                )
                .into());
            }
            inv.pools.remove(moref);
            inv.entities.remove(moref);
            return Ok(());
        }
        Err(not_found(moref))
    }

    async fn create_vm(
        &self,
        folder: &MoRef,
        pool: &MoRef,
        host: Option<&MoRef>,
        spec: &VmCreateSpec,
    ) -> Result<MoRef, Error> {
        let mut inv = self.begin(Op::CreateVm)?;
        if !inv.pools.contains_key(pool) {
            return Err(not_found(pool));
        }
        if inv
            .vms
            .values()
            .any(|vm| vm.name == spec.name && &vm.folder == folder)
        {
            return Err(duplicate(&spec.name));
        }
        let datastore: DatastorePath = spec.vm_path_name.parse()?;
        if !inv.datastores.contains_key(&datastore.datastore) {
            return Err(Error::not_found("datastore", &datastore.datastore));
        }

        // Like the real thing, pick a fresh directory if the name is taken.
        let mut dir = datastore.join(&spec.name);
        let mut suffix = 0;
        while inv.exists(&dir) {
            suffix += 1;
            dir = datastore.join(&format!("{}_{}", spec.name, suffix));
        }
        inv.make_dirs(&dir);

        let mut devices = spec.devices.clone();
        assign_keys(&mut inv, &mut devices);
        let moref = inv.mint(VIRTUAL_MACHINE, "vm");
        let uuid = format!("4201{:028x}", inv.next_id);
        inv.vms.insert(
            moref.clone(),
            Vm {
                name: spec.name.clone(),
                uuid,
                power_state: PowerState::PoweredOff,
                connection_state: ConnectionState::Connected,
                vmx_path: dir.join(&format!("{}.vmx", spec.name)),
                folder: folder.clone(),
                pool: pool.clone(),
                host: host.cloned().or_else(|| Some(self.host.clone())),
                extra_config: spec.extra_config.clone(),
                devices,
                snapshot: SnapshotInfo::default(),
            },
        );
        inv.write_vmx(&moref);
        Ok(moref)
    }

    async fn register_vm(
        &self,
        folder: &MoRef,
        vmx_path: &str,
        name: &str,
        pool: &MoRef,
        host: Option<&MoRef>,
    ) -> Result<MoRef, Error> {
        let mut inv = self.begin(Op::RegisterVm)?;
        register(&mut inv, folder, vmx_path, name, pool, host)
    }

    async fn register_child_vm(
        &self,
        vapp: &MoRef,
        vmx_path: &str,
        name: &str,
        host: Option<&MoRef>,
    ) -> Result<MoRef, Error> {
        let mut inv = self.begin(Op::RegisterChildVm)?;
        let folder = self.vm_folder.clone();
        register(&mut inv, &folder, vmx_path, name, vapp, host)
    }

    async fn unregister_vm(&self, vm: &MoRef) -> Result<(), Error> {
        let mut inv = self.begin(Op::UnregisterVm)?;
        let state = inv.vms.remove(vm).ok_or_else(|| not_found(vm))?;
        inv.parked.insert(state.vmx_path.clone(), state);
        Ok(())
    }

    async fn vm_properties(&self, vm: &MoRef) -> Result<VmProperties, Error> {
        let inv = self.begin(Op::VmProperties)?;
        let state = inv.vm(vm)?;
        let parent_vapp =
            (state.pool.kind == VIRTUAL_APP).then(|| state.pool.clone());
        Ok(VmProperties {
            moref: vm.clone(),
            name: state.name.clone(),
            uuid: state.uuid.clone(),
            power_state: state.power_state,
            connection_state: state.connection_state,
            vmx_path: state.vmx_path.to_string(),
            folder: Some(state.folder.clone()),
            resource_pool: Some(state.pool.clone()),
            parent_vapp,
            host: state.host.clone(),
            tools_running: state.power_state == PowerState::PoweredOn,
            extra_config: state.extra_config.clone(),
            devices: state.devices.clone(),
            snapshot: (!state.snapshot.root.is_empty())
                .then(|| state.snapshot.clone()),
        })
    }

    async fn reconfigure_vm(
        &self,
        vm: &MoRef,
        spec: &VmReconfigSpec,
    ) -> Result<(), Error> {
        let mut inv = self.begin(Op::ReconfigureVm)?;
        let mut changes = spec.device_changes.clone();
        let mut added: Vec<VirtualDevice> = changes
            .iter()
            .filter_map(|c| match c {
                DeviceChange::Add(d) => Some(d.clone()),
                _ => None,
            })
            .collect();
        assign_keys(&mut inv, &mut added);
        changes.retain(|c| !matches!(c, DeviceChange::Add(_)));

        let state = inv.vm_mut(vm)?;
        for change in changes {
            match change {
                DeviceChange::Edit(device) => {
                    let key = device.key();
                    if let Some(d) =
                        state.devices.iter_mut().find(|d| d.key() == key)
                    {
                        *d = device;
                    }
                }
                DeviceChange::Remove(device) => {
                    state.devices.retain(|d| d.key() != device.key());
                }
                DeviceChange::Add(_) => {}
            }
        }
        state.devices.extend(added);
        for (key, value) in &spec.extra_config {
            if value.is_empty() {
                state.extra_config.remove(key);
            } else {
                state.extra_config.insert(key.clone(), value.clone());
            }
        }
        inv.write_vmx(vm);
        Ok(())
    }

    async fn power_on(&self, vm: &MoRef) -> Result<(), Error> {
        let mut inv = self.begin(Op::PowerOn)?;
        let hook = inv.guest_hook.clone();
        let state = inv.vm_mut(vm)?;
        if state.power_state == PowerState::PoweredOn {
            return Err(invalid_power_state(state.power_state));
        }
        state.power_state = PowerState::PoweredOn;
        if let Some(hook) = hook {
            hook(&state.name, &mut state.extra_config);
        }
        inv.write_vmx(vm);
        Ok(())
    }

    async fn power_off(&self, vm: &MoRef) -> Result<(), Error> {
        let mut inv = self.begin(Op::PowerOff)?;
        let state = inv.vm_mut(vm)?;
        if state.power_state == PowerState::PoweredOff {
            return Err(invalid_power_state(state.power_state));
        }
        state.power_state = PowerState::PoweredOff;
        Ok(())
    }

    async fn create_snapshot(
        &self,
        vm: &MoRef,
        name: &str,
        description: &str,
        _memory: bool,
        _quiesce: bool,
    ) -> Result<MoRef, Error> {
        let mut inv = self.begin(Op::CreateSnapshot)?;
        inv.vm(vm)?;
        let snapshot = inv.mint(SNAPSHOT, "snapshot");
        let state = inv.vm_mut(vm)?;
        let node = SnapshotTree {
            snapshot: snapshot.clone(),
            name: name.to_string(),
            description: description.to_string(),
            children: Vec::new(),
        };
        let current = state.snapshot.current.clone();
        match current.and_then(|c| find_mut(&mut state.snapshot.root, &c)) {
            Some(parent) => parent.children.push(node),
            None => state.snapshot.root.push(node),
        }
        state.snapshot.current = Some(snapshot.clone());
        let saved = SavedState {
            vm: vm.clone(),
            power_state: state.power_state,
            extra_config: state.extra_config.clone(),
            devices: state.devices.clone(),
        };
        inv.snapshots.insert(snapshot.clone(), saved);
        Ok(snapshot)
    }

    async fn revert_to_snapshot(
        &self,
        snapshot: &MoRef,
        suppress_power_on: bool,
    ) -> Result<(), Error> {
        let mut inv = self.begin(Op::RevertToSnapshot)?;
        let saved = inv.snapshot(snapshot)?;
        let state = inv.vm_mut(&saved.vm)?;
        state.extra_config = saved.extra_config;
        state.devices = saved.devices;
        // Snapshots never include memory, so a revert powers the VM off.
        state.power_state = if saved.power_state == PowerState::PoweredOn
            && !suppress_power_on
        {
            PowerState::PoweredOn
        } else {
            PowerState::PoweredOff
        };
        state.snapshot.current = Some(snapshot.clone());
        inv.write_vmx(&saved.vm);
        Ok(())
    }

    async fn remove_snapshot(
        &self,
        snapshot: &MoRef,
        remove_children: bool,
        _consolidate: bool,
    ) -> Result<(), Error> {
        let mut inv = self.begin(Op::RemoveSnapshot)?;
        let saved = inv.snapshot(snapshot)?;
        let state = inv.vm_mut(&saved.vm)?;
        let parent = parent_of(&state.snapshot.root, snapshot);
        let removed =
            remove_node(&mut state.snapshot.root, snapshot, remove_children);
        let orphaned = state
            .snapshot
            .current
            .as_ref()
            .is_some_and(|c| c == snapshot || removed.contains(c));
        if orphaned {
            state.snapshot.current = parent;
        }
        for r in removed {
            inv.snapshots.remove(&r);
        }
        Ok(())
    }

    async fn run_guest_program(
        &self,
        vm: &MoRef,
        path: &str,
        _args: &str,
    ) -> Result<i64, Error> {
        let inv = self.begin(Op::RunGuestProgram)?;
        let state = inv.vm(vm)?;
        if state.power_state != PowerState::PoweredOn {
            return Err(Fault::vim(
                FaultKind::GuestOperationsUnavailable,
                "The guest operations agent could not be contacted.",
            )
            .into());
        }
        Ok(inv.guest_programs.get(path).copied().unwrap_or(0))
    }

    async fn network(&self, moref: &MoRef) -> Result<NetworkInfo, Error> {
        let inv = self.begin(Op::Network)?;
        inv.networks.get(moref).cloned().ok_or_else(|| not_found(moref))
    }

    async fn add_port_group(
        &self,
        host: &MoRef,
        _vswitch: &str,
        name: &str,
    ) -> Result<MoRef, Error> {
        let mut inv = self.begin(Op::AddPortGroup)?;
        if inv.entity(host).is_none() {
            return Err(not_found(host));
        }
        if inv.network_by_name(name).is_some() {
            return Err(Fault::vim(
                FaultKind::Other("AlreadyExists".to_string()),
                format!("port-group {} already exists", name),
            )
            .into());
        }
        let moref = inv.add_entity(NETWORK, "network", name, None);
        inv.networks.insert(
            moref.clone(),
            NetworkInfo {
                moref: moref.clone(),
                name: name.to_string(),
                backing: NetworkBacking::Standard { name: name.to_string() },
            },
        );
        Ok(moref)
    }

    async fn remove_port_group(
        &self,
        _host: &MoRef,
        name: &str,
    ) -> Result<(), Error> {
        let mut inv = self.begin(Op::RemovePortGroup)?;
        let moref = inv
            .network_by_name(name)
            .ok_or_else(|| Error::not_found("port-group", name))?;
        inv.networks.remove(&moref);
        inv.entities.remove(&moref);
        Ok(())
    }

    async fn datastore(&self, name: &str) -> Result<DatastoreInfo, Error> {
        let inv = self.begin(Op::Datastore)?;
        inv.datastores
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("datastore", name))
    }

    async fn make_directory(&self, path: &DatastorePath) -> Result<(), Error> {
        let mut inv = self.begin(Op::MakeDirectory)?;
        if inv.exists(path) {
            return Err(Fault::vim(
                FaultKind::FileAlreadyExists,
                format!(
                    "Cannot complete the operation because the file or \
                     folder {} already exists",
                    path
                ),
            )
            .into());
        }
        inv.make_dirs(path);
        Ok(())
    }

    async fn upload_file(
        &self,
        local: &Utf8Path,
        dest: &DatastorePath,
    ) -> Result<(), Error> {
        let contents = std::fs::read(local).map_err(|e| {
            Error::from(Fault::vim(
                FaultKind::FileNotFound,
                format!("{}: {}", local, e),
            ))
        })?;
        let mut inv = self.begin(Op::UploadFile)?;
        inv.write_file(dest, contents);
        Ok(())
    }

    async fn download_file(
        &self,
        path: &DatastorePath,
    ) -> Result<Vec<u8>, Error> {
        let inv = self.begin(Op::DownloadFile)?;
        inv.files.get(path).cloned().ok_or_else(|| file_not_found(path))
    }

    async fn list_files(
        &self,
        dir: &DatastorePath,
        recursive: bool,
    ) -> Result<Vec<DatastorePath>, Error> {
        let inv = self.begin(Op::ListFiles)?;
        if !dir.is_root() && !inv.dirs.contains(dir) {
            return Err(file_not_found(dir));
        }
        let depth = |p: &DatastorePath| p.path.matches('/').count();
        let base = if dir.is_root() { 0 } else { depth(dir) + 1 };
        Ok(inv
            .dirs
            .iter()
            .chain(inv.files.keys())
            .filter(|p| *p != dir && dir.contains(p))
            .filter(|p| recursive || depth(p) == base)
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect())
    }

    async fn delete_file(&self, path: &DatastorePath) -> Result<(), Error> {
        let mut inv = self.begin(Op::DeleteFile)?;
        if !inv.exists(path) || path.is_root() {
            return Err(file_not_found(path));
        }
        inv.dirs.retain(|p| !path.contains(p));
        inv.files.retain(|p, _| !path.contains(p));
        Ok(())
    }

    async fn browse_log(
        &self,
        _host: Option<&MoRef>,
        key: &str,
        start: i32,
        lines: i32,
    ) -> Result<LogHeader, Error> {
        let inv = self.begin(Op::BrowseLog)?;
        let log = inv.logs.get(key).ok_or_else(|| {
            Error::from(Fault::vim(
                FaultKind::InvalidArgument,
                format!("unknown log key {:?}", key),
            ))
        })?;
        let end = i32::try_from(log.len()).unwrap_or(i32::MAX);
        let start = start.max(0);
        if start >= end {
            return Ok(LogHeader {
                line_start: start,
                line_end: end,
                lines: vec![],
            });
        }
        let stop = if lines <= 0 {
            end
        } else {
            end.min(start.saturating_add(lines))
        };
        let selected = log[start as usize..stop as usize].to_vec();
        Ok(LogHeader { line_start: start, line_end: stop, lines: selected })
    }
}

fn register(
    inv: &mut Inventory,
    folder: &MoRef,
    vmx_path: &str,
    name: &str,
    pool: &MoRef,
    host: Option<&MoRef>,
) -> Result<MoRef, Error> {
    let path: DatastorePath = vmx_path.parse()?;
    if !inv.files.contains_key(&path) {
        return Err(file_not_found(&path));
    }
    let mut vm = inv.parked.remove(&path).ok_or_else(|| file_not_found(&path))?;
    vm.name = name.to_string();
    vm.folder = folder.clone();
    vm.pool = pool.clone();
    vm.host = host.cloned().or(vm.host);
    vm.connection_state = ConnectionState::Connected;
    let moref = inv.mint(VIRTUAL_MACHINE, "vm");
    inv.vms.insert(moref.clone(), vm);
    Ok(moref)
}

fn find_mut<'a>(
    nodes: &'a mut [SnapshotTree],
    target: &MoRef,
) -> Option<&'a mut SnapshotTree> {
    for node in nodes.iter_mut() {
        if &node.snapshot == target {
            return Some(node);
        }
        if let Some(found) = find_mut(&mut node.children, target) {
            return Some(found);
        }
    }
    None
}

fn parent_of(nodes: &[SnapshotTree], target: &MoRef) -> Option<MoRef> {
    for node in nodes {
        if node.children.iter().any(|c| &c.snapshot == target) {
            return Some(node.snapshot.clone());
        }
        if let Some(found) = parent_of(&node.children, target) {
            return Some(found);
        }
    }
    None
}

/// Removes `target`, promoting its children unless they go too.  Returns
/// the removed snapshots.
fn remove_node(
    nodes: &mut Vec<SnapshotTree>,
    target: &MoRef,
    remove_children: bool,
) -> Vec<MoRef> {
    if let Some(pos) = nodes.iter().position(|n| &n.snapshot == target) {
        let node = nodes.remove(pos);
        let mut removed = vec![node.snapshot.clone()];
        if remove_children {
            let mut stack = node.children;
            while let Some(child) = stack.pop() {
                removed.push(child.snapshot.clone());
                stack.extend(child.children);
            }
        } else {
            for (i, child) in node.children.into_iter().enumerate() {
                nodes.insert(pos + i, child);
            }
        }
        return removed;
    }
    for node in nodes.iter_mut() {
        let removed = remove_node(&mut node.children, target, remove_children);
        if !removed.is_empty() {
            return removed;
        }
    }
    Vec::new()
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn injected_faults_are_consumed() {
        let hv = FakeHypervisor::vcenter();
        hv.inject_fault(
            Op::PowerOn,
            Fault::task(FaultKind::TaskInProgress, "busy"),
            1,
        );
        let vm = hv.add_vm("vch1", &hv.root_pool());
        assert!(hv.power_on(&vm).await.is_err());
        hv.power_on(&vm).await.unwrap();
        assert_eq!(hv.count(Op::PowerOn), 2);
    }

    #[tokio::test]
    async fn snapshots_revert_guest_info() {
        let hv = FakeHypervisor::esx();
        let vm = hv.add_vm("vch1", &hv.root_pool());
        hv.set_extra_config(&vm, "guestinfo.a", "1");
        let snap =
            hv.create_snapshot(&vm, "s1", "", false, false).await.unwrap();
        hv.set_extra_config(&vm, "guestinfo.a", "2");

        hv.revert_to_snapshot(&snap, true).await.unwrap();
        assert_eq!(hv.extra_config(&vm).unwrap()["guestinfo.a"], "1");

        hv.remove_snapshot(&snap, false, true).await.unwrap();
        assert!(hv.snapshot_names(&vm).is_empty());
        assert!(hv.vm_properties(&vm).await.unwrap().snapshot.is_none());
    }

    #[tokio::test]
    async fn listing_is_shallow_unless_recursive() {
        let hv = FakeHypervisor::esx();
        let root = DatastorePath::new(DATASTORE_NAME, "VIC");
        hv.add_file(&root.join("a/b/c.vmdk"), b"disk");
        hv.add_dir(&root.join("d"));

        let shallow = hv.list_files(&root, false).await.unwrap();
        assert_eq!(shallow, vec![root.join("a"), root.join("d")]);
        let deep = hv.list_files(&root, true).await.unwrap();
        assert_eq!(deep.len(), 4);

        hv.delete_file(&root.join("a")).await.unwrap();
        assert!(!hv.file_exists(&root.join("a/b/c.vmdk")));
        let err = hv.list_files(&root.join("a"), false).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn log_browsing_honors_cursor() {
        let hv = FakeHypervisor::vcenter();
        hv.append_log("vpxd:vpxd.log", &["one", "two", "three"]);
        let header =
            hv.browse_log(None, "vpxd:vpxd.log", i32::MAX, 0).await.unwrap();
        assert_eq!(header.line_end, 3);
        assert!(header.lines.is_empty());

        hv.append_log("vpxd:vpxd.log", &["four"]);
        let tail = hv.browse_log(None, "vpxd:vpxd.log", 3, 0).await.unwrap();
        assert_eq!(tail.lines, vec!["four".to_string()]);
    }
}
