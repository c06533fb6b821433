// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lifecycle of a VCH against the in-memory hypervisor, with a stand-in for
//! the Docker API the appliance would serve.

use camino::Utf8PathBuf;
use camino_tempfile::Utf8TempDir;
use dropshot::{
    endpoint, ApiDescription, Body, ConfigDropshot, FreeformBody, HttpError,
    HttpResponseOk, HttpServer, RequestContext, ServerBuilder,
};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vch_common::config::{
    NetworkEndpoint, VcApiStatus, VchConfigSpec, Version, BRIDGE_NETWORK,
    CLIENT_IP_KEY, CLIENT_NETWORK, UPDATE_IN_PROGRESS_KEY,
};
use vch_common::extraconfig::ExtraConfig;
use vch_common::MoRef;
use vch_lifecycle::{
    DeleteContainers, DeleteVolumeStores, Dispatcher, Error, InstallerData,
};
use vch_test_utils::dev::{test_setup_log, LogContext};
use vsphere_utils::datastore::DatastorePath;
use vsphere_utils::fakes::{FakeHypervisor, Op, DATASTORE_NAME, NETWORK_NAME};
use vsphere_utils::object::{PowerState, RESOURCE_POOL, VIRTUAL_APP};
use vsphere_utils::{Context, Fault, FaultKind, Hypervisor, VirtualMachine};

const VCH_NAME: &str = "vch1";
const BRIDGE_PORT_GROUP: &str = "vch1-bridge";

/// What the stand-in Docker API reports
struct VchApi {
    running: AtomicBool,
}

#[endpoint {
    method = GET,
    path = "/info",
}]
async fn docker_info(
    rqctx: RequestContext<Arc<VchApi>>,
) -> Result<HttpResponseOk<FreeformBody>, HttpError> {
    let state = if rqctx.context().running.load(Ordering::SeqCst) {
        "RUNNING"
    } else {
        "STOPPED"
    };
    let info = serde_json::json!({
        "Containers": 0,
        "SystemStatus": [
            ["vSphere Integrated Containers Backend Engine", state],
            ["VolumeStores", "default"],
        ],
    });
    Ok(HttpResponseOk(FreeformBody(Body::with_content(info.to_string()))))
}

struct Harness {
    logctx: LogContext,
    hv: Arc<FakeHypervisor>,
    api: Arc<VchApi>,
    server: HttpServer<Arc<VchApi>>,
    images: Utf8TempDir,
    installer: InstallerData,
}

impl Harness {
    fn new(test_name: &str, hv: FakeHypervisor) -> Harness {
        let logctx = test_setup_log(test_name);
        let hv = Arc::new(hv);
        // The guest publishes its client address once it boots.
        hv.set_guest_hook(Arc::new(|_: &str, extra: &mut ExtraConfig| {
            extra.insert(
                CLIENT_IP_KEY.to_string(),
                Ipv4Addr::LOCALHOST.to_string(),
            );
        }));

        let api = Arc::new(VchApi { running: AtomicBool::new(true) });
        let mut description = ApiDescription::new();
        description.register(docker_info).unwrap();
        let server =
            ServerBuilder::new(description, api.clone(), logctx.log.clone())
                .config(ConfigDropshot {
                    bind_address: "127.0.0.1:0".parse().unwrap(),
                    ..Default::default()
                })
                .start()
                .unwrap();

        let images = camino_tempfile::tempdir().unwrap();
        let installer = InstallerData {
            timeout: Duration::from_secs(2),
            version: Version::new("v1.0.0", "100", "aaaaaaa"),
            api_port: Some(server.local_addr().port()),
            ..Default::default()
        };
        let mut harness =
            Harness { logctx, hv, api, server, images, installer };
        harness.installer.image_files =
            harness.write_images(&["appliance.iso", "bootstrap.iso"]);
        harness
    }

    fn write_images(&self, names: &[&str]) -> Vec<Utf8PathBuf> {
        names
            .iter()
            .map(|name| {
                let path = self.images.path().join(name);
                std::fs::write(&path, name.as_bytes()).unwrap();
                path
            })
            .collect()
    }

    /// Installer settings for an upgrade to build 200
    fn upgrade_installer(&self) -> InstallerData {
        InstallerData {
            image_files: self
                .write_images(&["appliance-v2.iso", "bootstrap-v2.iso"]),
            appliance_iso: "appliance-v2.iso".to_string(),
            bootstrap_iso: "bootstrap-v2.iso".to_string(),
            version: Version::new("v1.1.0", "200", "bbbbbbb"),
            ..self.installer.clone()
        }
    }

    fn spec(&self) -> VchConfigSpec {
        let mut spec = VchConfigSpec {
            target: "https://127.0.0.1/sdk".to_string(),
            version: self.installer.version.clone(),
            image_stores: vec![format!("ds://{DATASTORE_NAME}/{VCH_NAME}")],
            volume_locations: BTreeMap::from([(
                "default".to_string(),
                format!("ds://{DATASTORE_NAME}/volumes/{VCH_NAME}"),
            )]),
            bridge_network: BRIDGE_PORT_GROUP.to_string(),
            compute_resources: vec![self.hv.root_pool()],
            ..Default::default()
        };
        spec.executor.name = VCH_NAME.to_string();

        let mut bridge =
            NetworkEndpoint::new(BRIDGE_NETWORK, BRIDGE_PORT_GROUP);
        if self.hv.is_vc() {
            bridge.port_group =
                self.hv.network_ref(BRIDGE_PORT_GROUP).unwrap_or_else(|| {
                    self.hv.add_distributed_network(BRIDGE_PORT_GROUP)
                });
        } else {
            spec.create_bridge_network = true;
        }
        spec.add_network(bridge);
        spec.add_network(NetworkEndpoint::new(CLIENT_NETWORK, NETWORK_NAME));
        spec
    }

    fn dispatcher(&self, force: bool) -> Dispatcher {
        Dispatcher::new(
            self.hv.clone(),
            &self.logctx.log,
            force,
            Context::background(),
        )
    }

    /// Creates the VCH and returns its appliance.
    async fn create(&self) -> MoRef {
        let mut spec = self.spec();
        self.dispatcher(false)
            .create_vch(&mut spec, &self.installer)
            .await
            .unwrap();
        spec.executor.id.parse().unwrap()
    }

    /// The stored configuration of the VCH in `vm`, as a fresh operation
    /// would see it.
    async fn stored(
        &self,
        dispatcher: &mut Dispatcher,
        vm: &VirtualMachine,
    ) -> VchConfigSpec {
        dispatcher.get_vch_config(vm).await.unwrap()
    }

    fn vch_file(&self, name: &str) -> DatastorePath {
        DatastorePath::new(DATASTORE_NAME, &format!("{VCH_NAME}/{name}"))
    }

    fn update_in_progress(&self, vm: &MoRef) -> String {
        self.hv.extra_config(vm).unwrap()[UPDATE_IN_PROGRESS_KEY].clone()
    }

    async fn teardown(self) {
        self.server.close().await.unwrap();
        self.logctx.cleanup_successful();
    }
}

#[tokio::test]
async fn create_on_esx() {
    let h = Harness::new("create_on_esx", FakeHypervisor::esx());
    let mut spec = h.spec();
    let mut dispatcher = h.dispatcher(false);
    dispatcher.create_vch(&mut spec, &h.installer).await.unwrap();

    let pool = spec.compute_resources.last().unwrap().clone();
    assert_eq!(pool.kind, RESOURCE_POOL);
    assert!(h.hv.pool_exists(&pool));
    assert!(h.hv.network_ref(BRIDGE_PORT_GROUP).is_some());

    let moref: MoRef = spec.executor.id.parse().unwrap();
    assert_eq!(h.hv.vm_power_state(&moref), Some(PowerState::PoweredOn));
    assert_eq!(h.update_in_progress(&moref), "false");
    for iso in ["appliance.iso", "bootstrap.iso"] {
        assert!(h.hv.file_exists(&h.vch_file(iso)), "{iso} not uploaded");
    }
    let volumes = format!("volumes/{VCH_NAME}");
    assert!(h.hv.file_exists(&DatastorePath::new(DATASTORE_NAME, &volumes)));

    let vm = dispatcher
        .find_vch(&h.hv.root_pool(), VCH_NAME)
        .await
        .unwrap()
        .expect("VCH is found by name");
    assert_eq!(vm.moref(), moref);

    let stored = h.stored(&mut h.dispatcher(false), &vm).await;
    assert_eq!(stored.name(), VCH_NAME);
    assert_eq!(stored.executor.id, spec.executor.id);
    assert_eq!(stored.compute_resources, spec.compute_resources);
    assert!(!stored.network(BRIDGE_NETWORK).unwrap().mac.is_empty());
    h.teardown().await;
}

#[tokio::test]
async fn create_on_vcenter_uses_vapp() {
    let h =
        Harness::new("create_on_vcenter_uses_vapp", FakeHypervisor::vcenter());
    let mut spec = h.spec();
    h.dispatcher(false)
        .create_vch(&mut spec, &h.installer)
        .await
        .unwrap();

    let vapp = spec.compute_resources.last().unwrap();
    assert_eq!(vapp.kind, VIRTUAL_APP);
    assert_eq!(h.hv.count(Op::AddPortGroup), 0);
    let moref: MoRef = spec.executor.id.parse().unwrap();
    assert_eq!(h.hv.vm_power_state(&moref), Some(PowerState::PoweredOn));
    h.teardown().await;
}

#[tokio::test]
async fn create_refuses_taken_names() {
    let h = Harness::new("create_refuses_taken_names", FakeHypervisor::esx());
    h.create().await;
    let err = h
        .dispatcher(false)
        .create_vch(&mut h.spec(), &h.installer)
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::ApplianceExists(ref name) if name == VCH_NAME)
    );

    let other = Harness::new("create_refuses_non_vch", FakeHypervisor::esx());
    other.hv.add_vm(VCH_NAME, &other.hv.root_pool());
    let err = other
        .dispatcher(false)
        .create_vch(&mut other.spec(), &other.installer)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotAVch(_)));
    other.teardown().await;
    h.teardown().await;
}

#[tokio::test]
async fn failed_power_on_leaves_a_deletable_vch() {
    let h = Harness::new(
        "failed_power_on_leaves_a_deletable_vch",
        FakeHypervisor::esx(),
    );
    h.hv.inject_fault(
        Op::PowerOn,
        Fault::task(FaultKind::SystemError, "A general system error occurred"),
        1,
    );
    let mut spec = h.spec();
    let err = h
        .dispatcher(false)
        .create_vch(&mut spec, &h.installer)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Vsphere(_)), "unexpected error {err:?}");

    let mut dispatcher = h.dispatcher(false);
    let vm = dispatcher
        .find_vch(&h.hv.root_pool(), VCH_NAME)
        .await
        .unwrap()
        .expect("appliance was created before the failure");
    let moref = vm.moref();
    assert_eq!(h.update_in_progress(&moref), "false");
    assert_eq!(h.hv.vm_power_state(&moref), Some(PowerState::PoweredOff));

    // The half-built VCH can be deleted, and then created again.
    let stored = h.stored(&mut dispatcher, &vm).await;
    dispatcher
        .delete_vch(
            &stored,
            DeleteContainers::PoweredOff,
            DeleteVolumeStores::None,
        )
        .await
        .unwrap();
    assert_eq!(h.hv.vm_count(), 0);

    let moref = h.create().await;
    assert_eq!(h.hv.vm_power_state(&moref), Some(PowerState::PoweredOn));
    assert_eq!(h.update_in_progress(&moref), "false");
    h.teardown().await;
}

#[tokio::test]
async fn reconfigure_keeps_one_snapshot() {
    let h =
        Harness::new("reconfigure_keeps_one_snapshot", FakeHypervisor::esx());
    let moref = h.create().await;

    for _ in 0..2 {
        let mut dispatcher = h.dispatcher(false);
        let vm = dispatcher.vm(&moref);
        let mut spec = h.stored(&mut dispatcher, &vm).await;
        spec.volume_locations.insert(
            "fast".to_string(),
            format!("ds://{DATASTORE_NAME}/fast"),
        );
        dispatcher
            .configure(&vm, &mut spec, &h.installer, true)
            .await
            .unwrap();
        assert_eq!(h.hv.snapshot_names(&moref), ["reconfigure for 100"]);
    }

    assert!(h.hv.file_exists(&DatastorePath::new(DATASTORE_NAME, "fast")));
    assert_eq!(h.hv.vm_power_state(&moref), Some(PowerState::PoweredOn));
    assert_eq!(h.update_in_progress(&moref), "false");
    let mut dispatcher = h.dispatcher(false);
    let vm = dispatcher.vm(&moref);
    let stored = h.stored(&mut dispatcher, &vm).await;
    assert!(stored.volume_locations.contains_key("fast"));
    h.teardown().await;
}

#[tokio::test]
async fn reconfigure_requires_matching_version() {
    let h = Harness::new(
        "reconfigure_requires_matching_version",
        FakeHypervisor::esx(),
    );
    let moref = h.create().await;
    let upgrade = h.upgrade_installer();

    let mut dispatcher = h.dispatcher(false);
    let vm = dispatcher.vm(&moref);
    let mut spec = h.stored(&mut dispatcher, &vm).await;
    let err = dispatcher
        .configure(&vm, &mut spec, &upgrade, true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::VersionMismatch { .. }));
    assert!(h.hv.snapshot_names(&moref).is_empty());
    assert_eq!(h.hv.count(Op::UploadFile), 2);
    h.teardown().await;
}

#[tokio::test]
async fn failed_upgrade_restores_appliance() {
    let h = Harness::new(
        "failed_upgrade_restores_appliance",
        FakeHypervisor::esx(),
    );
    let moref = h.create().await;
    let upgrade = h.upgrade_installer();

    let mut dispatcher = h.dispatcher(false);
    let vm = dispatcher.vm(&moref);
    let mut spec = h.stored(&mut dispatcher, &vm).await;
    h.hv.inject_fault(
        Op::PowerOn,
        Fault::task(FaultKind::SystemError, "A general system error occurred"),
        1,
    );
    let err = dispatcher
        .configure(&vm, &mut spec, &upgrade, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Vsphere(_)), "unexpected error {err:?}");

    for iso in ["appliance-v2.iso", "bootstrap-v2.iso"] {
        assert!(!h.hv.file_exists(&h.vch_file(iso)), "{iso} left behind");
    }
    assert!(h.hv.file_exists(&h.vch_file("appliance.iso")));
    assert!(h.hv.snapshot_names(&moref).is_empty());
    assert_eq!(h.hv.vm_power_state(&moref), Some(PowerState::PoweredOn));
    assert_eq!(h.update_in_progress(&moref), "false");

    let restored = h.stored(&mut h.dispatcher(false), &vm).await;
    assert_eq!(restored.version.build_number, "100");
    h.teardown().await;
}

#[tokio::test]
async fn unready_upgrade_times_out_and_restores() {
    let h = Harness::new(
        "unready_upgrade_times_out_and_restores",
        FakeHypervisor::esx(),
    );
    let moref = h.create().await;
    let upgrade = h.upgrade_installer();

    let mut dispatcher = h.dispatcher(false);
    let vm = dispatcher.vm(&moref);
    let mut spec = h.stored(&mut dispatcher, &vm).await;
    h.api.running.store(false, Ordering::SeqCst);
    let err = dispatcher
        .configure(&vm, &mut spec, &upgrade, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReadinessTimeout(t) if t == upgrade.timeout));

    assert!(!h.hv.file_exists(&h.vch_file("appliance-v2.iso")));
    assert!(h.hv.snapshot_names(&moref).is_empty());
    assert_eq!(h.hv.vm_power_state(&moref), Some(PowerState::PoweredOn));
    assert_eq!(h.update_in_progress(&moref), "false");
    h.teardown().await;
}

#[tokio::test]
async fn update_in_progress_blocks_configure() {
    let h = Harness::new(
        "update_in_progress_blocks_configure",
        FakeHypervisor::esx(),
    );
    let moref = h.create().await;
    h.hv.set_extra_config(&moref, UPDATE_IN_PROGRESS_KEY, "true");

    let mut dispatcher = h.dispatcher(false);
    let vm = dispatcher.vm(&moref);
    let mut spec = h.stored(&mut dispatcher, &vm).await;
    let err = dispatcher
        .configure(&vm, &mut spec, &h.installer, true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UpdateInProgress));
    assert_eq!(h.update_in_progress(&moref), "true");

    dispatcher.reset_update_in_progress(&vm).await.unwrap();
    assert_eq!(h.update_in_progress(&moref), "false");
    dispatcher
        .configure(&vm, &mut spec, &h.installer, true)
        .await
        .unwrap();
    h.teardown().await;
}

#[tokio::test]
async fn rollback_returns_to_previous_version() {
    let h = Harness::new(
        "rollback_returns_to_previous_version",
        FakeHypervisor::esx(),
    );
    let moref = h.create().await;

    let mut dispatcher = h.dispatcher(false);
    let vm = dispatcher.vm(&moref);
    let mut spec = h.stored(&mut dispatcher, &vm).await;
    let err = dispatcher
        .rollback(&vm, &mut spec, &h.installer)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoRollbackSnapshot));

    let upgrade = h.upgrade_installer();
    dispatcher.configure(&vm, &mut spec, &upgrade, false).await.unwrap();
    let upgraded = h.stored(&mut h.dispatcher(false), &vm).await;
    assert_eq!(upgraded.version.build_number, "200");

    let mut dispatcher = h.dispatcher(false);
    let mut spec = h.stored(&mut dispatcher, &vm).await;
    dispatcher.rollback(&vm, &mut spec, &h.installer).await.unwrap();
    let restored = h.stored(&mut h.dispatcher(false), &vm).await;
    assert_eq!(restored.version.build_number, "100");
    assert!(h.hv.snapshot_names(&moref).is_empty());
    assert_eq!(h.hv.vm_power_state(&moref), Some(PowerState::PoweredOn));
    assert_eq!(h.update_in_progress(&moref), "false");
    h.teardown().await;
}

#[tokio::test]
async fn interrupted_rollback_can_be_repeated() {
    let h = Harness::new(
        "interrupted_rollback_can_be_repeated",
        FakeHypervisor::esx(),
    );
    let moref = h.create().await;
    let mut dispatcher = h.dispatcher(false);
    let vm = dispatcher.vm(&moref);
    let mut spec = h.stored(&mut dispatcher, &vm).await;
    dispatcher
        .configure(&vm, &mut spec, &h.upgrade_installer(), false)
        .await
        .unwrap();

    // The revert goes through but the snapshot cannot be removed.
    h.hv.inject_fault(
        Op::RemoveSnapshot,
        Fault::task(FaultKind::InvalidArgument, "snapshot is locked"),
        1,
    );
    let mut dispatcher = h.dispatcher(false);
    let mut spec = h.stored(&mut dispatcher, &vm).await;
    dispatcher
        .rollback(&vm, &mut spec, &h.installer)
        .await
        .unwrap_err();
    assert_eq!(h.hv.snapshot_names(&moref).len(), 1);
    assert_eq!(h.update_in_progress(&moref), "false");
    let interrupted = h.hv.extra_config(&moref).unwrap();
    let restored = h.stored(&mut h.dispatcher(false), &vm).await;
    assert_eq!(restored.version.build_number, "100");

    // Running it again lands in the same place and finishes the cleanup.
    let mut dispatcher = h.dispatcher(false);
    let mut spec = h.stored(&mut dispatcher, &vm).await;
    dispatcher.rollback(&vm, &mut spec, &h.installer).await.unwrap();
    assert_eq!(h.hv.extra_config(&moref).unwrap(), interrupted);
    assert!(h.hv.snapshot_names(&moref).is_empty());
    assert_eq!(h.hv.vm_power_state(&moref), Some(PowerState::PoweredOn));
    assert_eq!(h.update_in_progress(&moref), "false");
    h.teardown().await;
}

#[tokio::test]
async fn delete_removes_vch_and_containers() {
    let h = Harness::new(
        "delete_removes_vch_and_containers",
        FakeHypervisor::esx(),
    );
    let moref = h.create().await;
    let mut dispatcher = h.dispatcher(false);
    let vm = dispatcher.vm(&moref);
    let spec = h.stored(&mut dispatcher, &vm).await;
    let pool = spec.compute_resources.last().unwrap().clone();
    let container = h.hv.add_vm("container-1", &pool);
    h.hv.set_power_state(&container, PowerState::PoweredOn);

    let err = dispatcher
        .delete_vch(
            &spec,
            DeleteContainers::PoweredOff,
            DeleteVolumeStores::None,
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::Children(ref msg)
            if msg.contains("VM \"container-1\" is powered on")),
        "unexpected error {err:?}"
    );
    assert_eq!(h.hv.vm_count(), 2);
    assert_eq!(h.hv.vm_power_state(&moref), Some(PowerState::PoweredOn));

    dispatcher
        .delete_vch(&spec, DeleteContainers::All, DeleteVolumeStores::None)
        .await
        .unwrap();
    assert_eq!(h.hv.vm_count(), 0);
    assert!(!h.hv.pool_exists(&pool));
    assert!(h.hv.network_ref(BRIDGE_PORT_GROUP).is_none());
    assert!(!h.hv.file_exists(&h.vch_file("appliance.iso")));
    assert!(!h
        .hv
        .file_exists(&DatastorePath::new(DATASTORE_NAME, "container-1")));
    let volumes = format!("volumes/{VCH_NAME}");
    assert!(h.hv.file_exists(&DatastorePath::new(DATASTORE_NAME, &volumes)));

    // Nothing is left to delete.
    dispatcher
        .delete_vch(&spec, DeleteContainers::All, DeleteVolumeStores::None)
        .await
        .unwrap();
    h.teardown().await;
}

#[tokio::test]
async fn delete_removes_volume_stores_on_request() {
    let h = Harness::new(
        "delete_removes_volume_stores_on_request",
        FakeHypervisor::vcenter(),
    );
    let moref = h.create().await;
    let mut dispatcher = h.dispatcher(false);
    let vm = dispatcher.vm(&moref);
    let spec = h.stored(&mut dispatcher, &vm).await;

    dispatcher
        .delete_vch(
            &spec,
            DeleteContainers::PoweredOff,
            DeleteVolumeStores::All,
        )
        .await
        .unwrap();
    let volumes = format!("volumes/{VCH_NAME}");
    assert!(!h.hv.file_exists(&DatastorePath::new(DATASTORE_NAME, &volumes)));
    assert!(!h.hv.pool_exists(spec.compute_resources.last().unwrap()));
    // The distributed bridge port-group belongs to the operator.
    assert!(h.hv.network_ref(BRIDGE_PORT_GROUP).is_some());
    h.teardown().await;
}

#[tokio::test]
async fn failed_create_collects_diagnostics() {
    let h = Harness::new(
        "failed_create_collects_diagnostics",
        FakeHypervisor::vcenter(),
    );
    let dir = camino_tempfile::tempdir().unwrap();
    h.hv.set_log("vpxd:vpxd.log", vec!["before create".to_string()]);
    h.hv.inject_fault(
        Op::CreateVm,
        Fault::task(FaultKind::SystemError, "A general system error occurred"),
        1,
    );

    let mut dispatcher = h.dispatcher(false).with_diagnostics_dir(dir.path());
    dispatcher.create_vch(&mut h.spec(), &h.installer).await.unwrap_err();
    let vpxd = std::fs::read_to_string(dir.path().join("vpxd.log")).unwrap();
    assert!(!vpxd.contains("before create"));
    h.teardown().await;
}

#[tokio::test]
async fn inspect_reports_running_vch() {
    let h = Harness::new("inspect_reports_running_vch", FakeHypervisor::esx());
    let moref = h.create().await;
    h.hv.set_guest_program_result("test-vc-api", 3);

    let mut dispatcher = h.dispatcher(false);
    let vm = dispatcher.vm(&moref);
    let spec = h.stored(&mut dispatcher, &vm).await;
    let info = dispatcher.inspect_vch(&vm, &spec, &h.installer).await.unwrap();
    let port = h.server.local_addr().port();
    assert_eq!(info.client_ip, Ipv4Addr::LOCALHOST);
    assert_eq!(info.docker_host, format!("127.0.0.1:{port}"));
    assert_eq!(info.admin_portal, "https://127.0.0.1:2378");
    assert!(info.api_ready);
    assert_eq!(info.vc_api, Some(VcApiStatus::Unreachable));
    assert_eq!(info.version.build_number, "100");
    h.teardown().await;
}
