// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VCH configuration model
//!
//! [`VchConfigSpec`] is written by the dispatcher into the appliance VM's
//! guest-info and is the only persistent record of what a VCH is supposed to
//! be.  The in-guest tether reads the [`ExecutorConfig`] subtree (under
//! [`EXECUTOR_PREFIX`]) and writes back the [`Published`] fields.

use crate::extraconfig::{Published, Secret};
use crate::moref::MoRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

/// Subtree of the guest-info key space holding the [`ExecutorConfig`].
pub const EXECUTOR_PREFIX: &str = "init";

/// Set while a dispatcher is mutating the VCH.
pub const UPDATE_IN_PROGRESS_KEY: &str = "guestinfo.vice./UpdateInProgress";

/// Published by the tether once the client network has an address.
pub const CLIENT_IP_KEY: &str = "guestinfo.vice..clientip";

/// `.vmx` entry holding the per-VCH [`crate::extraconfig::SecretKey`].
pub const SECRET_KEY_VMX_KEY: &str = "guestinfo.vice./init/secret_key";

/// Number of exit records a session keeps.
pub const MAX_DEATH_RECORDS: usize = 5;

/// Well-known network roles of a VCH appliance
pub const BRIDGE_NETWORK: &str = "bridge";
pub const CLIENT_NETWORK: &str = "client";
pub const PUBLIC_NETWORK: &str = "public";
pub const MANAGEMENT_NETWORK: &str = "management";

/// Guest program that probes the management API from inside the appliance
pub const TEST_VC_API: &str = "test-vc-api";

/// Result of a [`TEST_VC_API`] probe, reported as the program's exit code
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[repr(i32)]
pub enum VcApiStatus {
    #[strum(serialize = "reachable")]
    Reachable = 0,
    #[strum(serialize = "invalid target")]
    InvalidTarget = 1,
    #[strum(serialize = "target cannot be resolved")]
    Unresolvable = 2,
    #[strum(serialize = "target is unreachable")]
    Unreachable = 3,
}

impl VcApiStatus {
    pub fn from_code(code: i64) -> Option<VcApiStatus> {
        match code {
            0 => Some(VcApiStatus::Reachable),
            1 => Some(VcApiStatus::InvalidTarget),
            2 => Some(VcApiStatus::Unresolvable),
            3 => Some(VcApiStatus::Unreachable),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("at least one image store must be specified")]
    NoImageStores,
    #[error("a \"{BRIDGE_NETWORK}\" network must be configured")]
    MissingBridgeNetwork,
    #[error("session stored under {key:?} has id {id:?}")]
    SessionKeyMismatch { key: String, id: String },
}

/// Build information of the appliance images a VCH runs
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Version {
    pub tag: String,
    pub build_number: String,
    pub commit: String,
}

impl Version {
    pub fn new(tag: &str, build_number: &str, commit: &str) -> Self {
        Version {
            tag: tag.to_string(),
            build_number: build_number.to_string(),
            commit: commit.to_string(),
        }
    }

    /// Orders two versions by build number, the only component that is
    /// guaranteed to increase.  Returns `None` if either build is unknown.
    pub fn is_newer_than(&self, other: &Version) -> Option<bool> {
        let mine = self.build_number.parse::<u64>().ok()?;
        let theirs = other.build_number.parse::<u64>().ok()?;
        Some(mine > theirs)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.tag, self.build_number, self.commit)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cmd {
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub dir: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitLog {
    /// Seconds since the epoch at which the exit was observed
    pub time: i64,
    pub exit_status: i32,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionDiagnostics {
    pub resurrection_count: u32,
    pub exit_logs: Vec<ExitLog>,
}

impl SessionDiagnostics {
    /// Records an exit, keeping only the most recent
    /// [`MAX_DEATH_RECORDS`] entries.
    pub fn record_exit(&mut self, log: ExitLog) {
        self.exit_logs.push(log);
        let excess = self.exit_logs.len().saturating_sub(MAX_DEATH_RECORDS);
        self.exit_logs.drain(..excess);
    }
}

/// A process the tether launches and supervises
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub id: String,
    pub name: String,
    pub cmd: Cmd,
    pub user: String,
    pub group: String,
    pub tty: bool,
    pub attach: bool,
    pub open_stdin: bool,
    /// Whether the session should be running
    pub active: bool,
    /// Relaunch on exit
    pub restart: bool,
    pub stop_signal: String,
    /// Empty until launched, `"true"` once running, otherwise the reason the
    /// last launch failed
    pub started: Published<String>,
    pub exit_status: Published<i32>,
    pub diagnostics: Published<SessionDiagnostics>,
}

impl SessionConfig {
    /// A session running `path` with `args`; `argv[0]` is `path`.
    pub fn create(path: &str, args: &[&str]) -> Self {
        let mut argv = vec![path.to_string()];
        argv.extend(args.iter().map(|a| a.to_string()));
        SessionConfig {
            cmd: Cmd {
                path: path.to_string(),
                args: argv,
                ..Default::default()
            },
            active: true,
            ..Default::default()
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.as_str() == "true"
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkEndpoint {
    pub name: String,
    pub port_group: MoRef,
    pub port_group_name: String,
    pub inventory_path: String,
    /// Static address in CIDR form, empty for DHCP
    pub static_ip: String,
    pub gateway: Option<Ipv4Addr>,
    pub nameservers: Vec<Ipv4Addr>,
    /// Filled in by the dispatcher once the hypervisor has generated it
    pub mac: String,
    /// Whether the default route goes through this endpoint
    pub default_route: bool,
    pub assigned: Published<Option<Ipv4Addr>>,
}

impl NetworkEndpoint {
    pub fn new(name: &str, port_group_name: &str) -> Self {
        NetworkEndpoint {
            name: name.to_string(),
            port_group_name: port_group_name.to_string(),
            ..Default::default()
        }
    }

    /// Address currently in use, if any has been assigned.
    pub fn assigned_ip(&self) -> Option<Ipv4Addr> {
        self.assigned.0.filter(|ip| !ip.is_unspecified())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountSpec {
    /// Filesystem label of the disk to mount
    pub label: String,
    pub path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SysLogConfig {
    pub network: String,
    pub raddr: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Diagnostics {
    pub debug_level: u8,
    pub sys_log_config: Option<SysLogConfig>,
}

/// Configuration consumed by the tether inside a VM
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub id: String,
    pub name: String,
    pub diagnostics: Diagnostics,
    pub sessions: BTreeMap<String, SessionConfig>,
    pub networks: BTreeMap<String, NetworkEndpoint>,
    pub mounts: BTreeMap<String, MountSpec>,
    /// PEM host key of the back-channel SSH server
    pub host_key: Secret<String>,
}

impl ExecutorConfig {
    pub fn debug_level(&self) -> u8 {
        self.diagnostics.debug_level
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawCertificate {
    pub cert: String,
    pub key: Secret<String>,
}

impl RawCertificate {
    pub fn is_empty(&self) -> bool {
        self.cert.is_empty() && self.key.expose().is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerNetwork {
    pub name: String,
    pub port_group_name: String,
    /// Gateway in CIDR form
    pub gateway: String,
    pub nameservers: Vec<Ipv4Addr>,
    pub pools: Vec<String>,
}

/// Resource allocation of a pool or VM; unset values are left to the
/// hypervisor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub cpu_count: Option<u32>,
    pub memory_mb: Option<u64>,
    pub cpu_reservation_mhz: Option<i64>,
    pub cpu_limit_mhz: Option<i64>,
    pub memory_reservation_mb: Option<i64>,
    pub memory_limit_mb: Option<i64>,
}

/// Complete description of a Virtual Container Host
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VchConfigSpec {
    #[serde(rename = "init")]
    pub executor: ExecutorConfig,
    pub target: String,
    pub insecure: bool,
    pub version: Version,
    pub host_certificate: Option<RawCertificate>,
    pub certificate_authorities: String,
    pub image_stores: Vec<String>,
    pub volume_locations: BTreeMap<String, String>,
    pub bridge_network: String,
    pub create_bridge_network: bool,
    pub bridge_ip_range: String,
    pub container_networks: BTreeMap<String, ContainerNetwork>,
    pub compute_resources: Vec<MoRef>,
    pub appliance_size: Resources,
    pub container_vm_size: Resources,
    pub bootstrap_image_path: String,
}

impl VchConfigSpec {
    pub fn name(&self) -> &str {
        &self.executor.name
    }

    /// Identifier used before the appliance VM exists.
    pub fn creating_id(parent: &str, name: &str) -> String {
        format!("CreatingVCH-{parent}-{name}")
    }

    pub fn set_moref(&mut self, moref: &MoRef) {
        self.executor.id = moref.to_string();
    }

    pub fn add_network(&mut self, endpoint: NetworkEndpoint) {
        self.executor.networks.insert(endpoint.name.clone(), endpoint);
    }

    pub fn add_container_network(&mut self, network: ContainerNetwork) {
        self.container_networks.insert(network.name.clone(), network);
    }

    /// Adds a component session, defaulting its id and name to `name`.
    pub fn add_component(&mut self, name: &str, mut session: SessionConfig) {
        if session.name.is_empty() {
            session.name = name.to_string();
        }
        if session.id.is_empty() {
            session.id = name.to_string();
        }
        self.executor.sessions.insert(name.to_string(), session);
    }

    pub fn add_compute_resource(&mut self, pool: MoRef) {
        self.compute_resources.push(pool);
    }

    /// Forgets which sessions have been started so that readiness is
    /// re-verified after a reconfigure.
    pub fn clear_started(&mut self) {
        for session in self.executor.sessions.values_mut() {
            session.started = Published(String::new());
        }
    }

    pub fn network(&self, role: &str) -> Option<&NetworkEndpoint> {
        self.executor.networks.get(role)
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        if self.image_stores.is_empty() {
            return Err(SpecError::NoImageStores);
        }
        if !self.executor.networks.contains_key(BRIDGE_NETWORK) {
            return Err(SpecError::MissingBridgeNetwork);
        }
        for (key, session) in &self.executor.sessions {
            if key != &session.id {
                return Err(SpecError::SessionKeyMismatch {
                    key: key.clone(),
                    id: session.id.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::extraconfig::{self, SecretKey};

    fn spec() -> VchConfigSpec {
        let mut spec = VchConfigSpec {
            image_stores: vec!["ds://LocalDS_0/vch1".into()],
            version: Version::new("v1.1.0", "5000", "abcdef"),
            ..Default::default()
        };
        spec.executor.name = "vch1".into();
        spec.add_network(NetworkEndpoint::new(BRIDGE_NETWORK, "vch1"));
        spec.add_network(NetworkEndpoint::new(CLIENT_NETWORK, "VM Network"));
        spec.add_container_network(ContainerNetwork {
            name: "backend".into(),
            port_group_name: "backend-pg".into(),
            gateway: "172.20.0.1/16".into(),
            ..Default::default()
        });
        spec.add_component(
            "port-layer",
            SessionConfig::create(
                "/sbin/port-layer-server",
                &["--port", "2377"],
            ),
        );
        spec
    }

    #[test]
    fn validate_invariants() {
        assert_eq!(spec().validate(), Ok(()));

        let mut s = spec();
        s.image_stores.clear();
        assert_eq!(s.validate(), Err(SpecError::NoImageStores));

        let mut s = spec();
        s.executor.networks.remove(BRIDGE_NETWORK);
        assert_eq!(s.validate(), Err(SpecError::MissingBridgeNetwork));

        let mut s = spec();
        s.executor.sessions.get_mut("port-layer").unwrap().id = "other".into();
        assert!(matches!(
            s.validate(),
            Err(SpecError::SessionKeyMismatch { .. })
        ));
    }

    #[test]
    fn spec_survives_guest_info() {
        let mut s = spec();
        s.executor.host_key = Secret("-----BEGIN KEY-----".into());
        s.executor.sessions.get_mut("port-layer").unwrap().started =
            Published("true".into());
        let key = SecretKey::generate();
        let map = extraconfig::encode(&s, Some(&key)).unwrap();
        assert_eq!(
            map.get("guestinfo.vice./init/sessions|port-layer/cmd/path"),
            Some(&"/sbin/port-layer-server".to_string())
        );
        assert_eq!(
            map.get("guestinfo.vice..init.sessions|port-layer.started"),
            Some(&"true".to_string())
        );
        let back: VchConfigSpec =
            extraconfig::decode(&map, Some(&key)).unwrap();
        assert_eq!(back, s);

        let executor: ExecutorConfig =
            extraconfig::decode_with_prefix(&map, EXECUTOR_PREFIX, Some(&key))
                .unwrap();
        assert_eq!(executor, s.executor);
    }

    #[test]
    fn clear_started_resets_sessions() {
        let mut s = spec();
        for session in s.executor.sessions.values_mut() {
            session.started = Published("true".into());
        }
        s.clear_started();
        assert!(s.executor.sessions.values().all(|s| s.started.is_empty()));
    }

    #[test]
    fn death_records_are_bounded() {
        let mut diag = SessionDiagnostics::default();
        for i in 0..8 {
            diag.record_exit(ExitLog {
                time: i,
                exit_status: 1,
                message: String::new(),
            });
        }
        assert_eq!(diag.exit_logs.len(), MAX_DEATH_RECORDS);
        assert_eq!(diag.exit_logs[0].time, 3);
    }

    #[test]
    fn vc_api_codes() {
        for status in [
            VcApiStatus::Reachable,
            VcApiStatus::InvalidTarget,
            VcApiStatus::Unresolvable,
            VcApiStatus::Unreachable,
        ] {
            assert_eq!(VcApiStatus::from_code(status as i64), Some(status));
        }
        assert_eq!(VcApiStatus::from_code(-1), None);
    }

    #[test]
    fn version_ordering() {
        let old = Version::new("v1.0.0", "4000", "a");
        let new = Version::new("v1.1.0", "5000", "b");
        assert_eq!(new.is_newer_than(&old), Some(true));
        assert_eq!(old.is_newer_than(&new), Some(false));
        assert_eq!(Version::default().is_newer_than(&old), None);
    }
}
