// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operations the tether performs on the guest OS

use crate::executor::{BoxedExecutor, ExecutionError};
use crate::process::{self, MultiWriter, ProcessSpec, SpawnError, Spawned};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use slog::{debug, info, warn, Logger};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use vch_common::config::{NetworkEndpoint, SessionConfig};

pub const AUTHORIZED_KEYS: &str = "/root/.ssh/authorized_keys";
pub const RESOLV_CONF: &str = "/etc/resolv.conf";
const SYS_CLASS_NET: &str = "/sys/class/net";

#[derive(Debug, thiserror::Error)]
pub enum OpsError {
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("{what} {path}")]
    Io {
        what: &'static str,
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("no interface found for endpoint {0:?}")]
    NoInterface(String),
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("failed to signal process {pid}")]
    Signal {
        pid: u32,
        #[source]
        err: std::io::Error,
    },
}

/// Describes the OS-facing side of the tether.
///
/// - In production, this is [`HostOperations`].
/// - Under test, [`FakeOperations`] records what was asked of it.
#[async_trait]
pub trait Operations: Send + Sync {
    async fn set_hostname(
        &self,
        hostname: &str,
        alias: &str,
    ) -> Result<(), OpsError>;

    /// Brings the interface for `endpoint` up and configures it, returning
    /// the address it ended up with.
    async fn apply_endpoint(
        &self,
        endpoint: &NetworkEndpoint,
    ) -> Result<Option<Ipv4Addr>, OpsError>;

    async fn mount_label(
        &self,
        label: &str,
        path: &Utf8Path,
    ) -> Result<(), OpsError>;

    async fn sync(&self) -> Result<(), OpsError>;
    async fn power_off(&self) -> Result<(), OpsError>;
    async fn restart(&self) -> Result<(), OpsError>;

    /// Installs `authorized_keys` for root and starts sshd.
    async fn enable_ssh(&self, authorized_keys: &str) -> Result<(), OpsError>;
    async fn set_password(&self, password: &str) -> Result<(), OpsError>;

    /// Starts a session with its output going to the session log.
    /// Returns the pid.
    async fn launch(&self, session: &SessionConfig) -> Result<u32, OpsError>;

    /// Starts a process whose streams belong to the caller.
    async fn exec(&self, spec: &ProcessSpec) -> Result<Spawned, OpsError>;

    /// Delivers `signal` to the process group led by `pid`.
    fn signal(&self, pid: u32, signal: i32) -> Result<(), OpsError>;
}

pub type BoxedOperations = Arc<dyn Operations>;

/// Converts a session's configuration into what to run.
pub fn process_spec(session: &SessionConfig) -> ProcessSpec {
    ProcessSpec {
        path: session.cmd.path.clone(),
        args: session.cmd.args.clone(),
        env: session.cmd.env.clone(),
        dir: Some(session.cmd.dir.clone()).filter(|d| !d.is_empty()),
        user: session.user.clone(),
        group: session.group.clone(),
        tty: session.tty,
    }
}

pub struct HostOperations {
    log: Logger,
    executor: BoxedExecutor,
    session_log_dir: Utf8PathBuf,
    serial_log: Option<Utf8PathBuf>,
}

impl HostOperations {
    pub fn new(
        log: Logger,
        executor: BoxedExecutor,
        session_log_dir: Utf8PathBuf,
        serial_log: Option<Utf8PathBuf>,
    ) -> Self {
        HostOperations { log, executor, session_log_dir, serial_log }
    }

    async fn run(
        &self,
        program: &str,
        args: &[&str],
    ) -> Result<String, OpsError> {
        let output =
            self.executor.execute(Command::new(program).args(args)).await?;
        Ok(output.stdout_str())
    }

    /// Finds the interface with the endpoint's MAC, falling back to one
    /// already carrying the endpoint's name.
    fn find_interface(
        &self,
        endpoint: &NetworkEndpoint,
    ) -> Result<String, OpsError> {
        let entries = std::fs::read_dir(SYS_CLASS_NET).map_err(|err| {
            OpsError::Io { what: "listing", path: SYS_CLASS_NET.into(), err }
        })?;
        let mac = endpoint.mac.to_lowercase();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let address =
                std::fs::read_to_string(entry.path().join("address"))
                    .unwrap_or_default();
            if (!mac.is_empty() && address.trim() == mac)
                || (mac.is_empty() && name == endpoint.name)
            {
                return Ok(name);
            }
        }
        Err(OpsError::NoInterface(endpoint.name.clone()))
    }

    async fn current_address(
        &self,
        interface: &str,
    ) -> Result<Option<Ipv4Addr>, OpsError> {
        let out = self
            .run("ip", &["-4", "-o", "addr", "show", "dev", interface])
            .await?;
        Ok(parse_inet(&out))
    }

    fn write_resolv_conf(
        &self,
        nameservers: &[Ipv4Addr],
    ) -> Result<(), OpsError> {
        let contents: String = nameservers
            .iter()
            .map(|ns| format!("nameserver {ns}\n"))
            .collect();
        std::fs::write(RESOLV_CONF, contents).map_err(|err| OpsError::Io {
            what: "writing",
            path: RESOLV_CONF.into(),
            err,
        })
    }

    fn session_log(&self, id: &str) -> MultiWriter {
        let writer = MultiWriter::new();
        let path = self.session_log_dir.join(format!("{id}.log"));
        let open = |path: &Utf8Path| {
            std::fs::OpenOptions::new().create(true).append(true).open(path)
        };
        match open(&path) {
            Ok(file) => writer.add(Box::new(file)),
            Err(err) => {
                warn!(self.log, "cannot open session log";
                    "path" => %path, "error" => %err);
            }
        }
        if let Some(serial) = &self.serial_log {
            match std::fs::OpenOptions::new().write(true).open(serial) {
                Ok(file) => writer.add(Box::new(file)),
                Err(err) => {
                    warn!(self.log, "cannot open serial log";
                        "path" => %serial, "error" => %err);
                }
            }
        }
        writer
    }
}

/// Pulls the first IPv4 address out of `ip -o addr` output.
fn parse_inet(output: &str) -> Option<Ipv4Addr> {
    let mut words = output.split_whitespace();
    words.find(|w| *w == "inet")?;
    let cidr = words.next()?;
    cidr.split('/').next()?.parse().ok()
}

/// Copies `reader` into `writer` until end of file.
fn relay(
    mut reader: process::BoxedReader,
    mut writer: MultiWriter,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = buf[..n].to_vec();
                    let mut w = writer.clone();
                    let res = tokio::task::spawn_blocking(move || {
                        std::io::Write::write_all(&mut w, &chunk)
                    })
                    .await;
                    if !matches!(res, Ok(Ok(()))) {
                        break;
                    }
                }
            }
        }
        let _ = std::io::Write::flush(&mut writer);
    })
}

#[async_trait]
impl Operations for HostOperations {
    async fn set_hostname(
        &self,
        hostname: &str,
        alias: &str,
    ) -> Result<(), OpsError> {
        self.run("hostname", &[hostname]).await?;
        let hosts = format!(
            "127.0.0.1 localhost\n::1 localhost\n127.0.1.1 {hostname} {alias}\n"
        );
        std::fs::write("/etc/hosts", hosts).map_err(|err| OpsError::Io {
            what: "writing",
            path: "/etc/hosts".into(),
            err,
        })
    }

    async fn apply_endpoint(
        &self,
        endpoint: &NetworkEndpoint,
    ) -> Result<Option<Ipv4Addr>, OpsError> {
        let interface = self.find_interface(endpoint)?;
        let name = endpoint.name.as_str();
        if interface != name {
            info!(self.log, "renaming interface";
                "from" => &interface, "to" => name);
            self.run("ip", &["link", "set", "dev", &interface, "down"]).await?;
            self.run("ip", &["link", "set", "dev", &interface, "name", name])
                .await?;
        }
        self.run("ip", &["link", "set", "dev", name, "up"]).await?;

        if endpoint.static_ip.is_empty() {
            self.run("dhclient", &["-1", name]).await?;
        } else {
            let cidr = endpoint.static_ip.as_str();
            self.run("ip", &["addr", "replace", cidr, "dev", name]).await?;
            if let (Some(gateway), true) =
                (endpoint.gateway, endpoint.default_route)
            {
                let via = gateway.to_string();
                let route =
                    ["route", "replace", "default", "via", &via, "dev", name];
                self.run("ip", &route).await?;
            }
        }
        if endpoint.default_route && !endpoint.nameservers.is_empty() {
            self.write_resolv_conf(&endpoint.nameservers)?;
        }
        self.current_address(name).await
    }

    async fn mount_label(
        &self,
        label: &str,
        path: &Utf8Path,
    ) -> Result<(), OpsError> {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(path)
            .map_err(|err| OpsError::Io {
                what: "creating",
                path: path.to_owned(),
                err,
            })?;
        self.run("mount", &["-L", label, path.as_str()]).await?;
        Ok(())
    }

    async fn sync(&self) -> Result<(), OpsError> {
        self.run("sync", &[]).await?;
        Ok(())
    }

    async fn power_off(&self) -> Result<(), OpsError> {
        self.run("poweroff", &["-f"]).await?;
        Ok(())
    }

    async fn restart(&self) -> Result<(), OpsError> {
        self.run("reboot", &["-f"]).await?;
        Ok(())
    }

    async fn enable_ssh(&self, authorized_keys: &str) -> Result<(), OpsError> {
        let path = Utf8Path::new(AUTHORIZED_KEYS);
        if let Some(dir) = path.parent() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(dir)
                .map_err(|err| OpsError::Io {
                    what: "creating",
                    path: dir.to_owned(),
                    err,
                })?;
        }
        let io = |err| OpsError::Io { what: "writing", path: path.into(), err };
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(io)?;
        std::io::Write::write_all(&mut file, authorized_keys.as_bytes())
            .map_err(io)?;
        self.run("systemctl", &["start", "sshd"]).await?;
        Ok(())
    }

    async fn set_password(&self, password: &str) -> Result<(), OpsError> {
        let input = format!("root:{password}\n");
        self.executor
            .execute_with_input(&mut Command::new("chpasswd"), input.as_bytes())
            .await?;
        Ok(())
    }

    async fn launch(&self, session: &SessionConfig) -> Result<u32, OpsError> {
        std::fs::DirBuilder::new()
            .recursive(true)
            .create(&self.session_log_dir)
            .map_err(|err| OpsError::Io {
                what: "creating",
                path: self.session_log_dir.clone(),
                err,
            })?;
        let spawned = process::spawn(&process_spec(session))?;
        let log = self.session_log(&session.id);
        relay(spawned.output, log.clone());
        if let Some(errors) = spawned.errors {
            relay(errors, log);
        }
        debug!(self.log, "launched";
            "session" => &session.id, "pid" => spawned.pid);
        // Sessions that do not take input see end of file.
        drop(spawned.input);
        Ok(spawned.pid)
    }

    async fn exec(&self, spec: &ProcessSpec) -> Result<Spawned, OpsError> {
        Ok(process::spawn(spec)?)
    }

    fn signal(&self, pid: u32, signal: i32) -> Result<(), OpsError> {
        let pgid = libc::pid_t::try_from(pid)
            .map_err(|_| OpsError::Signal {
                pid,
                err: std::io::Error::from_raw_os_error(libc::ESRCH),
            })?;
        // SAFETY: kill has no memory-safety preconditions.
        if unsafe { libc::kill(-pgid, signal) } == 0 {
            return Ok(());
        }
        // Not a group leader; try the process itself.
        // SAFETY: as above.
        if unsafe { libc::kill(pgid, signal) } == 0 {
            return Ok(());
        }
        Err(OpsError::Signal { pid, err: std::io::Error::last_os_error() })
    }
}

/// An [`Operations`] implementation that only records what it was asked
#[derive(Default)]
pub struct FakeOperations {
    next_pid: AtomicU32,
    calls: Mutex<Vec<String>>,
    launched: Mutex<Vec<(String, u32)>>,
    signals: Mutex<Vec<(u32, i32)>>,
    addresses: Mutex<BTreeMap<String, Ipv4Addr>>,
    failing_launch: Mutex<Option<String>>,
    failing_signal: Mutex<Option<i32>>,
}

impl FakeOperations {
    pub fn new() -> Arc<FakeOperations> {
        Arc::new(FakeOperations {
            next_pid: AtomicU32::new(100),
            ..Default::default()
        })
    }

    pub fn as_operations(self: Arc<Self>) -> BoxedOperations {
        self
    }

    /// Address handed out when `endpoint` is applied without a static
    /// address.
    pub fn set_dynamic_address(&self, endpoint: &str, address: Ipv4Addr) {
        self.addresses.lock().unwrap().insert(endpoint.to_string(), address);
    }

    /// Makes launches of session `id` fail.
    pub fn fail_launch(&self, id: &str) {
        *self.failing_launch.lock().unwrap() = Some(id.to_string());
    }

    /// Makes delivery of `signal` fail, as if the process were gone.  The
    /// attempt is still recorded.
    pub fn fail_signal(&self, signal: i32) {
        *self.failing_signal.lock().unwrap() = Some(signal);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// `(session id, pid)` of each launch, in order
    pub fn launched(&self) -> Vec<(String, u32)> {
        self.launched.lock().unwrap().clone()
    }

    pub fn signals(&self) -> Vec<(u32, i32)> {
        self.signals.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Operations for FakeOperations {
    async fn set_hostname(
        &self,
        hostname: &str,
        alias: &str,
    ) -> Result<(), OpsError> {
        self.record(format!("hostname {hostname} {alias}"));
        Ok(())
    }

    async fn apply_endpoint(
        &self,
        endpoint: &NetworkEndpoint,
    ) -> Result<Option<Ipv4Addr>, OpsError> {
        self.record(format!(
            "endpoint {} {}",
            endpoint.name, endpoint.static_ip
        ));
        if endpoint.static_ip.is_empty() {
            let addresses = self.addresses.lock().unwrap();
            return Ok(addresses.get(&endpoint.name).copied());
        }
        let address = endpoint.static_ip.split('/').next().unwrap_or_default();
        address
            .parse()
            .map(Some)
            .map_err(|_| OpsError::InvalidAddress(endpoint.static_ip.clone()))
    }

    async fn mount_label(
        &self,
        label: &str,
        path: &Utf8Path,
    ) -> Result<(), OpsError> {
        self.record(format!("mount {label} {path}"));
        Ok(())
    }

    async fn sync(&self) -> Result<(), OpsError> {
        self.record("sync".to_string());
        Ok(())
    }

    async fn power_off(&self) -> Result<(), OpsError> {
        self.record("poweroff".to_string());
        Ok(())
    }

    async fn restart(&self) -> Result<(), OpsError> {
        self.record("reboot".to_string());
        Ok(())
    }

    async fn enable_ssh(&self, authorized_keys: &str) -> Result<(), OpsError> {
        self.record(format!("enable-ssh {authorized_keys}"));
        Ok(())
    }

    async fn set_password(&self, password: &str) -> Result<(), OpsError> {
        self.record(format!("passwd {password}"));
        Ok(())
    }

    async fn launch(&self, session: &SessionConfig) -> Result<u32, OpsError> {
        let failing = self.failing_launch.lock().unwrap().clone();
        if failing.as_deref() == Some(session.id.as_str()) {
            return Err(SpawnError::NotFound(session.cmd.path.clone()).into());
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.launched.lock().unwrap().push((session.id.clone(), pid));
        Ok(pid)
    }

    async fn exec(&self, spec: &ProcessSpec) -> Result<Spawned, OpsError> {
        self.record(format!("exec {}", spec.args.join(" ")));
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (input, _) = tokio::io::duplex(64);
        Ok(Spawned {
            pid,
            output: Box::new(std::io::Cursor::new(
                spec.args.join(" ").into_bytes(),
            )),
            errors: None,
            input: Some(Box::new(input)),
            pty: None,
        })
    }

    fn signal(&self, pid: u32, signal: i32) -> Result<(), OpsError> {
        self.signals.lock().unwrap().push((pid, signal));
        if *self.failing_signal.lock().unwrap() == Some(signal) {
            return Err(OpsError::Signal {
                pid,
                err: std::io::Error::from_raw_os_error(libc::ESRCH),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::executor::{CommandScript, FakeExecutor, Input, Output};
    use vch_test_utils::dev::test_setup_log;

    #[test]
    fn inet_parsing() {
        let out = "2: ens160    inet 10.118.81.7/24 brd 10.118.81.255 scope \
                   global dynamic ens160\\       valid_lft 3591sec";
        assert_eq!(parse_inet(out), Some(Ipv4Addr::new(10, 118, 81, 7)));
        assert_eq!(parse_inet(""), None);
    }

    #[test]
    fn session_process_spec() {
        let mut session = SessionConfig::create("/bin/sleep", &["60"]);
        session.cmd.env = vec!["PATH=/bin".into()];
        session.tty = true;
        let spec = process_spec(&session);
        assert_eq!(spec.args, vec!["/bin/sleep", "60"]);
        assert_eq!(spec.dir, None);
        assert!(spec.tty);
    }

    #[tokio::test]
    async fn host_operations_shell_out() {
        let logctx = test_setup_log("host_operations_shell_out");
        let executor = FakeExecutor::new(logctx.log.clone());
        let mut script = CommandScript::new();
        script
            .then_call(Box::new(|input: &Input, stdin: &[u8]| {
                assert_eq!(input.program, "chpasswd");
                assert_eq!(stdin, b"root:s3cret\n");
                Output::success()
            }))
            .then(
                Input::shell("ip -4 -o addr show dev client"),
                Output::success().set_stdout(
                    "3: client    inet 10.0.0.5/24 scope global client",
                ),
            )
            .then_fail("sync");
        script.install(&executor);

        let dir = camino_tempfile::tempdir().unwrap();
        let ops = HostOperations::new(
            logctx.log.clone(),
            executor.clone().as_executor(),
            dir.path().to_owned(),
            None,
        );
        ops.set_password("s3cret").await.unwrap();
        assert_eq!(
            ops.current_address("client").await.unwrap(),
            Some(Ipv4Addr::new(10, 0, 0, 5))
        );
        assert!(matches!(ops.sync().await, Err(OpsError::Execution(_))));
        assert_eq!(executor.history().len(), 3);
        logctx.cleanup_successful();
    }
}
