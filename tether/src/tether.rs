// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The supervision loop

use crate::config::Config;
use crate::executor::ReapGuard;
use crate::guestinfo::{self, GuestInfo};
use crate::ops::{BoxedOperations, OpsError};
use crate::process::{ProcessSpec, Spawned};
use crate::reaper::{ChildWaiter, Owner, PidMap, Reaper, SessionExit};
use crate::signals::Signal;
use crate::toolbox::{Toolbox, ToolboxError};
use crate::Error;
use camino::Utf8Path;
use slog::{debug, error, info, o, warn, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_util::sync::CancellationToken;
use vch_common::config::{
    ExecutorConfig, ExitLog, NetworkEndpoint, SessionConfig, CLIENT_IP_KEY,
    CLIENT_NETWORK,
};
use vch_common::extraconfig::{ExtraConfig, Published, SecretKey};

/// How long sessions get to exit after being signalled during halt or
/// reboot before they are killed
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Debug levels above this keep exited sessions and the VM around for
/// inspection.
const DEBUG_KEEP_ALIVE: u8 = 2;

#[derive(Default)]
struct State {
    config: ExecutorConfig,
    secret_key: Option<SecretKey>,
    /// What was last written to guest-info
    published: ExtraConfig,
    /// Sessions launched in this lifetime that are still running
    running: BTreeMap<String, u32>,
    /// Sessions launched in this lifetime that have since exited
    exited: BTreeSet<String>,
    mounted: BTreeSet<String>,
    /// Running sessions stopped because their command changed, to be
    /// launched again once they exit
    replacing: BTreeSet<String>,
    stopping: bool,
}

/// A back-channel process started by [`Tether::exec`]
pub struct Exec {
    pub spawned: Spawned,
    /// Resolves to the exit status once the reaper has collected the process
    pub exit: oneshot::Receiver<i32>,
}

#[derive(Clone, Copy, Debug, strum::Display)]
#[strum(serialize_all = "lowercase")]
enum PowerAction {
    Halt,
    Reboot,
}

pub struct Tether {
    log: Logger,
    config: Config,
    guest_info: Arc<dyn GuestInfo>,
    ops: BoxedOperations,
    reap_guard: ReapGuard,
    pids: PidMap,
    state: tokio::sync::Mutex<State>,
    reload_requested: Notify,
    running_count: watch::Sender<usize>,
    stop: CancellationToken,
    exit_tx: mpsc::UnboundedSender<SessionExit>,
    exit_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionExit>>>,
}

impl Tether {
    pub fn new(
        log: Logger,
        config: Config,
        guest_info: Arc<dyn GuestInfo>,
        ops: BoxedOperations,
        reap_guard: ReapGuard,
    ) -> Arc<Tether> {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Arc::new(Tether {
            log,
            config,
            guest_info,
            ops,
            reap_guard,
            pids: PidMap::default(),
            state: tokio::sync::Mutex::new(State::default()),
            reload_requested: Notify::new(),
            running_count: watch::channel(0).0,
            stop: CancellationToken::new(),
            exit_tx,
            exit_rx: Mutex::new(Some(exit_rx)),
        })
    }

    /// Builds the reaper that reports this tether's session exits.
    pub fn reaper(&self, waiter: Arc<dyn ChildWaiter>) -> Reaper {
        Reaper::new(
            self.log.new(o!("component" => "reaper")),
            waiter,
            Arc::clone(&self.pids),
            Arc::clone(&self.reap_guard),
            self.exit_tx.clone(),
        )
    }

    pub fn request_reload(&self) {
        self.reload_requested.notify_one();
    }

    /// Ends [`Tether::run`]; sessions that exit afterwards are not restarted.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Loads the configuration, starts what it declares and then supervises
    /// it until stopped.
    pub async fn run(&self) -> Result<(), Error> {
        let mut exits =
            self.exit_rx.lock().unwrap().take().ok_or(Error::AlreadyRunning)?;

        self.reload().await?;
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = self.reload_requested.notified() => {
                    if let Err(err) = self.reload().await {
                        error!(self.log, "reload failed"; "error" => %err);
                    }
                }
                Some(exit) = exits.recv() => {
                    self.handle_session_exit(exit).await;
                }
            }
        }

        self.state.lock().await.stopping = true;
        info!(self.log, "tether stopped");
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&dyn GuestInfo) -> Result<T, guestinfo::GuestInfoError>
            + Send
            + 'static,
    {
        let guest_info = Arc::clone(&self.guest_info);
        tokio::task::spawn_blocking(move || f(guest_info.as_ref()))
            .await
            .map_err(|err| Error::Join(err.to_string()))?
            .map_err(Error::from)
    }

    async fn load(
        &self,
    ) -> Result<(ExecutorConfig, Option<SecretKey>), Error> {
        self.blocking(|guest_info| {
            let key = guestinfo::secret_key(guest_info)?;
            let config = guestinfo::load(guest_info, key.as_ref())?;
            Ok((config, key))
        })
        .await
    }

    async fn publish(&self, state: &mut State) -> Result<(), Error> {
        let previous = state.published.clone();
        let config = state.config.clone();
        let key = state.secret_key.clone();
        state.published = self
            .blocking(move |guest_info| {
                guestinfo::publish(guest_info, &previous, &config, key.as_ref())
            })
            .await?;
        Ok(())
    }

    /// Brings the VM in line with the configuration in guest-info.
    pub async fn reload(&self) -> Result<(), Error> {
        let (mut config, secret_key) = self.load().await?;
        if let Some(level) = self.config.debug_level {
            config.diagnostics.debug_level = level;
        }

        let mut state = self.state.lock().await;
        if state.stopping {
            debug!(self.log, "stopping; ignoring reload");
            return Ok(());
        }
        info!(self.log, "applying configuration";
            "id" => &config.id, "name" => &config.name);

        if let Err(err) =
            self.ops.set_hostname(&short_id(&config.id), &config.name).await
        {
            warn!(self.log, "failed to set hostname"; "error" => %err);
        }

        for (name, endpoint) in config.networks.iter_mut() {
            if let Some(current) = state.config.networks.get(name) {
                if unchanged(current, endpoint) {
                    endpoint.assigned = Published(current.assigned.0);
                    continue;
                }
            }
            match self.ops.apply_endpoint(endpoint).await {
                Ok(address) => endpoint.assigned = Published(address),
                Err(err) => {
                    warn!(self.log, "failed to apply network endpoint";
                        "endpoint" => &endpoint.name, "error" => %err);
                }
            }
        }
        let client_ip = config
            .networks
            .get(CLIENT_NETWORK)
            .and_then(|endpoint| endpoint.assigned_ip());
        if let Some(ip) = client_ip {
            self.blocking(move |g| g.set(CLIENT_IP_KEY, &ip.to_string()))
                .await?;
        }

        for mount in config.mounts.values() {
            if state.mounted.contains(&mount.label) {
                continue;
            }
            let path = Utf8Path::new(&mount.path);
            match self.ops.mount_label(&mount.label, path).await {
                Ok(()) => {
                    state.mounted.insert(mount.label.clone());
                }
                Err(err) => {
                    warn!(self.log, "failed to mount volume";
                        "label" => &mount.label, "error" => %err);
                }
            }
        }

        for (id, session) in config.sessions.iter_mut() {
            if let Some(&pid) = state.running.get(id) {
                let changed = state
                    .config
                    .sessions
                    .get(id)
                    .is_some_and(|current| current.cmd != session.cmd);
                if changed && state.replacing.insert(id.clone()) {
                    let signal = state
                        .config
                        .sessions
                        .get(id)
                        .map(stop_signal)
                        .unwrap_or(Signal::Term);
                    info!(self.log, "stopping session to apply new command";
                        "session" => id, "signal" => %signal);
                    if let Err(err) = self.ops.signal(pid, signal.number()) {
                        warn!(self.log, "failed to stop session";
                            "session" => id, "error" => %err);
                        state.replacing.remove(id);
                    }
                }
                continue;
            }
            if state.exited.contains(id) {
                if state.replacing.remove(id) {
                    info!(self.log, "launching session with new command";
                        "session" => id);
                } else if session.restart {
                    session.diagnostics.resurrection_count += 1;
                    info!(self.log, "relaunching session"; "session" => id,
                        "resurrections" =>
                            session.diagnostics.resurrection_count);
                } else {
                    continue;
                }
            } else if !session.active {
                continue;
            }
            self.launch(&mut state, session).await;
        }

        let undeclared: Vec<(String, u32)> = state
            .running
            .iter()
            .filter(|(id, _)| !config.sessions.contains_key(*id))
            .map(|(id, pid)| (id.clone(), *pid))
            .collect();
        for (id, pid) in undeclared {
            state.replacing.remove(&id);
            let signal = state
                .config
                .sessions
                .get(&id)
                .map(stop_signal)
                .unwrap_or(Signal::Term);
            info!(self.log, "stopping session no longer configured";
                "session" => &id, "signal" => %signal);
            if let Err(err) = self.ops.signal(pid, signal.number()) {
                warn!(self.log, "failed to stop session";
                    "session" => &id, "error" => %err);
            }
        }

        state.config = config;
        state.secret_key = secret_key;
        self.publish(&mut state).await
    }

    async fn launch(&self, state: &mut State, session: &mut SessionConfig) {
        let id = session.id.clone();
        let launched = {
            let _shared = self.reap_guard.read().await;
            let launched = self.ops.launch(session).await;
            if let Ok(pid) = launched {
                let owner = Owner::Session(id.clone());
                self.pids.lock().unwrap().insert(pid, owner);
            }
            launched
        };
        match launched {
            Ok(pid) => {
                info!(self.log, "launched session";
                    "session" => &id, "pid" => pid);
                state.running.insert(id.clone(), pid);
                state.exited.remove(&id);
                session.started = Published("true".to_string());
            }
            Err(err) => {
                error!(self.log, "failed to launch session";
                    "session" => &id, "error" => %err);
                // Counts as an exit so that a restart policy applies.
                state.exited.insert(id);
                session.started = Published(err.to_string());
            }
        }
        self.running_count.send_replace(state.running.len());
    }

    /// Records the exit of a session and applies its restart policy.
    pub async fn handle_session_exit(&self, exit: SessionExit) {
        let mut state = self.state.lock().await;
        if state.running.get(&exit.id) != Some(&exit.pid) {
            warn!(self.log, "exit for unknown session";
                "session" => &exit.id, "pid" => exit.pid);
            return;
        }
        state.running.remove(&exit.id);
        state.exited.insert(exit.id.clone());
        self.running_count.send_replace(state.running.len());

        let restart = match state.config.sessions.get_mut(&exit.id) {
            Some(session) => {
                session.exit_status = Published(exit.status);
                session.diagnostics.record_exit(ExitLog {
                    time: chrono::Utc::now().timestamp(),
                    exit_status: exit.status,
                    message: format!("exited with status {}", exit.status),
                });
                session.restart
            }
            None => false,
        };
        if let Err(err) = self.publish(&mut state).await {
            error!(self.log, "failed to publish session exit";
                "session" => &exit.id, "error" => %err);
        }

        if state.stopping {
            return;
        }
        if state.replacing.contains(&exit.id) {
            self.request_reload();
            return;
        }
        if !restart {
            return;
        }
        let level = state.config.debug_level();
        if level > DEBUG_KEEP_ALIVE {
            warn!(self.log, "squashing relaunch of exited session";
                "session" => &exit.id, "debug_level" => level);
            return;
        }
        self.request_reload();
    }

    /// Starts a process on behalf of a back-channel client.
    pub async fn exec(&self, spec: &ProcessSpec) -> Result<Exec, OpsError> {
        let _shared = self.reap_guard.read().await;
        let spawned = self.ops.exec(spec).await?;
        let (tx, exit) = oneshot::channel();
        self.pids.lock().unwrap().insert(spawned.pid, Owner::Exec(tx));
        Ok(Exec { spawned, exit })
    }

    pub fn signal(&self, pid: u32, signal: Signal) -> Result<(), OpsError> {
        self.ops.signal(pid, signal.number())
    }

    pub async fn container_id(&self) -> String {
        self.state.lock().await.config.id.clone()
    }

    /// PEM host key for the back-channel's SSH server
    pub async fn host_key(&self) -> String {
        self.state.lock().await.config.host_key.expose().clone()
    }

    /// Applies a static address to the endpoint carrying the default route.
    pub async fn static_ip_address(
        &self,
        cidr: &str,
        gateway: &str,
    ) -> Result<Option<Ipv4Addr>, Error> {
        let gateway: Ipv4Addr = gateway
            .parse()
            .map_err(|_| Error::InvalidAddress(gateway.to_string()))?;
        self.configure_primary(|endpoint| {
            endpoint.static_ip = cidr.to_string();
            endpoint.gateway = Some(gateway);
        })
        .await
    }

    /// Configures the endpoint carrying the default route by DHCP.
    pub async fn dynamic_ip_address(&self) -> Result<Ipv4Addr, Error> {
        self.configure_primary(|endpoint| endpoint.static_ip.clear())
            .await?
            .ok_or(Error::NoAddress)
    }

    async fn configure_primary<F>(
        &self,
        change: F,
    ) -> Result<Option<Ipv4Addr>, Error>
    where
        F: FnOnce(&mut NetworkEndpoint),
    {
        let mut state = self.state.lock().await;
        let endpoint = {
            let networks = &mut state.config.networks;
            let name = networks
                .values()
                .find(|e| e.default_route)
                .or_else(|| networks.values().next())
                .map(|e| e.name.clone())
                .ok_or(Error::NoEndpoint)?;
            let endpoint =
                networks.get_mut(&name).ok_or(Error::NoEndpoint)?;
            change(endpoint);
            endpoint.clone()
        };
        let address = self.ops.apply_endpoint(&endpoint).await?;
        if let Some(endpoint) = state.config.networks.get_mut(&endpoint.name) {
            endpoint.assigned = Published(address);
        }
        self.publish(&mut state).await?;
        Ok(address)
    }

    pub async fn mount_label(
        &self,
        label: &str,
        path: &Utf8Path,
    ) -> Result<(), OpsError> {
        self.ops.mount_label(label, path).await?;
        self.state.lock().await.mounted.insert(label.to_string());
        Ok(())
    }

    pub async fn sync(&self) -> Result<(), OpsError> {
        self.ops.sync().await
    }

    /// Runs one of the synthetic guest programs, returning its exit code.
    pub async fn start_program(
        &self,
        path: &str,
        args: &str,
    ) -> Result<i32, ToolboxError> {
        let log = self.log.new(o!("component" => "Toolbox"));
        Toolbox::new(log, self.ops.clone()).start_program(path, args).await
    }

    /// Stops every session, flushes filesystems and powers the VM off.
    pub async fn halt(&self) -> Result<(), Error> {
        self.power(PowerAction::Halt).await
    }

    /// As [`Tether::halt`], restarting the VM instead.
    pub async fn reboot(&self) -> Result<(), Error> {
        self.power(PowerAction::Reboot).await
    }

    async fn power(&self, action: PowerAction) -> Result<(), Error> {
        let level = self.state.lock().await.config.debug_level();
        if level > DEBUG_KEEP_ALIVE {
            warn!(self.log, "debug level set; not powering off";
                "action" => %action, "debug_level" => level);
            return Ok(());
        }
        info!(self.log, "draining sessions"; "action" => %action);
        self.drain().await;
        self.ops.sync().await?;
        match action {
            PowerAction::Halt => self.ops.power_off().await?,
            PowerAction::Reboot => self.ops.restart().await?,
        }
        Ok(())
    }

    async fn drain(&self) {
        let mut count = self.running_count.subscribe();
        let running = {
            let mut state = self.state.lock().await;
            state.stopping = true;
            let running: Vec<(String, u32)> = state
                .running
                .iter()
                .map(|(id, pid)| (id.clone(), *pid))
                .collect();
            for (id, pid) in &running {
                let signal = state
                    .config
                    .sessions
                    .get(id)
                    .map(stop_signal)
                    .unwrap_or(Signal::Term);
                if let Err(err) = self.ops.signal(*pid, signal.number()) {
                    warn!(self.log, "failed to stop session";
                        "session" => id, "error" => %err);
                }
            }
            running
        };

        let drained = matches!(
            tokio::time::timeout(
                DRAIN_TIMEOUT,
                count.wait_for(|running| *running == 0),
            )
            .await,
            Ok(Ok(_))
        );
        if !drained {
            let state = self.state.lock().await;
            for (id, pid) in running {
                if state.running.get(&id) == Some(&pid) {
                    warn!(self.log, "killing session that did not stop";
                        "session" => &id);
                    if let Err(err) =
                        self.ops.signal(pid, Signal::Kill.number())
                    {
                        warn!(self.log, "failed to kill session";
                            "session" => &id, "error" => %err);
                    }
                }
            }
        }
    }

    /// Asks the primary session to suspend itself.
    pub async fn suspend(&self) -> Result<(), Error> {
        let state = self.state.lock().await;
        let primary = state.config.id.clone();
        let pid = *state
            .running
            .get(&primary)
            .ok_or_else(|| Error::NotRunning(primary.clone()))?;
        info!(self.log, "suspending primary session"; "session" => &primary);
        self.ops.signal(pid, Signal::Usr2.number())?;
        Ok(())
    }

    /// Pid of a running session
    pub async fn session_pid(&self, id: &str) -> Option<u32> {
        self.state.lock().await.running.get(id).copied()
    }
}

/// Whether an endpoint that is already up needs no further work
fn unchanged(current: &NetworkEndpoint, wanted: &NetworkEndpoint) -> bool {
    current.assigned_ip().is_some()
        && current.static_ip == wanted.static_ip
        && current.gateway == wanted.gateway
        && current.mac == wanted.mac
}

fn stop_signal(session: &SessionConfig) -> Signal {
    Signal::parse(&session.stop_signal).unwrap_or(Signal::Term)
}

/// Hostnames are limited, so only the leading part of an id is used.
fn short_id(id: &str) -> String {
    id.chars().take(12).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn short_ids() {
        assert_eq!(short_id("vm-42"), "vm-42");
        assert_eq!(
            short_id("6f1a8a0b3cbe1d2e3f4a5b6c7d8e9f00"),
            "6f1a8a0b3cbe"
        );
    }

    #[test]
    fn stop_signals() {
        let mut session = SessionConfig::default();
        assert_eq!(stop_signal(&session), Signal::Term);
        session.stop_signal = "SIGINT".into();
        assert_eq!(stop_signal(&session), Signal::Int);
    }
}
