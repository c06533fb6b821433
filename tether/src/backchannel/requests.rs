// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Back-channel requests and their handling
//!
//! Requests are answered with a [`Reply`]; work that must only start once
//! the client has seen the reply (relaying an exec'd process's output, for
//! instance) is returned alongside it as [`Pending`].

use crate::process::ProcessSpec;
use crate::signals::Signal;
use crate::tether::{Exec, Tether};
use camino::Utf8Path;
use serde::Deserialize;
use slog::{debug, info, warn, Logger};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GlobalRequest {
    ContainerId,
    IpAddress { cidr: String, gateway: String },
    DynamicIpAddress,
    MountLabel { label: String, mountpoint: String },
    StartProgram { path: String, args: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelRequest {
    Shell,
    PtyReq { term: String, columns: u32, rows: u32, width: u32, height: u32 },
    WindowChange { columns: u32, rows: u32, width: u32, height: u32 },
    Env { name: String, value: String },
    Exec { command: String },
    ExecArgs(Vec<String>),
    ExecConfig { name: String, value: String },
    Signal(String),
    Kill,
    Sync,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Global(GlobalRequest),
    Channel(ChannelRequest),
}

#[derive(Debug, Deserialize)]
struct NameValue {
    name: String,
    value: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown request type: {0}")]
    Unknown(String),
    #[error("{request} request requires {expected}")]
    Payload { request: String, expected: &'static str },
}

impl Request {
    /// Parses a request given by name, with any payload as JSON after the
    /// first space: `ip-address ["10.0.0.2/24", "10.0.0.1"]`.
    pub fn parse(line: &str) -> Result<Request, ParseError> {
        let (name, payload) =
            line.split_once(' ').map_or((line, ""), |(n, p)| (n, p.trim()));
        let bad = |expected| ParseError::Payload {
            request: name.to_string(),
            expected,
        };
        let request = match name {
            "container-id" => Request::Global(GlobalRequest::ContainerId),
            "ip-address" => {
                let args: Vec<String> = serde_json::from_str(payload)
                    .map_err(|_| bad("CIDR address and gateway"))?;
                let [cidr, gateway]: [String; 2] = args
                    .try_into()
                    .map_err(|_| bad("CIDR address and gateway"))?;
                Request::Global(GlobalRequest::IpAddress { cidr, gateway })
            }
            "dynamic-ip-address" => {
                Request::Global(GlobalRequest::DynamicIpAddress)
            }
            "mount-label" => {
                let nv: NameValue = serde_json::from_str(payload)
                    .map_err(|_| bad("a label and mountpoint"))?;
                Request::Global(GlobalRequest::MountLabel {
                    label: nv.name,
                    mountpoint: nv.value,
                })
            }
            "start-program" => {
                let nv: NameValue = serde_json::from_str(payload)
                    .map_err(|_| bad("a program and its arguments"))?;
                Request::Global(GlobalRequest::StartProgram {
                    path: nv.name,
                    args: nv.value,
                })
            }
            "exec-args" => {
                let args = serde_json::from_str(payload)
                    .map_err(|_| bad("a list of arguments"))?;
                Request::Channel(ChannelRequest::ExecArgs(args))
            }
            "exec-config" => {
                let nv: NameValue = serde_json::from_str(payload)
                    .map_err(|_| bad("a name and value"))?;
                Request::Channel(ChannelRequest::ExecConfig {
                    name: nv.name,
                    value: nv.value,
                })
            }
            "kill" => Request::Channel(ChannelRequest::Kill),
            "sync" => Request::Channel(ChannelRequest::Sync),
            other => return Err(ParseError::Unknown(other.to_string())),
        };
        Ok(request)
    }
}

/// Answer to a request; a failure carries a UTF-8 message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub ok: bool,
    pub payload: Vec<u8>,
}

impl Reply {
    pub fn ok() -> Reply {
        Reply { ok: true, payload: Vec::new() }
    }

    pub fn with_payload(payload: impl Into<Vec<u8>>) -> Reply {
        Reply { ok: true, payload: payload.into() }
    }

    pub fn failure(message: impl ToString) -> Reply {
        Reply { ok: false, payload: message.to_string().into_bytes() }
    }
}

/// Work to start once the reply has been sent
pub enum Pending {
    /// Relay the process's streams, then report its exit status and close
    Relay(Exec),
    /// Close the channel
    Close,
}

/// Answers a request that is not tied to a channel.
pub async fn handle_global(
    log: &Logger,
    tether: &Tether,
    request: GlobalRequest,
) -> Reply {
    debug!(log, "global request"; "request" => ?request);
    match request {
        GlobalRequest::ContainerId => {
            Reply::with_payload(tether.container_id().await)
        }
        GlobalRequest::IpAddress { cidr, gateway } => {
            match tether.static_ip_address(&cidr, &gateway).await {
                Ok(_) => Reply::ok(),
                Err(err) => Reply::failure(err),
            }
        }
        GlobalRequest::DynamicIpAddress => {
            match tether.dynamic_ip_address().await {
                Ok(address) => Reply::with_payload(address.to_string()),
                Err(err) => Reply::failure(err),
            }
        }
        GlobalRequest::MountLabel { label, mountpoint } => {
            let path = Utf8Path::new(&mountpoint);
            match tether.mount_label(&label, path).await {
                Ok(()) => Reply::ok(),
                Err(err) => Reply::failure(err),
            }
        }
        GlobalRequest::StartProgram { path, args } => {
            match tether.start_program(&path, &args).await {
                Ok(code) => Reply::with_payload(code.to_string()),
                Err(err) => Reply::failure(err),
            }
        }
    }
}

/// What the client has set up on one session channel
pub struct ChannelContext {
    log: Logger,
    tether: Arc<Tether>,
    env: BTreeMap<String, String>,
    args: Vec<String>,
    exec_config: BTreeMap<String, String>,
    tty: bool,
    /// Pid of the process started on this channel
    pid: Option<u32>,
    pty: Option<Arc<crate::process::Pty>>,
}

impl ChannelContext {
    pub fn new(log: Logger, tether: Arc<Tether>) -> Self {
        ChannelContext {
            log,
            tether,
            env: BTreeMap::new(),
            args: Vec::new(),
            exec_config: BTreeMap::new(),
            tty: false,
            pid: None,
            pty: None,
        }
    }

    pub async fn handle(
        &mut self,
        request: ChannelRequest,
    ) -> (Reply, Option<Pending>) {
        debug!(self.log, "channel request"; "request" => ?request);
        match request {
            ChannelRequest::Shell => {
                (Reply::failure("shell request is not supported"), None)
            }
            ChannelRequest::PtyReq { .. } => {
                self.tty = true;
                (Reply::ok(), None)
            }
            ChannelRequest::WindowChange { columns, rows, width, height } => {
                let Some(pty) = &self.pty else {
                    // Nothing to resize yet; not worth failing the client.
                    debug!(self.log, "window change without a pty");
                    return (Reply::ok(), None);
                };
                let clamp = |v: u32| u16::try_from(v).unwrap_or(u16::MAX);
                match pty.resize(
                    clamp(columns),
                    clamp(rows),
                    clamp(width),
                    clamp(height),
                ) {
                    Ok(()) => (Reply::ok(), None),
                    Err(err) => (Reply::failure(err), None),
                }
            }
            ChannelRequest::Env { name, value } => {
                self.env.insert(name, value);
                (Reply::ok(), None)
            }
            ChannelRequest::Exec { command } => self.exec(&command).await,
            ChannelRequest::ExecArgs(args) => {
                self.args = args;
                (Reply::ok(), None)
            }
            ChannelRequest::ExecConfig { name, value } => {
                self.exec_config.insert(name, value);
                (Reply::ok(), None)
            }
            ChannelRequest::Signal(name) => {
                let signal = match Signal::parse(&name) {
                    Ok(signal) => signal,
                    Err(err) => return (Reply::failure(err), None),
                };
                (self.signal(signal), None)
            }
            ChannelRequest::Kill => (self.signal(Signal::Kill), None),
            ChannelRequest::Sync => match self.tether.sync().await {
                Ok(()) => (Reply::ok(), None),
                Err(err) => (Reply::failure(err), None),
            },
        }
    }

    fn signal(&self, signal: Signal) -> Reply {
        let Some(pid) = self.pid else {
            return Reply::failure("no process running on this channel");
        };
        info!(self.log, "signalling process";
            "pid" => pid, "signal" => %signal);
        match self.tether.signal(pid, signal) {
            Ok(()) => Reply::ok(),
            Err(err) => Reply::failure(err),
        }
    }

    /// The process an `exec` request asks for: the command split on
    /// spaces, with any `exec-args` appended.
    pub fn process_spec(&self, command: &str) -> ProcessSpec {
        let mut args: Vec<String> = command
            .split(' ')
            .filter(|word| !word.is_empty())
            .map(str::to_string)
            .collect();
        args.extend(self.args.iter().cloned());
        for arg in args.iter_mut().skip(1) {
            if arg.len() >= 2 && arg.starts_with('"') && arg.ends_with('"') {
                *arg = arg[1..arg.len() - 1].to_string();
            }
        }
        ProcessSpec {
            path: args.first().cloned().unwrap_or_default(),
            args,
            env: self.env.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            dir: self.exec_config.get("dir").cloned(),
            tty: self.tty,
            ..Default::default()
        }
    }

    async fn exec(&mut self, command: &str) -> (Reply, Option<Pending>) {
        if self.pid.is_some() {
            return (Reply::failure("a process is already running"), None);
        }
        let spec = self.process_spec(command);
        if spec.path.is_empty() {
            return (Reply::failure("empty command"), Some(Pending::Close));
        }
        match self.tether.exec(&spec).await {
            Ok(mut exec) => {
                info!(self.log, "started process";
                    "pid" => exec.spawned.pid, "command" => &spec.path);
                self.pid = Some(exec.spawned.pid);
                self.pty = exec.spawned.pty.take().map(Arc::new);
                (Reply::ok(), Some(Pending::Relay(exec)))
            }
            Err(err) => {
                warn!(self.log, "failed to start process"; "error" => %err);
                (Reply::failure(err), Some(Pending::Close))
            }
        }
    }
}
