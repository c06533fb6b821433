// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SSH server side of the back-channel
//!
//! Standard channel requests map onto [`ChannelRequest`] directly.  Requests
//! SSH has no message for (the global requests, `exec-args`, `exec-config`,
//! `kill` and `sync`) arrive as subsystem requests named by the request with
//! an optional JSON payload; a successful reply's payload is sent back as
//! channel data.

use super::requests::{
    handle_global, ChannelContext, ChannelRequest, ParseError, Pending, Reply,
    Request,
};
use super::BackchannelError;
use crate::process::BoxedWriter;
use crate::tether::{Exec, Tether};
use async_trait::async_trait;
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Sig};
use russh_keys::key::PublicKey;
use slog::{debug, info, o, warn, Logger};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The only user a client may authenticate as
pub const USER: &str = "daemon";

/// Exit status reported when the reaper never saw the process exit
const UNKNOWN_EXIT_STATUS: u32 = 255;

const STDERR: u32 = 1;

/// Builds the server configuration around the appliance's host key.
pub fn server_config(
    host_key: &str,
) -> Result<Arc<russh::server::Config>, BackchannelError> {
    let key = russh_keys::decode_secret_key(host_key, None)?;
    Ok(Arc::new(russh::server::Config {
        keys: vec![key],
        ..Default::default()
    }))
}

/// Serves one SSH session over `stream` until the client disconnects.
pub async fn run<S>(
    log: &Logger,
    config: Arc<russh::server::Config>,
    stream: S,
    tether: Arc<Tether>,
) -> Result<(), BackchannelError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection = Connection {
        log: log.new(o!("component" => "ssh")),
        tether,
        channels: HashMap::new(),
    };
    russh::server::run_stream(config, stream, connection).await?.await
}

struct ChannelState {
    context: ChannelContext,
    input: Option<BoxedWriter>,
}

struct Connection {
    log: Logger,
    tether: Arc<Tether>,
    channels: HashMap<ChannelId, ChannelState>,
}

impl Connection {
    fn authorize(&self, user: &str) -> Auth {
        if user == USER {
            Auth::Accept
        } else {
            warn!(self.log, "rejecting user"; "user" => user);
            Auth::Reject { proceed_with_methods: None }
        }
    }

    async fn request(
        &mut self,
        channel: ChannelId,
        request: ChannelRequest,
        session: &mut Session,
    ) {
        let Some(state) = self.channels.get_mut(&channel) else {
            session.channel_failure(channel);
            return;
        };
        let (reply, pending) = state.context.handle(request).await;
        send_reply(channel, reply, session);
        match pending {
            None => (),
            Some(Pending::Close) => {
                session.close(channel);
            }
            Some(Pending::Relay(mut exec)) => {
                state.input = exec.spawned.input.take();
                let log = self.log.new(o!("pid" => exec.spawned.pid));
                let tether = Arc::clone(&self.tether);
                let handle = session.handle();
                tokio::spawn(relay(log, handle, channel, exec, tether));
            }
        }
    }
}

fn send_reply(channel: ChannelId, reply: Reply, session: &mut Session) {
    if reply.ok {
        if !reply.payload.is_empty() {
            session.data(channel, CryptoVec::from(reply.payload));
        }
        session.channel_success(channel);
    } else {
        if !reply.payload.is_empty() {
            let message = CryptoVec::from(reply.payload);
            session.extended_data(channel, STDERR, message);
        }
        session.channel_failure(channel);
    }
}

fn signal_name(signal: Sig) -> String {
    match signal {
        Sig::ABRT => "ABRT".to_string(),
        Sig::ALRM => "ALRM".to_string(),
        Sig::FPE => "FPE".to_string(),
        Sig::HUP => "HUP".to_string(),
        Sig::ILL => "ILL".to_string(),
        Sig::INT => "INT".to_string(),
        Sig::KILL => "KILL".to_string(),
        Sig::PIPE => "PIPE".to_string(),
        Sig::QUIT => "QUIT".to_string(),
        Sig::SEGV => "SEGV".to_string(),
        Sig::TERM => "TERM".to_string(),
        Sig::USR1 => "USR1".to_string(),
        Sig::Custom(name) => name,
    }
}

/// Copies `reader` to the channel until it ends.
async fn copy_out<R>(
    log: &Logger,
    handle: &Handle,
    channel: ChannelId,
    mut reader: R,
    extended: Option<u32>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 4096];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            // A pty reports EIO once the process side has closed.
            Err(err) => {
                debug!(log, "output ended"; "error" => %err);
                return;
            }
        };
        let data = CryptoVec::from_slice(&buf[..n]);
        let sent = match extended {
            Some(code) => handle.extended_data(channel, code, data).await,
            None => handle.data(channel, data).await,
        };
        if sent.is_err() {
            debug!(log, "channel gone; discarding output");
            return;
        }
    }
}

/// Streams an exec'd process's output to the client, then reports its exit
/// status and closes the channel.
async fn relay(
    log: Logger,
    handle: Handle,
    channel: ChannelId,
    exec: Exec,
    tether: Arc<Tether>,
) {
    let Exec { spawned, exit } = exec;
    let stdout = copy_out(&log, &handle, channel, spawned.output, None);
    match spawned.errors {
        Some(errors) => {
            let stderr =
                copy_out(&log, &handle, channel, errors, Some(STDERR));
            tokio::join!(stdout, stderr);
        }
        None => stdout.await,
    }

    let status = match exit.await {
        Ok(status) => u32::try_from(status).unwrap_or(UNKNOWN_EXIT_STATUS),
        Err(_) => UNKNOWN_EXIT_STATUS,
    };
    info!(log, "process exited"; "status" => status);
    if let Err(err) = tether.sync().await {
        warn!(log, "sync after exec failed"; "error" => %err);
    }
    // The client may already have gone; nothing to do about that.
    let _ = handle.eof(channel).await;
    let _ = handle.exit_status_request(channel, status).await;
    let _ = handle.close(channel).await;
}

#[async_trait]
impl russh::server::Handler for Connection {
    type Error = BackchannelError;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        Ok(self.authorize(user))
    }

    async fn auth_password(
        &mut self,
        user: &str,
        _password: &str,
    ) -> Result<Auth, Self::Error> {
        Ok(self.authorize(user))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(self.authorize(user))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        debug!(self.log, "session channel opened"; "channel" => ?id);
        let context = ChannelContext::new(
            self.log.new(o!("channel" => format!("{id:?}"))),
            Arc::clone(&self.tether),
        );
        self.channels.insert(id, ChannelState { context, input: None });
        Ok(true)
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            if let Some(mut input) = state.input.take() {
                let _ = input.shutdown().await;
            }
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(input) =
            self.channels.get_mut(&channel).and_then(|s| s.input.as_mut())
        else {
            return Ok(());
        };
        if let Err(err) = input.write_all(data).await {
            debug!(self.log, "dropping input"; "error" => %err);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::PtyReq {
            term: term.to_string(),
            columns: col_width,
            rows: row_height,
            width: pix_width,
            height: pix_height,
        };
        self.request(channel, request, session).await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::WindowChange {
            columns: col_width,
            rows: row_height,
            width: pix_width,
            height: pix_height,
        };
        self.request(channel, request, session).await;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        };
        self.request(channel, request, session).await;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.request(channel, ChannelRequest::Shell, session).await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        self.request(channel, ChannelRequest::Exec { command }, session)
            .await;
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Signal(signal_name(signal));
        self.request(channel, request, session).await;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        match Request::parse(name) {
            Ok(Request::Global(request)) => {
                let reply =
                    handle_global(&self.log, &self.tether, request).await;
                send_reply(channel, reply, session);
            }
            Ok(Request::Channel(request)) => {
                self.request(channel, request, session).await;
            }
            Err(ParseError::Unknown(kind)) => {
                warn!(self.log, "unsupported request"; "request" => &kind);
                let reply = Reply::failure(format!(
                    "ssh request type {kind} is not supported"
                ));
                send_reply(channel, reply, session);
            }
            Err(err) => send_reply(channel, Reply::failure(err), session),
        }
        Ok(())
    }
}
