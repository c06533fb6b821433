// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DNS protocol server
//!
//! One task receives UDP datagrams and one accepts TCP connections, both on
//! the configured address.  Every query (and every TCP connection) is
//! handled on its own task.  Answers come from the [`Cache`] when possible
//! and are otherwise forwarded upstream, with identical concurrent misses
//! coalesced into a single upstream exchange.

use crate::cache::{Cache, Key};
use crate::config::Config;
use crate::forward::{self, ForwardError, Forwarder, Transport};
use crate::resolvconf;
use crate::singleflight::Group;
use crate::Error;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, RecordType};
use slog::{debug, error, info, o, trace, warn, Logger};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

/// Smallest reply size every client must accept over UDP
pub const MIN_UDP_PAYLOAD: usize = 512;
pub const MAX_TCP_PAYLOAD: usize = u16::MAX as usize;

/// Handle to a running DNS server.  Dropping it stops the server.
pub struct ServerHandle {
    local_address: SocketAddr,
    handler: Arc<Handler>,
    udp_task: JoinHandle<()>,
    tcp_task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the server is bound to, for both UDP and TCP
    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    pub fn cache(&self) -> &Cache {
        &self.handler.cache
    }

    pub fn nameservers(&self) -> &[SocketAddr] {
        self.handler.forwarder.nameservers()
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.udp_task.abort();
        self.tcp_task.abort();
    }
}

pub struct Server;

impl Server {
    /// Binds the configured address and starts serving.
    pub async fn start(
        log: Logger,
        config: &Config,
    ) -> Result<ServerHandle, Error> {
        let nameservers = upstream_nameservers(&log, config)?;

        let udp = UdpSocket::bind(config.bind_address).await.map_err(|err| {
            Error::Bind { address: config.bind_address, transport: "udp", err }
        })?;
        let local_address = udp.local_addr().map_err(|err| Error::Bind {
            address: config.bind_address,
            transport: "udp",
            err,
        })?;
        // TCP shares the UDP port, which matters when binding port 0.
        let tcp = TcpListener::bind(local_address).await.map_err(|err| {
            Error::Bind { address: local_address, transport: "tcp", err }
        })?;

        info!(log, "DNS server bound";
            "address" => %local_address,
            "nameservers" => ?nameservers,
            "cache_size" => config.cache_size,
            "ttl" => ?config.ttl,
        );

        let handler = Arc::new(Handler {
            log: log.clone(),
            cache: Cache::new(config.cache_size, config.ttl),
            forwarder: Forwarder::new(
                log.new(o!("component" => "forwarder")),
                nameservers,
                config.timeout,
            ),
            inflight: Group::new(),
        });

        let udp_task = tokio::spawn(serve_udp(
            log.new(o!("transport" => "udp")),
            Arc::new(udp),
            Arc::clone(&handler),
        ));
        let tcp_task = tokio::spawn(serve_tcp(
            log.new(o!("transport" => "tcp")),
            tcp,
            Arc::clone(&handler),
        ));

        Ok(ServerHandle { local_address, handler, udp_task, tcp_task })
    }
}

fn upstream_nameservers(
    log: &Logger,
    config: &Config,
) -> Result<Vec<SocketAddr>, Error> {
    if !config.nameservers.is_empty() {
        return config
            .nameservers
            .iter()
            .map(|s| forward::parse_nameserver(s).map_err(Error::from))
            .collect();
    }
    let found: Vec<SocketAddr> = resolvconf::from_file(&config.resolv_conf)
        .into_iter()
        .map(|ip| SocketAddr::new(ip, crate::config::DEFAULT_PORT))
        .collect();
    if found.is_empty() {
        warn!(log, "no upstream nameservers; misses will fail";
            "resolv_conf" => %config.resolv_conf,
        );
    }
    Ok(found)
}

async fn serve_udp(log: Logger, socket: Arc<UdpSocket>, handler: Arc<Handler>) {
    let mut buf = vec![0u8; MAX_TCP_PAYLOAD];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(error) => {
                error!(log, "failed to receive datagram"; "error" => %error);
                continue;
            }
        };
        let packet = buf[..len].to_vec();
        let socket = Arc::clone(&socket);
        let handler = Arc::clone(&handler);
        let log = log.new(o!("peer" => peer.to_string()));
        tokio::spawn(async move {
            let Some(reply) = handler.handle(&packet, Transport::Udp).await
            else {
                return;
            };
            if let Err(error) = socket.send_to(&reply, peer).await {
                warn!(log, "failed to send reply"; "error" => %error);
            }
        });
    }
}

async fn serve_tcp(log: Logger, listener: TcpListener, handler: Arc<Handler>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                error!(log, "failed to accept connection"; "error" => %error);
                continue;
            }
        };
        let handler = Arc::clone(&handler);
        let log = log.new(o!("peer" => peer.to_string()));
        tokio::spawn(async move {
            if let Err(error) = serve_connection(stream, &handler).await {
                debug!(log, "connection closed"; "error" => %error);
            }
        });
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    handler: &Handler,
) -> Result<(), std::io::Error> {
    loop {
        let request = forward::read_frame(&mut stream).await?;
        if let Some(reply) = handler.handle(&request, Transport::Tcp).await {
            forward::write_frame(&mut stream, &reply).await?;
        }
    }
}

/// Requests that can share one upstream exchange: the same question, asked
/// the same way
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct FlightKey {
    question: Key,
    transport: Transport,
    recursion_desired: bool,
    checking_disabled: bool,
    udp_payload: Option<u16>,
}

impl FlightKey {
    fn new(request: &Message, query: &Query, transport: Transport) -> Self {
        FlightKey {
            question: Key::from(query),
            transport,
            recursion_desired: request.recursion_desired(),
            checking_disabled: request.checking_disabled(),
            udp_payload: request
                .extensions()
                .as_ref()
                .map(|edns| edns.max_payload()),
        }
    }
}

type Inflight = Group<FlightKey, Result<Message, ForwardError>>;

struct Handler {
    log: Logger,
    cache: Cache,
    forwarder: Forwarder,
    inflight: Inflight,
}

impl Handler {
    /// Produces the wire-format reply to one request, or `None` when the
    /// request should be dropped.
    async fn handle(
        &self,
        packet: &[u8],
        transport: Transport,
    ) -> Option<Vec<u8>> {
        let request = match Message::from_vec(packet) {
            Ok(request) => request,
            Err(error) => {
                debug!(self.log, "dropping unparseable request";
                    "error" => %error);
                return None;
            }
        };
        if request.message_type() != MessageType::Query {
            return None;
        }

        let reply = self.answer(&request, transport).await;
        let limit = match transport {
            Transport::Tcp => MAX_TCP_PAYLOAD,
            Transport::Udp => request
                .extensions()
                .as_ref()
                .map_or(MIN_UDP_PAYLOAD, |edns| usize::from(edns.max_payload()))
                .max(MIN_UDP_PAYLOAD),
        };
        match fit(reply, limit, transport) {
            Ok(bytes) => Some(bytes),
            Err(error) => {
                error!(self.log, "failed to encode reply"; "error" => %error);
                None
            }
        }
    }

    async fn answer(&self, request: &Message, transport: Transport) -> Message {
        let queries = request.queries();
        if queries.len() != 1 {
            debug!(self.log, "rejecting request";
                "questions" => queries.len());
            return error_reply(request, ResponseCode::FormErr);
        }
        let query = &queries[0];
        trace!(self.log, "query";
            "name" => %query.name(),
            "type" => %query.query_type(),
        );

        if query.query_class() != DNSClass::IN {
            return error_reply(request, ResponseCode::NotImp);
        }
        if query.query_type() == RecordType::ANY {
            return error_reply(request, ResponseCode::NotImp);
        }

        if let Some(reply) = self.handle_vic(request, query) {
            return reply;
        }

        if let Some(mut cached) = self.cache.get(query) {
            cached.set_id(request.id());
            cached.set_truncated(false);
            return cached;
        }

        let key = FlightKey::new(request, query, transport);
        let forwarder = self.forwarder.clone();
        let upstream = request.clone();
        let result = self
            .inflight
            .run(key, async move {
                forwarder.exchange(&upstream, transport).await
            })
            .await;

        match result {
            Ok(mut response) => {
                if response.response_code() == ResponseCode::NoError
                    && !response.truncated()
                {
                    self.cache.add(&response);
                }
                response.set_id(request.id());
                response
            }
            Err(error) => {
                warn!(self.log, "forwarding failed";
                    "name" => %query.name(),
                    "error" => %error,
                );
                error_reply(request, ResponseCode::ServFail)
            }
        }
    }

    /// Answers names owned by the VCH itself (containers on its bridge
    /// networks).  Not implemented; every query falls through to the cache
    /// and upstream.
    fn handle_vic(&self, _request: &Message, query: &Query) -> Option<Message> {
        trace!(self.log, "not a container name"; "name" => %query.name());
        None
    }
}

fn error_reply(request: &Message, code: ResponseCode) -> Message {
    let mut reply = Message::error_msg(request.id(), OpCode::Query, code);
    reply.set_op_code(request.op_code());
    reply.set_recursion_desired(request.recursion_desired());
    reply.set_recursion_available(true);
    reply.add_queries(request.queries().to_vec());
    reply
}

/// Encodes `reply`, dropping trailing answers until it fits in `limit`
/// bytes.  Over UDP a trimmed reply is marked truncated.
fn fit(
    mut reply: Message,
    limit: usize,
    transport: Transport,
) -> Result<Vec<u8>, hickory_proto::ProtoError> {
    let mut bytes = reply.to_vec()?;
    if bytes.len() <= limit {
        return Ok(bytes);
    }
    let mut answers = reply.take_answers();
    while bytes.len() > limit && !answers.is_empty() {
        answers.pop();
        let mut trimmed = reply.clone();
        trimmed.insert_answers(answers.clone());
        if transport == Transport::Udp {
            trimmed.set_truncated(true);
        }
        bytes = trimmed.to_vec()?;
    }
    Ok(bytes)
}

#[cfg(test)]
mod test {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record};
    use std::str::FromStr;

    fn with_answers(n: u8) -> Message {
        let name = Name::from_str("big.example.com.").unwrap();
        let mut msg = Message::new();
        msg.set_message_type(MessageType::Response);
        msg.add_query(Query::query(name.clone(), RecordType::A));
        for i in 0..n {
            msg.add_answer(Record::from_rdata(
                name.clone(),
                300,
                RData::A(A::new(10, 0, 0, i)),
            ));
        }
        msg
    }

    #[test]
    fn small_replies_are_untouched() {
        let bytes =
            fit(with_answers(2), MIN_UDP_PAYLOAD, Transport::Udp).unwrap();
        let reply = Message::from_vec(&bytes).unwrap();
        assert_eq!(reply.answers().len(), 2);
        assert!(!reply.truncated());
    }

    #[test]
    fn udp_replies_are_trimmed_and_truncated() {
        let bytes =
            fit(with_answers(100), MIN_UDP_PAYLOAD, Transport::Udp).unwrap();
        assert!(bytes.len() <= MIN_UDP_PAYLOAD);
        let reply = Message::from_vec(&bytes).unwrap();
        assert!(reply.truncated());
        assert!(!reply.answers().is_empty());
        assert!(reply.answers().len() < 100);
    }

    #[test]
    fn tcp_replies_are_trimmed_without_truncation() {
        let bytes = fit(with_answers(100), 600, Transport::Tcp).unwrap();
        assert!(bytes.len() <= 600);
        let reply = Message::from_vec(&bytes).unwrap();
        assert!(!reply.truncated());
    }

    #[test]
    fn error_replies_echo_the_question() {
        let mut request = with_answers(0);
        request.set_message_type(MessageType::Query);
        request.set_id(4242);
        let reply = error_reply(&request, ResponseCode::NotImp);
        assert_eq!(reply.id(), 4242);
        assert_eq!(reply.message_type(), MessageType::Response);
        assert_eq!(reply.response_code(), ResponseCode::NotImp);
        assert_eq!(reply.queries(), request.queries());
    }
}
