// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dropshot::test_util::LogContext;
use hickory_proto::op::{
    Edns, Message, MessageType, OpCode, Query, ResponseCode,
};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use vch_dns_server::TransientServer;
use vch_test_utils::dev::test_setup_log;

const ANSWER: Ipv4Addr = Ipv4Addr::new(10, 118, 81, 7);

/// An upstream nameserver answering every A query with `answers` records
/// after `delay`, over both UDP and TCP on one port.
struct Upstream {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
}

impl Upstream {
    async fn start(delay: Duration, answers: u8) -> Upstream {
        let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = udp.local_addr().unwrap();
        let tcp = TcpListener::bind(addr).await.unwrap();
        let requests = Arc::new(AtomicUsize::new(0));

        let count = Arc::clone(&requests);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let (len, peer) = udp.recv_from(&mut buf).await.unwrap();
                count.fetch_add(1, Ordering::SeqCst);
                let request = Message::from_vec(&buf[..len]).unwrap();
                let udp = Arc::clone(&udp);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let reply = respond(&request, answers).to_vec().unwrap();
                    udp.send_to(&reply, peer).await.unwrap();
                });
            }
        });

        let count = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = tcp.accept().await.unwrap();
                count.fetch_add(1, Ordering::SeqCst);
                let len = stream.read_u16().await.unwrap();
                let mut buf = vec![0u8; usize::from(len)];
                stream.read_exact(&mut buf).await.unwrap();
                let request = Message::from_vec(&buf).unwrap();
                let reply = respond(&request, answers).to_vec().unwrap();
                let len = u16::try_from(reply.len()).unwrap();
                stream.write_all(&len.to_be_bytes()).await.unwrap();
                stream.write_all(&reply).await.unwrap();
            }
        });

        Upstream { addr, requests }
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

fn respond(request: &Message, answers: u8) -> Message {
    let mut reply = Message::new();
    reply.set_id(request.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(OpCode::Query);
    reply.set_recursion_desired(request.recursion_desired());
    reply.set_recursion_available(true);
    reply.add_queries(request.queries().to_vec());
    let name = request.queries()[0].name().clone();
    for i in 0..answers {
        let octets = ANSWER.octets();
        reply.add_answer(Record::from_rdata(
            name.clone(),
            60,
            RData::A(A::new(octets[0], octets[1], octets[2], octets[3] + i)),
        ));
    }
    reply
}

struct TestContext {
    logctx: LogContext,
    upstream: Upstream,
    server: TransientServer,
}

impl TestContext {
    async fn new(name: &str, delay: Duration, answers: u8) -> TestContext {
        let logctx = test_setup_log(name);
        let upstream = Upstream::start(delay, answers).await;
        let server = TransientServer::new(&logctx.log, &[upstream.addr])
            .await
            .unwrap();
        TestContext { logctx, upstream, server }
    }

    fn address(&self) -> SocketAddr {
        self.server.dns_server.local_address()
    }

    fn cleanup(self) {
        drop(self.server);
        self.logctx.cleanup_successful();
    }
}

fn query(id: u16, name: &str, qtype: RecordType) -> Message {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(Name::from_str(name).unwrap(), qtype));
    msg
}

fn with_edns(mut msg: Message, max_payload: u16) -> Message {
    let mut edns = Edns::new();
    edns.set_max_payload(max_payload);
    msg.set_edns(edns);
    msg
}

async fn exchange_udp(
    server: SocketAddr,
    request: &Message,
) -> Result<Message> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    socket.send_to(&request.to_vec()?, server).await?;
    let mut buf = vec![0u8; 65535];
    let recv = socket.recv(&mut buf);
    let len = tokio::time::timeout(Duration::from_secs(10), recv)
        .await
        .context("timed out waiting for reply")??;
    Ok(Message::from_vec(&buf[..len])?)
}

async fn exchange_tcp(
    server: SocketAddr,
    request: &Message,
) -> Result<Message> {
    let mut stream = TcpStream::connect(server).await?;
    let bytes = request.to_vec()?;
    stream.write_all(&u16::try_from(bytes.len())?.to_be_bytes()).await?;
    stream.write_all(&bytes).await?;
    let len = stream.read_u16().await?;
    let mut buf = vec![0u8; usize::from(len)];
    stream.read_exact(&mut buf).await?;
    Ok(Message::from_vec(&buf)?)
}

#[tokio::test]
async fn resolver_lookup_is_forwarded_then_cached() -> Result<()> {
    let ctx = TestContext::new(
        "resolver_lookup_is_forwarded_then_cached",
        Duration::ZERO,
        1,
    )
    .await;

    let response =
        ctx.server.resolver()?.lookup_ip("vch.example.com.").await?;
    let address = response.iter().next().expect("no addresses returned!");
    assert_eq!(address, ANSWER);
    assert_eq!(ctx.upstream.requests(), 1);

    // A fresh resolver has nothing cached, so this reaches our server.
    let response =
        ctx.server.resolver()?.lookup_ip("vch.example.com.").await?;
    assert_eq!(response.iter().next(), Some(ANSWER.into()));
    assert_eq!(ctx.upstream.requests(), 1);
    assert_eq!(ctx.server.dns_server.cache().hits(), 1);
    assert_eq!(ctx.server.dns_server.cache().count(), 1);

    ctx.cleanup();
    Ok(())
}

#[tokio::test]
async fn cached_reply_carries_the_new_id() -> Result<()> {
    let ctx =
        TestContext::new("cached_reply_carries_the_new_id", Duration::ZERO, 1)
            .await;

    let request = query(7, "vch.example.com.", RecordType::A);
    let first = exchange_udp(ctx.address(), &request).await?;
    assert_eq!(first.id(), 7);
    assert_eq!(first.response_code(), ResponseCode::NoError);

    let second = exchange_udp(
        ctx.address(),
        &query(8, "VCH.example.com.", RecordType::A),
    )
    .await?;
    assert_eq!(second.id(), 8);
    assert!(!second.truncated());
    assert_eq!(second.answers(), first.answers());
    assert_eq!(ctx.upstream.requests(), 1);

    ctx.cleanup();
    Ok(())
}

#[tokio::test]
async fn unsupported_queries_are_refused() -> Result<()> {
    let ctx =
        TestContext::new("unsupported_queries_are_refused", Duration::ZERO, 1)
            .await;

    let mut two = query(1, "a.example.com.", RecordType::A);
    two.add_query(Query::query(
        Name::from_str("b.example.com.").unwrap(),
        RecordType::A,
    ));
    let reply = exchange_udp(ctx.address(), &two).await?;
    assert_eq!(reply.id(), 1);
    assert_eq!(reply.response_code(), ResponseCode::FormErr);

    let mut chaos = Message::new();
    chaos.set_id(2);
    chaos.set_message_type(MessageType::Query);
    let mut q = Query::query(
        Name::from_str("version.bind.").unwrap(),
        RecordType::TXT,
    );
    q.set_query_class(DNSClass::CH);
    chaos.add_query(q);
    let reply = exchange_udp(ctx.address(), &chaos).await?;
    assert_eq!(reply.response_code(), ResponseCode::NotImp);

    let reply = exchange_udp(
        ctx.address(),
        &query(3, "vch.example.com.", RecordType::ANY),
    )
    .await?;
    assert_eq!(reply.response_code(), ResponseCode::NotImp);

    assert_eq!(ctx.upstream.requests(), 0);
    ctx.cleanup();
    Ok(())
}

#[tokio::test]
async fn tcp_queries_are_answered() -> Result<()> {
    let ctx =
        TestContext::new("tcp_queries_are_answered", Duration::ZERO, 1).await;

    let request = query(9, "vch.example.com.", RecordType::A);
    let reply = exchange_tcp(ctx.address(), &request).await?;
    assert_eq!(reply.id(), 9);
    assert_eq!(reply.answers().len(), 1);
    assert_eq!(ctx.upstream.requests(), 1);

    ctx.cleanup();
    Ok(())
}

#[tokio::test]
async fn concurrent_misses_are_coalesced() -> Result<()> {
    let ctx = TestContext::new(
        "concurrent_misses_are_coalesced",
        Duration::from_millis(500),
        1,
    )
    .await;

    let address = ctx.address();
    let queries: Vec<_> = (100..110)
        .map(|id| {
            tokio::spawn(async move {
                let request = query(id, "slow.example.com.", RecordType::A);
                exchange_udp(address, &request).await
            })
        })
        .collect();
    for (id, reply) in (100..110).zip(queries) {
        let reply = reply.await??;
        assert_eq!(reply.id(), id);
        assert_eq!(reply.answers().len(), 1);
    }
    assert_eq!(ctx.upstream.requests(), 1);

    ctx.cleanup();
    Ok(())
}

#[tokio::test]
async fn large_udp_replies_are_truncated() -> Result<()> {
    let ctx =
        TestContext::new("large_udp_replies_are_truncated", Duration::ZERO, 60)
            .await;

    let reply = exchange_udp(
        ctx.address(),
        &query(11, "big.example.com.", RecordType::A),
    )
    .await?;
    assert!(reply.truncated());
    assert!(reply.answers().len() < 60);

    // The same answer fits over TCP.
    let reply = exchange_tcp(
        ctx.address(),
        &query(12, "big.example.com.", RecordType::A),
    )
    .await?;
    assert!(!reply.truncated());
    assert_eq!(reply.answers().len(), 60);

    ctx.cleanup();
    Ok(())
}

#[tokio::test]
async fn edns_payload_size_bounds_udp_replies() -> Result<()> {
    let ctx = TestContext::new(
        "edns_payload_size_bounds_udp_replies",
        Duration::ZERO,
        60,
    )
    .await;

    let plain = exchange_udp(
        ctx.address(),
        &query(21, "big.example.com.", RecordType::A),
    )
    .await?;
    assert!(plain.truncated());

    // A modest advertised size trims to that size rather than to 512.
    let request =
        with_edns(query(22, "big.example.com.", RecordType::A), 700);
    let reply = exchange_udp(ctx.address(), &request).await?;
    assert!(reply.truncated());
    assert!(reply.answers().len() > plain.answers().len());
    assert!(reply.to_vec()?.len() <= 700);

    // A generous one lets the whole answer through.
    let request =
        with_edns(query(23, "big.example.com.", RecordType::A), 4096);
    let reply = exchange_udp(ctx.address(), &request).await?;
    assert!(!reply.truncated());
    assert_eq!(reply.answers().len(), 60);

    ctx.cleanup();
    Ok(())
}

#[tokio::test]
async fn differently_flagged_misses_are_not_coalesced() -> Result<()> {
    let ctx = TestContext::new(
        "differently_flagged_misses_are_not_coalesced",
        Duration::from_millis(500),
        1,
    )
    .await;

    let address = ctx.address();
    let recursive = query(31, "slow.example.com.", RecordType::A);
    let mut iterative = query(32, "slow.example.com.", RecordType::A);
    iterative.set_recursion_desired(false);
    let (recursive, iterative) = tokio::join!(
        exchange_udp(address, &recursive),
        exchange_udp(address, &iterative),
    );
    let (recursive, iterative) = (recursive?, iterative?);
    assert!(recursive.recursion_desired());
    assert!(!iterative.recursion_desired());
    assert_eq!(ctx.upstream.requests(), 2);

    ctx.cleanup();
    Ok(())
}

#[tokio::test]
async fn no_upstream_is_a_server_failure() -> Result<()> {
    let logctx = test_setup_log("no_upstream_is_a_server_failure");
    let scratch = camino_tempfile::tempdir()?;
    let config = vch_dns_server::Config {
        bind_address: "127.0.0.1:0".parse()?,
        resolv_conf: scratch.path().join("resolv.conf"),
        ..Default::default()
    };
    let server =
        TransientServer::new_with_config(&logctx.log, &config).await?;
    assert!(server.dns_server.nameservers().is_empty());

    let reply = exchange_udp(
        server.dns_server.local_address(),
        &query(13, "vch.example.com.", RecordType::A),
    )
    .await?;
    assert_eq!(reply.id(), 13);
    assert_eq!(reply.response_code(), ResponseCode::ServFail);

    drop(server);
    logctx.cleanup_successful();
    Ok(())
}
