// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Forwarding of cache misses to upstream nameservers

use crate::config::DEFAULT_PORT;
use hickory_proto::op::Message;
use slog::{debug, warn, Logger};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// Transport a query arrived on.  Upstream exchanges use the same one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
}

/// Failure to get an answer from any upstream server.  Cloneable so that
/// coalesced callers can all receive it.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("no upstream nameservers configured")]
    NoNameservers,
    #[error("all {attempts} upstream nameservers failed, last error: {last}")]
    Exhausted { attempts: usize, last: String },
}

#[derive(Debug, thiserror::Error)]
#[error("invalid nameserver {0:?}")]
pub struct InvalidNameserver(pub String);

/// Parses `ip` or `ip:port` (IPv6 as `[ip]:port`), defaulting the port to 53.
pub fn parse_nameserver(s: &str) -> Result<SocketAddr, InvalidNameserver> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    s.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DEFAULT_PORT))
        .map_err(|_| InvalidNameserver(s.to_string()))
}

#[derive(Clone)]
pub struct Forwarder {
    log: Logger,
    nameservers: Arc<Vec<SocketAddr>>,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(
        log: Logger,
        nameservers: Vec<SocketAddr>,
        timeout: Duration,
    ) -> Self {
        Forwarder { log, nameservers: Arc::new(nameservers), timeout }
    }

    pub fn nameservers(&self) -> &[SocketAddr] {
        &self.nameservers
    }

    /// Sends `request` upstream and returns the first answer.  The first
    /// server tried is chosen by the request id; on a transport error the
    /// next one is tried, until each has been tried once.
    pub async fn exchange(
        &self,
        request: &Message,
        transport: Transport,
    ) -> Result<Message, ForwardError> {
        let n = self.nameservers.len();
        if n == 0 {
            return Err(ForwardError::NoNameservers);
        }
        let bytes = request.to_vec().map_err(|e| ForwardError::Exhausted {
            attempts: 0,
            last: e.to_string(),
        })?;

        let first = usize::from(request.id()) % n;
        let mut last = String::new();
        for attempt in 0..n {
            let server = self.nameservers[(first + attempt) % n];
            let result = match transport {
                Transport::Udp => self.exchange_udp(server, &bytes).await,
                Transport::Tcp => self.exchange_tcp(server, &bytes).await,
            };
            match result.and_then(|raw| {
                Message::from_vec(&raw).map_err(std::io::Error::other)
            }) {
                Ok(response) => {
                    debug!(self.log, "upstream answered";
                        "server" => %server,
                        "rcode" => %response.response_code(),
                    );
                    return Ok(response);
                }
                Err(error) => {
                    warn!(self.log, "upstream exchange failed";
                        "server" => %server,
                        "transport" => ?transport,
                        "error" => %error,
                    );
                    last = error.to_string();
                }
            }
        }
        Err(ForwardError::Exhausted { attempts: n, last })
    }

    async fn exchange_udp(
        &self,
        server: SocketAddr,
        request: &[u8],
    ) -> Result<Vec<u8>, std::io::Error> {
        let local: IpAddr = if server.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        let socket = UdpSocket::bind(SocketAddr::new(local, 0)).await?;
        socket.connect(server).await?;
        socket.send(request).await?;

        let id = &request[..2];
        let mut buf = vec![0u8; usize::from(u16::MAX)];
        tokio::time::timeout(self.timeout, async {
            loop {
                let len = socket.recv(&mut buf).await?;
                // Stray datagrams for other ids are ignored.
                if len >= 2 && &buf[..2] == id {
                    return Ok::<_, std::io::Error>(buf[..len].to_vec());
                }
            }
        })
        .await
        .map_err(|_| timed_out(server))?
    }

    async fn exchange_tcp(
        &self,
        server: SocketAddr,
        request: &[u8],
    ) -> Result<Vec<u8>, std::io::Error> {
        tokio::time::timeout(self.timeout, async {
            let mut stream = TcpStream::connect(server).await?;
            write_frame(&mut stream, request).await?;
            read_frame(&mut stream).await
        })
        .await
        .map_err(|_| timed_out(server))?
    }
}

fn timed_out(server: SocketAddr) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("no answer from {}", server),
    )
}

/// Writes one length-prefixed DNS message to a stream.
pub(crate) async fn write_frame<S>(
    stream: &mut S,
    msg: &[u8],
) -> Result<(), std::io::Error>
where
    S: AsyncWriteExt + Unpin,
{
    let len = u16::try_from(msg.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "message too large for TCP framing",
        )
    })?;
    let mut frame = Vec::with_capacity(msg.len() + 2);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(msg);
    stream.write_all(&frame).await?;
    stream.flush().await
}

/// Reads one length-prefixed DNS message from a stream.
pub(crate) async fn read_frame<S>(
    stream: &mut S,
) -> Result<Vec<u8>, std::io::Error>
where
    S: AsyncReadExt + Unpin,
{
    let len = stream.read_u16().await?;
    let mut buf = vec![0u8; usize::from(len)];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}
