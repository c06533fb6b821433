// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Caching, forwarding DNS server for the VCH appliance
//!
//! Containers on a VCH's bridge networks use the appliance as their
//! nameserver.  This crate provides that server:
//!
//! 1. A [`server::Server`] answering RFC 1035 queries over UDP and TCP on one
//!    address, with EDNS0 payload sizes honored
//! 2. A bounded LRU [`cache::Cache`] with a fixed TTL per entry
//! 3. A [`forward::Forwarder`] sending misses to the upstream nameservers,
//!    configured explicitly or read from `/etc/resolv.conf`
//!
//! Identical questions that miss concurrently share one upstream exchange
//! ([`singleflight`]).

pub mod cache;
pub mod config;
pub mod forward;
pub mod resolvconf;
pub mod server;
pub mod singleflight;

use anyhow::Context;
use hickory_resolver::config::NameServerConfig;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::config::ResolverOpts;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use std::net::SocketAddr;

pub use config::Config;
pub use server::{Server, ServerHandle};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to bind {transport} socket on {address}")]
    Bind {
        address: SocketAddr,
        transport: &'static str,
        #[source]
        err: std::io::Error,
    },
    #[error(transparent)]
    InvalidNameserver(#[from] forward::InvalidNameserver),
}

/// A DNS server on localhost forwarding to the given upstreams.
///
/// Intended to be used for testing only.
pub struct TransientServer {
    pub dns_server: ServerHandle,
}

impl TransientServer {
    pub async fn new(
        log: &slog::Logger,
        upstreams: &[SocketAddr],
    ) -> Result<Self, anyhow::Error> {
        let config = Config {
            bind_address: SocketAddr::new(
                std::net::Ipv4Addr::LOCALHOST.into(),
                0,
            ),
            nameservers: upstreams.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        Self::new_with_config(log, &config).await
    }

    pub async fn new_with_config(
        log: &slog::Logger,
        config: &Config,
    ) -> Result<Self, anyhow::Error> {
        let dns_log = log.new(slog::o!("kind" => "dns"));
        let dns_server = Server::start(dns_log, config)
            .await
            .context("starting DNS server")?;
        Ok(Self { dns_server })
    }

    /// Returns a fresh resolver pointed at this server.  Resolvers keep their
    /// own cache, so a test that wants to reach the server on every lookup
    /// should use a new one each time.
    pub fn resolver(&self) -> Result<TokioResolver, anyhow::Error> {
        let mut resolver_config = ResolverConfig::new();
        resolver_config.add_name_server(NameServerConfig::new(
            self.dns_server.local_address(),
            hickory_proto::xfer::Protocol::Udp,
        ));
        let mut resolver_opts = ResolverOpts::default();
        // Enable edns for potentially larger records
        resolver_opts.edns0 = true;
        resolver_opts.attempts = 1;

        let resolver = TokioResolver::builder_with_config(
            resolver_config,
            TokioConnectionProvider::default(),
        )
        .with_options(resolver_opts)
        .build();

        Ok(resolver)
    }
}
