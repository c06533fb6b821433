// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable that starts the appliance's caching DNS server

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use slog::info;
use slog::o;
use std::net::SocketAddr;
use vch_dns_server::config::ConfigFile;

#[derive(Parser, Debug)]
struct Args {
    #[clap(long, action)]
    config_file: Utf8PathBuf,

    /// Overrides `dns.bind_address` from the config file
    #[clap(long, action)]
    dns_address: Option<SocketAddr>,

    /// Overrides `dns.nameservers` from the config file; may be repeated
    #[clap(long = "nameserver", action)]
    nameservers: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let mut config = ConfigFile::from_file(&args.config_file)
        .with_context(|| format!("loading {}", args.config_file))?;

    if let Some(address) = args.dns_address {
        config.dns.bind_address = address;
    }
    if !args.nameservers.is_empty() {
        config.dns.nameservers = args.nameservers;
    }

    let log = config
        .log
        .to_logger("dns-server")
        .context("failed to create logger")?;

    info!(&log, "config"; "dns_config" => ?config.dns);

    let _dns_server = vch_dns_server::Server::start(
        log.new(o!("component" => "dns")),
        &config.dns,
    )
    .await
    .context("starting DNS server")?;

    tokio::signal::ctrl_c().await.context("waiting for shutdown")?;
    info!(&log, "shutting down");
    Ok(())
}
