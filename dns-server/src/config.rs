// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DNS server configuration

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 53;
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_CACHE_SIZE: usize = 1024;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(4);
pub const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Address on which to serve both UDP and TCP
    pub bind_address: SocketAddr,
    /// How long a cached answer is served before it is refetched
    #[serde(with = "secs")]
    pub ttl: Duration,
    pub cache_size: usize,
    /// Bound on each upstream exchange
    #[serde(with = "secs")]
    pub timeout: Duration,
    /// Upstream servers, as `ip` or `ip:port`.  When empty, the nameservers
    /// in `resolv_conf` are used.
    pub nameservers: Vec<String>,
    pub resolv_conf: Utf8PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_address: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                DEFAULT_PORT,
            ),
            ttl: DEFAULT_TTL,
            cache_size: DEFAULT_CACHE_SIZE,
            timeout: DEFAULT_TIMEOUT,
            nameservers: Vec::new(),
            resolv_conf: Utf8PathBuf::from(DEFAULT_RESOLV_CONF),
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Configuration file for the `dns-server` executable
#[derive(Clone, Debug, Deserialize)]
pub struct ConfigFile {
    pub log: dropshot::ConfigLogging,
    #[serde(default)]
    pub dns: Config,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}: {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

impl ConfigFile {
    pub fn from_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let file: ConfigFile = toml::from_str(
            r#"
            [log]
            mode = "stderr-terminal"
            level = "info"

            [dns]
            bind_address = "172.16.0.1:53"
            nameservers = [ "10.118.81.1" ]
            ttl = 30
            "#,
        )
        .unwrap();
        assert_eq!(file.dns.bind_address, "172.16.0.1:53".parse().unwrap());
        assert_eq!(file.dns.ttl, Duration::from_secs(30));
        assert_eq!(file.dns.cache_size, DEFAULT_CACHE_SIZE);
        assert_eq!(file.dns.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = ConfigFile::from_file(Utf8Path::new("/nonexistent/dns.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
