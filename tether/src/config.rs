// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tether configuration
//!
//! Everything about what the VM should run comes from guest-info; this file
//! only says where the tether finds its devices and tools.

use camino::{Utf8Path, Utf8PathBuf};
use dropshot::{ConfigLogging, ConfigLoggingIfExists, ConfigLoggingLevel};
use serde::Deserialize;

pub const DEFAULT_LOG_DIR: &str = "/var/log/vic";
pub const DEFAULT_RPCTOOL: &str = "/usr/bin/vmware-rpctool";
pub const DEFAULT_BACKCHANNEL: &str = "/dev/ttyS1";

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Serial device carrying the back-channel; unset to disable it
    pub backchannel: Option<Utf8PathBuf>,
    /// Device that also receives every session's output
    pub serial_log: Option<Utf8PathBuf>,
    /// Directory holding `<session id>.log`
    pub session_log_dir: Utf8PathBuf,
    pub rpctool: Utf8PathBuf,
    /// Overrides `diagnostics.debug_level` from guest-info
    pub debug_level: Option<u8>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backchannel: Some(DEFAULT_BACKCHANNEL.into()),
            serial_log: None,
            session_log_dir: DEFAULT_LOG_DIR.into(),
            rpctool: DEFAULT_RPCTOOL.into(),
            debug_level: None,
        }
    }
}

fn default_log() -> ConfigLogging {
    ConfigLogging::File {
        level: ConfigLoggingLevel::Info,
        path: format!("{DEFAULT_LOG_DIR}/init.log").into(),
        if_exists: ConfigLoggingIfExists::Append,
    }
}

/// Configuration file for the `tether` executable
#[derive(Clone, Debug, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_log")]
    pub log: ConfigLogging,
    #[serde(default)]
    pub tether: Config,
}

impl Default for ConfigFile {
    fn default() -> Self {
        ConfigFile { log: default_log(), tether: Config::default() }
    }
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
    fn empty_file_uses_defaults() {
        let file: ConfigFile = toml::from_str("").unwrap();
        assert_eq!(file.tether, Config::default());
        match file.log {
            ConfigLogging::File { path, .. } => {
                assert_eq!(path, "/var/log/vic/init.log");
            }
            other => panic!("unexpected log config {other:?}"),
        }
    }

    #[test]
    fn overrides() {
        let file: ConfigFile = toml::from_str(
            r#"
            [log]
            mode = "stderr-terminal"
            level = "debug"

            [tether]
            session_log_dir = "/tmp/vic"
            debug_level = 3
            "#,
        )
        .unwrap();
        assert_eq!(file.tether.session_log_dir, "/tmp/vic");
        assert_eq!(file.tether.debug_level, Some(3));
        assert_eq!(file.tether.rpctool, DEFAULT_RPCTOOL);
    }

    #[test]
    fn missing_file() {
        let err = ConfigFile::from_file(Utf8Path::new("/nonexistent.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
