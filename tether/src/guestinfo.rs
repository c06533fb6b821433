// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Access to the hypervisor's guest-info channel from inside the VM

use crate::executor::ReapGuard;
use camino::Utf8PathBuf;
use slog::{debug, Logger};
use std::process::Command;
use std::str::FromStr;
use std::sync::Mutex;
use vch_common::config::{ExecutorConfig, EXECUTOR_PREFIX, SECRET_KEY_VMX_KEY};
use vch_common::extraconfig::{self, ExtraConfig, SecretKey};

#[derive(Debug, thiserror::Error)]
pub enum GuestInfoError {
    #[error("failed to run {program}")]
    Spawn {
        program: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to set {key}: {stderr}")]
    Set { key: String, stderr: String },
    #[error("secret key in guest-info is invalid")]
    SecretKey(#[source] extraconfig::SecretError),
    #[error(transparent)]
    Codec(#[from] extraconfig::Error),
}

/// One-key-at-a-time access to guest-info
///
/// Setting a key to the empty string removes it.
pub trait GuestInfo: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, GuestInfoError>;
    fn set(&self, key: &str, value: &str) -> Result<(), GuestInfoError>;
}

/// Guest-info through the `vmware-rpctool` utility
///
/// Calls block; use them from a blocking context.
pub struct RpcTool {
    log: Logger,
    path: Utf8PathBuf,
    reap_guard: ReapGuard,
}

impl RpcTool {
    pub fn new(log: Logger, path: Utf8PathBuf, reap_guard: ReapGuard) -> Self {
        RpcTool { log, path, reap_guard }
    }

    fn run(
        &self,
        request: String,
    ) -> Result<std::process::Output, GuestInfoError> {
        // The reaper must not collect the tool before we do.
        let _running = self.reap_guard.blocking_read();
        Command::new(&self.path).arg(request).output().map_err(|err| {
            GuestInfoError::Spawn { program: self.path.clone(), err }
        })
    }
}

impl GuestInfo for RpcTool {
    fn get(&self, key: &str) -> Result<Option<String>, GuestInfoError> {
        let output = self.run(format!("info-get {key}"))?;
        if !output.status.success() {
            // "No value found"
            return Ok(None);
        }
        let value = String::from_utf8_lossy(&output.stdout)
            .trim_end_matches('\n')
            .to_string();
        Ok(Some(value).filter(|v| !v.is_empty()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), GuestInfoError> {
        debug!(self.log, "guest-info set"; "key" => key);
        let output = self.run(format!("info-set {key} {value}"))?;
        if !output.status.success() {
            return Err(GuestInfoError::Set {
                key: key.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

/// Guest-info held in memory
#[derive(Default)]
pub struct MemoryGuestInfo {
    map: Mutex<ExtraConfig>,
}

impl MemoryGuestInfo {
    pub fn new(map: ExtraConfig) -> Self {
        MemoryGuestInfo { map: Mutex::new(map) }
    }

    pub fn snapshot(&self) -> ExtraConfig {
        self.map.lock().unwrap().clone()
    }

    /// Applies an update the way the hypervisor would on reconfigure.
    pub fn update(&self, update: &ExtraConfig) {
        extraconfig::apply(&mut self.map.lock().unwrap(), update);
    }
}

impl GuestInfo for MemoryGuestInfo {
    fn get(&self, key: &str) -> Result<Option<String>, GuestInfoError> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), GuestInfoError> {
        let mut map = self.map.lock().unwrap();
        if value.is_empty() {
            map.remove(key);
        } else {
            map.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }
}

/// Reads the per-VCH secret key, if the VM has one.
pub fn secret_key(
    guest_info: &dyn GuestInfo,
) -> Result<Option<SecretKey>, GuestInfoError> {
    guest_info
        .get(SECRET_KEY_VMX_KEY)?
        .map(|encoded| SecretKey::from_str(&encoded))
        .transpose()
        .map_err(GuestInfoError::SecretKey)
}

/// Decodes the executor configuration.
pub fn load(
    guest_info: &dyn GuestInfo,
    secret_key: Option<&SecretKey>,
) -> Result<ExecutorConfig, GuestInfoError> {
    let lookup = |key: &str| {
        guest_info.get(key).map_err(|err| extraconfig::Error::Lookup {
            key: key.to_string(),
            reason: err.to_string(),
        })
    };
    Ok(extraconfig::decode_lookup(lookup, EXECUTOR_PREFIX, secret_key)?)
}

/// Writes the guest-writable portion of `config` back, removing published
/// keys that were present in `previous` and are no longer.  Returns what was
/// published, for use as `previous` next time.
pub fn publish(
    guest_info: &dyn GuestInfo,
    previous: &ExtraConfig,
    config: &ExecutorConfig,
    secret_key: Option<&SecretKey>,
) -> Result<ExtraConfig, GuestInfoError> {
    let encoded =
        extraconfig::encode_with_prefix(config, EXECUTOR_PREFIX, secret_key)?;
    let published = extraconfig::published_only(&encoded);
    for (key, value) in extraconfig::changes(previous, &published) {
        if previous.get(&key) != Some(&value) {
            guest_info.set(&key, &value)?;
        }
    }
    Ok(published)
}
