// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest-info ("extraconfig") codec
//!
//! The hypervisor exposes a flat string-to-string map that both the
//! management plane and the guest can see.  This module flattens any serde
//! value tree into that map and rebuilds it again:
//!
//! * struct fields extend the key path: `guestinfo.vice./executor/name`;
//! * sequences store their length at the field's key and each element at
//!   `<field>|<index>`;
//! * maps store the `|`-joined list of their keys at the field's key and
//!   each entry at `<field>|<key>`;
//! * values wrapped in [`Published`] are rendered with `.` separators
//!   (`guestinfo.vice..executor.sessions|abc.started`), the form the guest
//!   is allowed to write;
//! * values wrapped in [`Secret`] get an `@secret` suffix and are sealed
//!   with the per-VCH [`SecretKey`] when one is supplied.
//!
//! Decoding is forgiving in the same way the guest-info channel is: keys
//! that are missing decode to default values and keys that are not part of
//! the target type are ignored.  Structs being decoded should therefore
//! carry `#[serde(default)]`.  Empty values are never written, since an
//! empty value is how a key is removed from guest-info.

mod de;
mod keys;
mod secret;
mod ser;

pub use keys::{
    is_published, published_key, read_only_key, GUESTINFO_PREFIX,
    SECRET_SUFFIX,
};
pub use secret::{Published, Secret, SecretError, SecretKey};

use de::{Decoder, Source};
use keys::KeyPath;
use ser::Encoder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

/// Flat guest-info map
pub type ExtraConfig = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Message(String),
    #[error("key {key}: cannot parse {value:?}: {reason}")]
    Parse { key: String, value: String, reason: String },
    #[error("key {key}: cannot encode {what}")]
    Unsupported { key: String, what: String },
    #[error("map key {0:?} is empty or contains a reserved separator")]
    InvalidMapKey(String),
    #[error("failed to read key {key}: {reason}")]
    Lookup { key: String, reason: String },
    #[error("key {key}")]
    Secret {
        key: String,
        #[source]
        source: SecretError,
    },
}

impl serde::ser::Error for Error {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        Error::Message(msg.to_string())
    }
}

impl serde::de::Error for Error {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        Error::Message(msg.to_string())
    }
}

/// Encodes `value` at the root of the guest-info key space.
pub fn encode<T: ?Sized + Serialize>(
    value: &T,
    secret_key: Option<&SecretKey>,
) -> Result<ExtraConfig, Error> {
    encode_with_prefix(value, "", secret_key)
}

/// Encodes `value` beneath `prefix`, a `/`-separated path such as
/// `executor/sessions|abc`.
pub fn encode_with_prefix<T: ?Sized + Serialize>(
    value: &T,
    prefix: &str,
    secret_key: Option<&SecretKey>,
) -> Result<ExtraConfig, Error> {
    let mut out = ExtraConfig::new();
    value.serialize(Encoder {
        out: &mut out,
        path: KeyPath::from_prefix(prefix),
        secret_key,
    })?;
    Ok(out)
}

/// Decodes a value from the root of the guest-info key space.
pub fn decode<T: DeserializeOwned>(
    map: &ExtraConfig,
    secret_key: Option<&SecretKey>,
) -> Result<T, Error> {
    decode_with_prefix(map, "", secret_key)
}

/// Decodes the subtree beneath `prefix`.
pub fn decode_with_prefix<T: DeserializeOwned>(
    map: &ExtraConfig,
    prefix: &str,
    secret_key: Option<&SecretKey>,
) -> Result<T, Error> {
    T::deserialize(Decoder {
        source: Source::Map(map),
        path: KeyPath::from_prefix(prefix),
        secret_key,
    })
}

/// Decodes the subtree beneath `prefix` from a source that can only answer
/// for one key at a time, such as the guest side of the channel.
///
/// Such a source cannot reveal whether anything exists beneath a path, so an
/// `Option` holding a struct always decodes as `None`.
pub fn decode_lookup<T, F>(
    lookup: F,
    prefix: &str,
    secret_key: Option<&SecretKey>,
) -> Result<T, Error>
where
    T: DeserializeOwned,
    F: Fn(&str) -> Result<Option<String>, Error>,
{
    T::deserialize(Decoder {
        source: Source::Lookup(&lookup),
        path: KeyPath::from_prefix(prefix),
        secret_key,
    })
}

/// Computes the update that turns guest-info holding `old` into guest-info
/// holding exactly `new`: every key of `new`, plus every key of `old` that
/// `new` lacks set to the empty string.
pub fn changes(old: &ExtraConfig, new: &ExtraConfig) -> ExtraConfig {
    let mut update = new.clone();
    for key in old.keys() {
        if !new.contains_key(key) {
            update.insert(key.clone(), String::new());
        }
    }
    update
}

/// Restricts `map` to the vice keys the guest is allowed to write.
pub fn published_only(map: &ExtraConfig) -> ExtraConfig {
    map.iter()
        .filter(|(k, _)| is_published(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Applies an update produced by [`changes`] to `map`, treating empty values
/// as deletions the way the hypervisor does.
pub fn apply(map: &mut ExtraConfig, update: &ExtraConfig) {
    for (key, value) in update {
        if value.is_empty() {
            map.remove(key);
        } else {
            map.insert(key.clone(), value.clone());
        }
    }
}
