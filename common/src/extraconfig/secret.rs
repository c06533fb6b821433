// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scope markers and the per-VCH secret key

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use serde::de::{Deserialize, Deserializer, Visitor};
use serde::ser::{Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;

pub(crate) const SECRET_MARKER: &str = "$__vch_extraconfig_secret";
pub(crate) const PUBLISHED_MARKER: &str = "$__vch_extraconfig_published";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret is not valid base64")]
    Encoding(#[from] base64::DecodeError),
    #[error("expected a {expected}-byte value, found {found} bytes")]
    Length { expected: usize, found: usize },
    #[error("failed to seal or open secret value")]
    Cipher,
    #[error("opened secret is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Symmetric key sealing the secret portion of a VCH's configuration
///
/// The key itself is stored in the appliance's `.vmx` so that both the
/// dispatcher (which downloads the file) and the guest can open sealed
/// values.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        SecretKey(key)
    }

    /// Base64 rendering suitable for storing in the `.vmx`.
    pub fn encoded(&self) -> String {
        STANDARD.encode(self.0)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, SecretError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| SecretError::Cipher)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(STANDARD.encode(out))
    }

    pub fn open(&self, sealed: &str) -> Result<String, SecretError> {
        let raw = STANDARD.decode(sealed)?;
        if raw.len() < NONCE_LEN {
            return Err(SecretError::Length {
                expected: NONCE_LEN,
                found: raw.len(),
            });
        }
        let (nonce, body) = raw.split_at(NONCE_LEN);
        let plain = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| SecretError::Cipher)?;
        Ok(String::from_utf8(plain)?)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

impl FromStr for SecretKey {
    type Err = SecretError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = STANDARD.decode(s.trim())?;
        let key: [u8; KEY_LEN] =
            raw.as_slice().try_into().map_err(|_| SecretError::Length {
                expected: KEY_LEN,
                found: raw.len(),
            })?;
        Ok(SecretKey(key))
    }
}

/// Marks a value to be sealed with the per-VCH [`SecretKey`]
///
/// Outside the guest-info codec this serializes transparently.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret<T>(pub T);

impl<T> Secret<T> {
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl<T> From<T> for Secret<T> {
    fn from(value: T) -> Self {
        Secret(value)
    }
}

/// Marks a value the guest writes back to guest-info
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Published<T>(pub T);

impl<T> Deref for Published<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for Published<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T> From<T> for Published<T> {
    fn from(value: T) -> Self {
        Published(value)
    }
}

macro_rules! marker_serde {
    ($ty:ident, $marker:expr) => {
        impl<T: Serialize> Serialize for $ty<T> {
            fn serialize<S: Serializer>(
                &self,
                serializer: S,
            ) -> Result<S::Ok, S::Error> {
                serializer.serialize_newtype_struct($marker, &self.0)
            }
        }

        impl<'de, T: Deserialize<'de>> Deserialize<'de> for $ty<T> {
            fn deserialize<D: Deserializer<'de>>(
                deserializer: D,
            ) -> Result<Self, D::Error> {
                struct MarkerVisitor<T>(PhantomData<T>);

                impl<'de, T: Deserialize<'de>> Visitor<'de> for MarkerVisitor<T> {
                    type Value = $ty<T>;

                    fn expecting(
                        &self,
                        f: &mut fmt::Formatter<'_>,
                    ) -> fmt::Result {
                        write!(f, "a {} value", stringify!($ty))
                    }

                    fn visit_newtype_struct<D: Deserializer<'de>>(
                        self,
                        deserializer: D,
                    ) -> Result<Self::Value, D::Error> {
                        T::deserialize(deserializer).map($ty)
                    }
                }

                deserializer.deserialize_newtype_struct(
                    $marker,
                    MarkerVisitor(PhantomData),
                )
            }
        }
    };
}

marker_serde!(Secret, SECRET_MARKER);
marker_serde!(Published, PUBLISHED_MARKER);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn seal_and_open() {
        let key = SecretKey::generate();
        let sealed = key.seal("hunter2").unwrap();
        assert_ne!(sealed, "hunter2");
        assert_eq!(key.open(&sealed).unwrap(), "hunter2");

        let other = SecretKey::generate();
        assert!(matches!(other.open(&sealed), Err(SecretError::Cipher)));
    }

    #[test]
    fn key_string_form() {
        let key = SecretKey::generate();
        let parsed: SecretKey = key.encoded().parse().unwrap();
        assert_eq!(parsed, key);
        assert!(matches!(
            "c2hvcnQ=".parse::<SecretKey>(),
            Err(SecretError::Length { expected: 32, found: 5 })
        ));
    }

    #[test]
    fn markers_are_transparent_to_json() {
        let v = (Secret("a".to_string()), Published(3u32));
        assert_eq!(serde_json::to_string(&v).unwrap(), r#"["a",3]"#);
    }
}
