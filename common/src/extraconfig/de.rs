// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rebuilding a value tree from guest-info keys

use super::keys::{KeyPath, ENTRY_SEPARATOR};
use super::secret::{SecretKey, PUBLISHED_MARKER, SECRET_MARKER};
use super::Error;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::value::{StrDeserializer, StringDeserializer};
use serde::de::{self, DeserializeSeed, IntoDeserializer, Visitor};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

pub(crate) type Lookup<'a> = dyn Fn(&str) -> Result<Option<String>, Error> + 'a;

/// Where encoded values are read from
#[derive(Clone, Copy)]
pub(crate) enum Source<'a> {
    /// A complete copy of the key space
    Map(&'a BTreeMap<String, String>),
    /// Per-key queries, as the guest has; keys cannot be enumerated
    Lookup(&'a Lookup<'a>),
}

impl Source<'_> {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        match self {
            Source::Map(map) => Ok(map.get(key).cloned()),
            Source::Lookup(lookup) => lookup(key),
        }
    }

    /// Returns true if there may be data at or beneath `path`.  A lookup
    /// can only probe the keys of the path itself.
    fn has_data(&self, path: &KeyPath) -> Result<bool, Error> {
        match self {
            Source::Map(map) => Ok(path.has_data(map)),
            Source::Lookup(lookup) => {
                for key in path.probe_keys() {
                    if lookup(&key)?.is_some_and(|v| !v.is_empty()) {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    fn is_enumerable(&self) -> bool {
        matches!(self, Source::Map(_))
    }
}

#[derive(Clone)]
pub(crate) struct Decoder<'a> {
    pub(crate) source: Source<'a>,
    pub(crate) path: KeyPath,
    pub(crate) secret_key: Option<&'a SecretKey>,
}

impl<'a> Decoder<'a> {
    fn at(&self, path: KeyPath) -> Decoder<'a> {
        Decoder { source: self.source, path, secret_key: self.secret_key }
    }

    /// Value stored exactly at this path, opened if sealed.
    fn leaf(&self) -> Result<Option<String>, Error> {
        let key = self.path.render();
        let Some(value) = self.source.get(&key)? else {
            return Ok(None);
        };
        match (self.path.is_secret(), self.secret_key) {
            (true, Some(secret)) => secret
                .open(&value)
                .map(Some)
                .map_err(|source| Error::Secret { key, source }),
            _ => Ok(Some(value)),
        }
    }

    /// Parses the value at this path, yielding the default for a missing or
    /// empty value.
    fn parse<T>(&self) -> Result<T, Error>
    where
        T: FromStr + Default,
        T::Err: Display,
    {
        match self.leaf()? {
            None => Ok(T::default()),
            Some(v) if v.is_empty() => Ok(T::default()),
            Some(v) => v.parse().map_err(|e: T::Err| Error::Parse {
                key: self.path.render(),
                value: v,
                reason: e.to_string(),
            }),
        }
    }

    fn entries(&self) -> Result<Vec<String>, Error> {
        Ok(self
            .leaf()?
            .unwrap_or_default()
            .split(ENTRY_SEPARATOR)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect())
    }
}

macro_rules! parse_primitive {
    ($method:ident, $visit:ident) => {
        fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
            visitor.$visit(self.parse()?)
        }
    };
}

impl<'de, 'a> de::Deserializer<'de> for Decoder<'a> {
    type Error = Error;

    fn deserialize_any<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Error> {
        match self.leaf()? {
            Some(v) => visitor.visit_string(v),
            None => visitor.visit_unit(),
        }
    }

    parse_primitive!(deserialize_bool, visit_bool);
    parse_primitive!(deserialize_i8, visit_i8);
    parse_primitive!(deserialize_i16, visit_i16);
    parse_primitive!(deserialize_i32, visit_i32);
    parse_primitive!(deserialize_i64, visit_i64);
    parse_primitive!(deserialize_u8, visit_u8);
    parse_primitive!(deserialize_u16, visit_u16);
    parse_primitive!(deserialize_u32, visit_u32);
    parse_primitive!(deserialize_u64, visit_u64);
    parse_primitive!(deserialize_f32, visit_f32);
    parse_primitive!(deserialize_f64, visit_f64);

    fn deserialize_char<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Error> {
        let s = self.leaf()?.unwrap_or_default();
        match s.chars().next() {
            Some(c) => visitor.visit_char(c),
            None => visitor.visit_char('\0'),
        }
    }

    fn deserialize_str<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Error> {
        visitor.visit_string(self.leaf()?.unwrap_or_default())
    }

    fn deserialize_string<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Error> {
        visitor.visit_string(self.leaf()?.unwrap_or_default())
    }

    fn deserialize_bytes<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Error> {
        self.deserialize_byte_buf(visitor)
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Error> {
        let raw = self.leaf()?.unwrap_or_default();
        let bytes = STANDARD.decode(&raw).map_err(|e| Error::Parse {
            key: self.path.render(),
            value: raw,
            reason: e.to_string(),
        })?;
        visitor.visit_byte_buf(bytes)
    }

    fn deserialize_option<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Error> {
        if self.source.has_data(&self.path)? {
            visitor.visit_some(self)
        } else {
            visitor.visit_none()
        }
    }

    fn deserialize_unit<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Error> {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Error> {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Error> {
        let path = match name {
            SECRET_MARKER => self.path.sealed(),
            PUBLISHED_MARKER => self.path.published(),
            _ => return visitor.visit_newtype_struct(self),
        };
        visitor.visit_newtype_struct(self.at(path))
    }

    fn deserialize_seq<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Error> {
        let len: usize = self.parse()?;
        visitor.visit_seq(SeqDecoder { dec: self, index: 0, len })
    }

    fn deserialize_tuple<V: Visitor<'de>>(
        self,
        len: usize,
        visitor: V,
    ) -> Result<V::Value, Error> {
        visitor.visit_seq(SeqDecoder { dec: self, index: 0, len })
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        len: usize,
        visitor: V,
    ) -> Result<V::Value, Error> {
        self.deserialize_tuple(len, visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Error> {
        let keys = self.entries()?;
        visitor.visit_map(MapDecoder {
            dec: self,
            keys: keys.into_iter(),
            current: None,
        })
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Error> {
        visitor.visit_map(StructDecoder {
            dec: self,
            fields: fields.iter(),
            current: None,
        })
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Error> {
        let variant: StringDeserializer<Error> =
            self.leaf()?.unwrap_or_default().into_deserializer();
        visitor.visit_enum(variant)
    }

    fn deserialize_identifier<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Error> {
        self.deserialize_string(visitor)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Error> {
        visitor.visit_unit()
    }
}

struct SeqDecoder<'a> {
    dec: Decoder<'a>,
    index: usize,
    len: usize,
}

impl<'de, 'a> de::SeqAccess<'de> for SeqDecoder<'a> {
    type Error = Error;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> Result<Option<T::Value>, Error> {
        if self.index >= self.len {
            return Ok(None);
        }
        let path = self.dec.path.entry(&self.index.to_string());
        self.index += 1;
        seed.deserialize(self.dec.at(path)).map(Some)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.len - self.index)
    }
}

struct MapDecoder<'a> {
    dec: Decoder<'a>,
    keys: std::vec::IntoIter<String>,
    current: Option<String>,
}

impl<'de, 'a> de::MapAccess<'de> for MapDecoder<'a> {
    type Error = Error;

    fn next_key_seed<K: DeserializeSeed<'de>>(
        &mut self,
        seed: K,
    ) -> Result<Option<K::Value>, Error> {
        let Some(key) = self.keys.next() else {
            return Ok(None);
        };
        self.current = Some(key.clone());
        let key: StringDeserializer<Error> = key.into_deserializer();
        seed.deserialize(key).map(Some)
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(
        &mut self,
        seed: V,
    ) -> Result<V::Value, Error> {
        let key = self
            .current
            .take()
            .ok_or_else(|| Error::Message("map value without key".into()))?;
        seed.deserialize(self.dec.at(self.dec.path.entry(&key)))
    }
}

/// Presents a struct as a map of only those fields that have data, so that
/// `#[serde(default)]` fills in the rest.  A source that cannot be enumerated
/// is asked for every field.
struct StructDecoder<'a> {
    dec: Decoder<'a>,
    fields: std::slice::Iter<'static, &'static str>,
    current: Option<&'static str>,
}

impl<'de, 'a> de::MapAccess<'de> for StructDecoder<'a> {
    type Error = Error;

    fn next_key_seed<K: DeserializeSeed<'de>>(
        &mut self,
        seed: K,
    ) -> Result<Option<K::Value>, Error> {
        for &field in self.fields.by_ref() {
            let path = self.dec.path.child(field);
            if !self.dec.source.is_enumerable()
                || self.dec.source.has_data(&path)?
            {
                self.current = Some(field);
                let key: StrDeserializer<'static, Error> =
                    field.into_deserializer();
                return seed.deserialize(key).map(Some);
            }
        }
        Ok(None)
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(
        &mut self,
        seed: V,
    ) -> Result<V::Value, Error> {
        let field = self
            .current
            .take()
            .ok_or_else(|| Error::Message("field value without key".into()))?;
        seed.deserialize(self.dec.at(self.dec.path.child(field)))
    }
}
