// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flattening a value tree into guest-info keys

use super::keys::{KeyPath, ENTRY_SEPARATOR};
use super::secret::{SecretKey, PUBLISHED_MARKER, SECRET_MARKER};
use super::Error;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::ser::{self, Serialize};
use std::collections::BTreeMap;

pub(crate) struct Encoder<'a> {
    pub(crate) out: &'a mut BTreeMap<String, String>,
    pub(crate) path: KeyPath,
    pub(crate) secret_key: Option<&'a SecretKey>,
}

impl<'a> Encoder<'a> {
    /// Empty values are not written: guest-info treats an empty value as a
    /// deleted key, and decoding a missing key yields the empty value.
    fn leaf(self, value: String) -> Result<(), Error> {
        if value.is_empty() {
            return Ok(());
        }
        let key = self.path.render();
        let value = match (self.path.is_secret(), self.secret_key) {
            (true, Some(secret)) => secret
                .seal(&value)
                .map_err(|source| Error::Secret { key: key.clone(), source })?,
            _ => value,
        };
        self.out.insert(key, value);
        Ok(())
    }

    fn with_path(self, path: KeyPath) -> Encoder<'a> {
        Encoder { path, ..self }
    }

    fn compound(self, kind: CompoundKind) -> Compound<'a> {
        Compound { enc: self, kind }
    }
}

enum CompoundKind {
    Struct,
    Seq { len: usize },
    Map { keys: Vec<String>, pending: Option<String> },
}

pub(crate) struct Compound<'a> {
    enc: Encoder<'a>,
    kind: CompoundKind,
}

impl<'a> Compound<'a> {
    fn nested(&mut self, path: KeyPath) -> Encoder<'_> {
        Encoder {
            out: &mut *self.enc.out,
            path,
            secret_key: self.enc.secret_key,
        }
    }

    fn element<T: ?Sized + Serialize>(
        &mut self,
        value: &T,
    ) -> Result<(), Error> {
        let index = match &mut self.kind {
            CompoundKind::Seq { len } => {
                let index = *len;
                *len += 1;
                index
            }
            _ => return Err(Error::Message("element outside sequence".into())),
        };
        let path = self.enc.path.entry(&index.to_string());
        value.serialize(self.nested(path))
    }

    fn finish(self) -> Result<(), Error> {
        match self.kind {
            CompoundKind::Struct => Ok(()),
            CompoundKind::Seq { len } if len == 0 => Ok(()),
            CompoundKind::Seq { len } => self.enc.leaf(len.to_string()),
            CompoundKind::Map { keys, .. } => {
                let sep = ENTRY_SEPARATOR.to_string();
                self.enc.leaf(keys.join(&sep))
            }
        }
    }
}

/// Renders a map key as the string used inside guest-info keys.
fn map_key<T: ?Sized + Serialize>(key: &T) -> Result<String, Error> {
    let value =
        serde_json::to_value(key).map_err(|e| Error::Message(e.to_string()))?;
    let key = match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        other => {
            return Err(Error::Message(format!(
                "unsupported map key {other}"
            )))
        }
    };
    if key.is_empty() || key.contains(ENTRY_SEPARATOR) || key.contains('/') {
        return Err(Error::InvalidMapKey(key));
    }
    Ok(key)
}

impl<'a> ser::Serializer for Encoder<'a> {
    type Ok = ();
    type Error = Error;
    type SerializeSeq = Compound<'a>;
    type SerializeTuple = Compound<'a>;
    type SerializeTupleStruct = Compound<'a>;
    type SerializeTupleVariant = ser::Impossible<(), Error>;
    type SerializeMap = Compound<'a>;
    type SerializeStruct = Compound<'a>;
    type SerializeStructVariant = ser::Impossible<(), Error>;

    fn serialize_bool(self, v: bool) -> Result<(), Error> {
        self.leaf(v.to_string())
    }

    fn serialize_i8(self, v: i8) -> Result<(), Error> {
        self.leaf(v.to_string())
    }

    fn serialize_i16(self, v: i16) -> Result<(), Error> {
        self.leaf(v.to_string())
    }

    fn serialize_i32(self, v: i32) -> Result<(), Error> {
        self.leaf(v.to_string())
    }

    fn serialize_i64(self, v: i64) -> Result<(), Error> {
        self.leaf(v.to_string())
    }

    fn serialize_u8(self, v: u8) -> Result<(), Error> {
        self.leaf(v.to_string())
    }

    fn serialize_u16(self, v: u16) -> Result<(), Error> {
        self.leaf(v.to_string())
    }

    fn serialize_u32(self, v: u32) -> Result<(), Error> {
        self.leaf(v.to_string())
    }

    fn serialize_u64(self, v: u64) -> Result<(), Error> {
        self.leaf(v.to_string())
    }

    fn serialize_f32(self, v: f32) -> Result<(), Error> {
        self.leaf(v.to_string())
    }

    fn serialize_f64(self, v: f64) -> Result<(), Error> {
        self.leaf(v.to_string())
    }

    fn serialize_char(self, v: char) -> Result<(), Error> {
        self.leaf(v.to_string())
    }

    fn serialize_str(self, v: &str) -> Result<(), Error> {
        self.leaf(v.to_string())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<(), Error> {
        self.leaf(STANDARD.encode(v))
    }

    fn serialize_none(self) -> Result<(), Error> {
        Ok(())
    }

    fn serialize_some<T: ?Sized + Serialize>(
        self,
        value: &T,
    ) -> Result<(), Error> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), Error> {
        Ok(())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), Error> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<(), Error> {
        self.leaf(variant.to_string())
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        name: &'static str,
        value: &T,
    ) -> Result<(), Error> {
        let path = match name {
            SECRET_MARKER => self.path.sealed(),
            PUBLISHED_MARKER => self.path.published(),
            _ => self.path.clone(),
        };
        value.serialize(self.with_path(path))
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        name: &'static str,
        _index: u32,
        variant: &'static str,
        _value: &T,
    ) -> Result<(), Error> {
        Err(Error::Unsupported {
            key: self.path.render(),
            what: format!("newtype variant {name}::{variant}"),
        })
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Compound<'a>, Error> {
        Ok(self.compound(CompoundKind::Seq { len: 0 }))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Compound<'a>, Error> {
        Ok(self.compound(CompoundKind::Seq { len: 0 }))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Compound<'a>, Error> {
        Ok(self.compound(CompoundKind::Seq { len: 0 }))
    }

    fn serialize_tuple_variant(
        self,
        name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, Error> {
        Err(Error::Unsupported {
            key: self.path.render(),
            what: format!("tuple variant {name}::{variant}"),
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Compound<'a>, Error> {
        Ok(self.compound(CompoundKind::Map { keys: Vec::new(), pending: None }))
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Compound<'a>, Error> {
        Ok(self.compound(CompoundKind::Struct))
    }

    fn serialize_struct_variant(
        self,
        name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, Error> {
        Err(Error::Unsupported {
            key: self.path.render(),
            what: format!("struct variant {name}::{variant}"),
        })
    }
}

impl<'a> ser::SerializeSeq for Compound<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized + Serialize>(
        &mut self,
        value: &T,
    ) -> Result<(), Error> {
        self.element(value)
    }

    fn end(self) -> Result<(), Error> {
        self.finish()
    }
}

impl<'a> ser::SerializeTuple for Compound<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized + Serialize>(
        &mut self,
        value: &T,
    ) -> Result<(), Error> {
        self.element(value)
    }

    fn end(self) -> Result<(), Error> {
        self.finish()
    }
}

impl<'a> ser::SerializeTupleStruct for Compound<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        value: &T,
    ) -> Result<(), Error> {
        self.element(value)
    }

    fn end(self) -> Result<(), Error> {
        self.finish()
    }
}

impl<'a> ser::SerializeMap for Compound<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_key<T: ?Sized + Serialize>(
        &mut self,
        key: &T,
    ) -> Result<(), Error> {
        let key = map_key(key)?;
        match &mut self.kind {
            CompoundKind::Map { keys, pending } => {
                keys.push(key.clone());
                *pending = Some(key);
                Ok(())
            }
            _ => Err(Error::Message("map key outside map".into())),
        }
    }

    fn serialize_value<T: ?Sized + Serialize>(
        &mut self,
        value: &T,
    ) -> Result<(), Error> {
        let key = match &mut self.kind {
            CompoundKind::Map { pending, .. } => pending.take(),
            _ => None,
        }
        .ok_or_else(|| Error::Message("map value without key".into()))?;
        let path = self.enc.path.entry(&key);
        value.serialize(self.nested(path))
    }

    fn end(self) -> Result<(), Error> {
        self.finish()
    }
}

impl<'a> ser::SerializeStruct for Compound<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), Error> {
        let path = self.enc.path.child(key);
        value.serialize(self.nested(path))
    }

    fn end(self) -> Result<(), Error> {
        self.finish()
    }
}
