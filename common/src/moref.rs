// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Managed-object references

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Opaque handle naming an object managed by the hypervisor
///
/// Parent/child relationships between VMs, pools, vApps and datacenters are
/// cyclic in the hypervisor's inventory.  Nothing in this workspace holds
/// pointers across that graph: objects are named by `MoRef` and looked up
/// through the hypervisor when needed.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MoRef {
    pub kind: String,
    pub value: String,
}

impl MoRef {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self { kind: kind.into(), value: value.into() }
    }

    pub fn is_empty(&self) -> bool {
        self.kind.is_empty() && self.value.is_empty()
    }
}

impl fmt::Display for MoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        write!(f, "{}:{}", self.kind, self.value)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid managed object reference {0:?}")]
pub struct ParseMoRefError(String);

impl FromStr for MoRef {
    type Err = ParseMoRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(MoRef::default());
        }
        match s.split_once(':') {
            Some((kind, value)) if !kind.is_empty() && !value.is_empty() => {
                Ok(MoRef::new(kind, value))
            }
            _ => Err(ParseMoRefError(s.to_string())),
        }
    }
}

impl Serialize for MoRef {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MoRef {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_and_parse() {
        let r = MoRef::new("VirtualMachine", "vm-42");
        assert_eq!(r.to_string(), "VirtualMachine:vm-42");
        assert_eq!("VirtualMachine:vm-42".parse::<MoRef>().unwrap(), r);
        assert_eq!("".parse::<MoRef>().unwrap(), MoRef::default());
        assert!("vm-42".parse::<MoRef>().is_err());
    }
}
