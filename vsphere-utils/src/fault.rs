// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hypervisor faults
//!
//! The management API reports a failure in one of three envelopes: a SOAP
//! fault returned by the call itself, a bare Vim fault, or the error of a
//! task that was started successfully and failed later.  Retry predicates
//! look through the envelope at the [`FaultKind`].

use std::fmt;

/// The inner fault type, as named by the management API.
#[derive(Clone, Debug, PartialEq, Eq, strum::EnumString, strum::IntoStaticStr)]
pub enum FaultKind {
    TaskInProgress,
    NetworkDisruptedAndConfigRolledBack,
    InvalidArgument,
    SystemError,
    InvalidState,
    InvalidPowerState,
    DuplicateName,
    ManagedObjectNotFound,
    FileNotFound,
    FileAlreadyExists,
    InvalidLogin,
    NoPermission,
    ResourceInUse,
    GuestOperationsUnavailable,
    #[strum(default)]
    Other(String),
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Other(name) => f.write_str(name),
            known => f.write_str(known.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    #[error("SOAP fault {kind}: {message}")]
    Soap { kind: FaultKind, message: String },
    #[error("{kind}: {message}")]
    Vim { kind: FaultKind, message: String },
    #[error("task failed with {kind}: {message}")]
    Task { kind: FaultKind, message: String },
}

impl Fault {
    pub fn soap(kind: FaultKind, message: impl Into<String>) -> Self {
        Fault::Soap { kind, message: message.into() }
    }

    pub fn vim(kind: FaultKind, message: impl Into<String>) -> Self {
        Fault::Vim { kind, message: message.into() }
    }

    pub fn task(kind: FaultKind, message: impl Into<String>) -> Self {
        Fault::Task { kind, message: message.into() }
    }

    pub fn kind(&self) -> &FaultKind {
        match self {
            Fault::Soap { kind, .. }
            | Fault::Vim { kind, .. }
            | Fault::Task { kind, .. } => kind,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Fault::Soap { message, .. }
            | Fault::Vim { message, .. }
            | Fault::Task { message, .. } => message,
        }
    }

    pub fn envelope(&self) -> Envelope {
        match self {
            Fault::Soap { .. } => Envelope::Soap,
            Fault::Vim { .. } => Envelope::Vim,
            Fault::Task { .. } => Envelope::Task,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Envelope {
    Soap,
    Vim,
    Task,
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Envelope::Soap => "soap",
            Envelope::Vim => "vim",
            Envelope::Task => "task",
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kind_parses_unknown_names() {
        assert_eq!(
            "SystemError".parse::<FaultKind>().unwrap(),
            FaultKind::SystemError
        );
        assert_eq!(
            "HostCommunication".parse::<FaultKind>().unwrap(),
            FaultKind::Other("HostCommunication".to_string())
        );
    }

    #[test]
    fn kind_is_visible_through_every_envelope() {
        for fault in [
            Fault::soap(FaultKind::SystemError, "a"),
            Fault::vim(FaultKind::SystemError, "b"),
            Fault::task(FaultKind::SystemError, "c"),
        ] {
            assert_eq!(fault.kind(), &FaultKind::SystemError);
        }
    }
}
