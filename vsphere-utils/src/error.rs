// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::fault::{Fault, FaultKind};
use crate::object::PowerState;
use vch_common::MoRef;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Fault(#[from] Fault),

    #[error("{op}: {source}")]
    Op {
        op: String,
        #[source]
        source: Box<Error>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{moref} is a {actual}, expected a {expected}")]
    UnexpectedType { moref: MoRef, expected: &'static str, actual: String },

    #[error("runtime.powerState={0}")]
    PowerState(PowerState),

    #[error("invalid datastore path {0:?}")]
    DatastorePath(String),

    #[error("guest-info: {0}")]
    ExtraConfig(#[from] vch_common::extraconfig::Error),
}

impl Error {
    /// Adds the name of the operation being attempted without hiding the
    /// underlying fault from [`Error::fault`].
    pub fn context(self, op: impl Into<String>) -> Error {
        Error::Op { op: op.into(), source: Box::new(self) }
    }

    /// The hypervisor fault at the root of this error, if any.
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Error::Fault(fault) => Some(fault),
            Error::Op { source, .. } => source.fault(),
            _ => None,
        }
    }

    pub fn is_fault(&self, kind: &FaultKind) -> bool {
        self.fault().is_some_and(|f| f.kind() == kind)
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Op { source, .. } => source.is_not_found(),
            _ => self.is_fault(&FaultKind::ManagedObjectNotFound)
                || self.is_fault(&FaultKind::FileNotFound),
        }
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        match self {
            Error::DeadlineExceeded => true,
            Error::Op { source, .. } => source.is_deadline_exceeded(),
            _ => false,
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Error {
        Error::NotFound { kind, name: name.into() }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn context_preserves_fault() {
        let err = Error::from(Fault::task(FaultKind::SystemError, "vsan"))
            .context("remove snapshot")
            .context("rollback");
        assert!(err.is_fault(&FaultKind::SystemError));
        assert_eq!(
            err.to_string(),
            "rollback: remove snapshot: task failed with SystemError: vsan"
        );
    }

    #[test]
    fn missing_files_are_not_found() {
        let err = Error::from(Fault::vim(FaultKind::FileNotFound, "gone"));
        assert!(err.is_not_found());
        assert!(!Error::Cancelled.is_not_found());
    }
}
