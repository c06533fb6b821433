// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lifecycle of Virtual Container Hosts
//!
//! A [`Dispatcher`] drives every mutation of a VCH through the hypervisor:
//! creating the appliance VM and its pool, reconfiguring or upgrading it
//! under a snapshot so that a failure rolls back to the previous version,
//! rolling back on request, deleting it with its containers, and inspecting
//! a running one.  All hypervisor access goes through
//! [`vsphere_utils::Hypervisor`].

mod appliance;
mod configure;
mod delete;
mod diagnostics;
mod dispatcher;
mod inspect;
mod readiness;
mod storage;

pub use configure::{CONFIGURE_PREFIX, UPGRADE_PREFIX};
pub use delete::{DeleteContainers, DeleteVolumeStores};
pub use dispatcher::{Dispatcher, InstallerData};
pub use inspect::VchInfo;

use std::time::Duration;
use vch_common::config::{SpecError, Version};
use vch_common::extraconfig::SecretError;
use vsphere_utils::object::PowerState;

/// The next thing an operator should try after an error
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum Hint {
    #[strum(serialize = "use --timeout to allow more time")]
    UseTimeout,
    #[strum(serialize = "use --force")]
    UseForce,
    #[strum(serialize = "use --resetInProgressFlag to clear the flag")]
    UseResetInProgressFlag,
    #[strum(serialize = "use vic-machine inspect to see the VCH state")]
    UseInspect,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "Appliance {0:?} exists, to install with same name, please delete it \
         first."
    )]
    ApplianceExists(String),

    #[error(
        "VM {0:?} is found, but is not VCH appliance, please choose different \
         name"
    )]
    NotAVch(String),

    #[error(
        "virtual app {0:?} is found, but is not VCH, please choose different \
         name"
    )]
    VAppNotVch(String),

    #[error("VM {0:?} is powered on")]
    PoweredOn(String),

    #[error("another update in progress")]
    UpdateInProgress,

    #[error(
        "A VCH version available from before the last upgrade could not be \
         found. No error was reported, so it's possible that this VCH has \
         never been upgraded or the saved previous version was removed \
         out-of-band."
    )]
    NoRollbackSnapshot,

    #[error(
        "Upgrading VCH exceeded time limit of {0:?}. Please increase the \
         timeout using --timeout to accommodate for a busy vSphere target"
    )]
    ReadinessTimeout(Duration),

    #[error("VCH API is not ready: {0}")]
    NotReady(String),

    #[error("unable to find guestinfo secret")]
    SecretKeyNotFound,

    #[error("session's datastore is not set")]
    NilDatastore,

    #[error("invalid guestinfo secret")]
    InvalidSecret(#[source] SecretError),

    #[error(
        "refusing to remove datastore files for path \"\" on datastore {0:?}"
    )]
    EmptyDatastorePath(String),

    #[error("failed to upload {file}")]
    Upload {
        file: String,
        #[source]
        source: vsphere_utils::Error,
    },

    /// Failures deleting the VMs of a VCH, one per line
    #[error("{0}")]
    Children(String),

    /// Failures removing image or volume stores, one per line
    #[error("{0}")]
    Stores(String),

    /// Failures cleaning up a VCH before its appliance is removed, one per
    /// line
    #[error("{0}")]
    Cleanup(String),

    #[error("VCH version {vch} differs from installer version {installer}")]
    VersionMismatch { vch: Version, installer: Version },

    #[error("VCH version {vch} is newer than installer version {installer}")]
    NewerVersion { vch: Version, installer: Version },

    #[error("VCH is not powered on: runtime.powerState={0}")]
    NotPoweredOn(PowerState),

    #[error("VCH has not published a client network address")]
    NoClientAddress,

    #[error("management API probe exited with unexpected code {0}")]
    VcApiProbe(i64),

    #[error("no compute resource is configured")]
    NoComputeResource,

    #[error("network {0:?} is not found")]
    NetworkNotFound(String),

    #[error("failed to write {path}")]
    Io {
        path: camino::Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error(transparent)]
    Vsphere(#[from] vsphere_utils::Error),

    #[error("invalid VCH configuration")]
    Spec(#[from] SpecError),

    #[error("VCH configuration")]
    ExtraConfig(#[from] vch_common::extraconfig::Error),

    #[error("probing the VCH API")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// What the operator can do about this error, if anything.
    pub fn hint(&self) -> Option<Hint> {
        match self {
            Error::ReadinessTimeout(_) => Some(Hint::UseTimeout),
            Error::UpdateInProgress => Some(Hint::UseResetInProgressFlag),
            Error::Children(_)
            | Error::VersionMismatch { .. }
            | Error::NewerVersion { .. } => Some(Hint::UseForce),
            Error::NotReady(_) | Error::NoClientAddress => {
                Some(Hint::UseInspect)
            }
            Error::Vsphere(err) if err.is_deadline_exceeded() => {
                Some(Hint::UseTimeout)
            }
            _ => None,
        }
    }
}
