// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-guest supervisor for appliance and container VMs
//!
//! The tether runs as the VM's init.  It reads its configuration from
//! guest-info, configures the guest (hostname, network endpoints, volume
//! mounts), starts the configured sessions and restarts them according to
//! their policy, and reports their state back through guest-info.  A serial
//! back-channel gives the appliance exec, signal and network control over
//! the VM.
//!
//! Access to the hypervisor and to the operating system sits behind the
//! [`guestinfo::GuestInfo`] and [`ops::Operations`] traits so that the
//! supervision logic can be exercised without either.

pub mod backchannel;
pub mod config;
pub mod executor;
pub mod guestinfo;
pub mod ops;
pub mod process;
pub mod reaper;
pub mod signals;
mod tether;
pub mod toolbox;

pub use tether::{Exec, Tether, DRAIN_TIMEOUT};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tether is already running")]
    AlreadyRunning,
    #[error("blocking guest-info task failed: {0}")]
    Join(String),
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),
    #[error("no address was assigned")]
    NoAddress,
    #[error("no network endpoint is configured")]
    NoEndpoint,
    #[error("session {0:?} is not running")]
    NotRunning(String),
    #[error(transparent)]
    GuestInfo(#[from] guestinfo::GuestInfoError),
    #[error(transparent)]
    Ops(#[from] ops::OpsError),
}
