// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helpers over the vSphere management API
//!
//! The API itself sits behind the [`Hypervisor`] trait.  On top of it this
//! crate provides the pieces every caller needs: a task waiter that retries
//! transient faults ([`tasks`]), a `SystemError` retry scoped to snapshot
//! removal ([`retry`]), a self-repairing VM handle ([`vm`]), an inventory
//! ancestry walker ([`ancestry`]) and the tagged managed-object model
//! ([`object`]).

pub mod ancestry;
pub mod context;
pub mod datastore;
mod error;
pub mod fault;
pub mod hypervisor;
pub mod object;
pub mod retry;
pub mod tasks;
pub mod vm;

#[cfg(any(test, feature = "testing"))]
pub mod fakes;

pub use context::Context;
pub use error::Error;
pub use fault::{Fault, FaultKind};
pub use hypervisor::{BoxedHypervisor, Hypervisor};
pub use vm::VirtualMachine;
