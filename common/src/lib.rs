// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # Virtual Container Host common facilities
//!
//! This crate holds what the control-plane dispatcher and the in-guest
//! components agree on:
//!
//! * the [`config::VchConfigSpec`] model, the single source of truth for a
//!   VCH, and the [`config::ExecutorConfig`] subtree that the in-guest tether
//!   consumes;
//! * the [`extraconfig`] codec that flattens those models into the
//!   string-to-string map carried by the hypervisor's guest-info channel;
//! * managed-object references ([`moref::MoRef`]), which are how the rest of
//!   the system names hypervisor objects without holding pointers to them;
//! * retry policies ([`backoff`]).

pub mod backoff;
pub mod config;
pub mod extraconfig;
pub mod moref;

pub use moref::MoRef;
