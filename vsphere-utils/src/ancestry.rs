// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Walking up the inventory tree

use crate::context::Context;
use crate::hypervisor::Hypervisor;
use crate::Error;
use vch_common::MoRef;

/// Bound on the inventory depth walked before giving up, so that a cycle
/// in a broken inventory cannot hang the caller.
const MAX_DEPTH: usize = 64;

/// Returns the nearest ancestor of `moref` (possibly `moref` itself) whose
/// type is `kind`.
pub async fn nearest_of_kind(
    ctx: &Context,
    hv: &dyn Hypervisor,
    moref: &MoRef,
    kind: &str,
) -> Result<MoRef, Error> {
    let mut current = moref.clone();
    for _ in 0..MAX_DEPTH {
        if current.kind == kind {
            return Ok(current);
        }
        let entity = ctx.run(hv.entity(&current)).await?;
        current = match entity.parent {
            Some(parent) => parent,
            None => break,
        };
    }
    Err(Error::not_found(
        "ancestor",
        format!("{} of {}", kind, moref),
    ))
}
