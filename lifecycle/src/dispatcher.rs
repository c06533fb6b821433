// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The dispatcher and the lookups every operation shares

use crate::diagnostics::DiagnosticLog;
use crate::Error;
use camino::{Utf8Path, Utf8PathBuf};
use slog::{debug, info, o, Logger};
use std::collections::BTreeMap;
use std::time::Duration;
use vch_common::config::{
    ExecutorConfig, RawCertificate, Resources, VchConfigSpec, Version,
    EXECUTOR_PREFIX, SECRET_KEY_VMX_KEY,
};
use vch_common::extraconfig::{self, SecretKey};
use vch_common::MoRef;
use vsphere_utils::context::DEFAULT_TIMEOUT;
use vsphere_utils::datastore::{DatastorePath, StoreUrl};
use vsphere_utils::object::{
    DatastoreInfo, ManagedEntity, RESOURCE_POOL, VIRTUAL_APP,
    VIRTUAL_MACHINE,
};
use vsphere_utils::{BoxedHypervisor, Context, VirtualMachine};

/// Operator-supplied settings for one operation that are not part of the
/// VCH configuration itself
#[derive(Clone, Debug)]
pub struct InstallerData {
    /// Local ISO images to upload into the appliance's folder
    pub image_files: Vec<Utf8PathBuf>,
    pub appliance_iso: String,
    pub bootstrap_iso: String,
    /// Bound on waiting for the appliance to come up
    pub timeout: Duration,
    /// Version of the images being installed
    pub version: Version,
    pub vch_size: Resources,
    /// Whether `vch_size` was given and should be applied to the VCH pool
    pub vch_size_is_set: bool,
    /// Overrides the Docker API port chosen from the TLS configuration
    pub api_port: Option<u16>,
    pub client_certificate: Option<RawCertificate>,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
}

impl Default for InstallerData {
    fn default() -> Self {
        InstallerData {
            image_files: Vec::new(),
            appliance_iso: "appliance.iso".to_string(),
            bootstrap_iso: "bootstrap.iso".to_string(),
            timeout: DEFAULT_TIMEOUT,
            version: Version::default(),
            vch_size: Resources::default(),
            vch_size_is_set: false,
            api_port: None,
            client_certificate: None,
            http_proxy: None,
            https_proxy: None,
        }
    }
}

/// Drives one operation against one VCH
pub struct Dispatcher {
    pub(crate) log: Logger,
    pub(crate) hv: BoxedHypervisor,
    pub(crate) ctx: Context,
    pub(crate) force: bool,
    pub(crate) secret: Option<SecretKey>,
    pub(crate) diagnostic_logs: BTreeMap<String, DiagnosticLog>,
    pub(crate) diagnostics_dir: Option<Utf8PathBuf>,
}

impl Dispatcher {
    pub fn new(
        hv: BoxedHypervisor,
        log: &Logger,
        force: bool,
        ctx: Context,
    ) -> Self {
        let log = log.new(o!("component" => "Dispatcher"));
        Dispatcher {
            log,
            hv,
            ctx,
            force,
            secret: None,
            diagnostic_logs: BTreeMap::new(),
            diagnostics_dir: None,
        }
    }

    /// Hypervisor logs collected after a failure are written to `dir`.
    pub fn with_diagnostics_dir(mut self, dir: &Utf8Path) -> Self {
        self.diagnostics_dir = Some(dir.to_path_buf());
        self
    }

    pub fn vm(&self, moref: &MoRef) -> VirtualMachine {
        VirtualMachine::new(self.hv.clone(), moref.clone(), &self.log)
    }

    /// Context for cleanup that must run even after the operation's own
    /// context has expired.
    pub(crate) fn cleanup_ctx(&self) -> Context {
        Context::with_timeout(DEFAULT_TIMEOUT)
    }

    pub(crate) async fn child_named(
        &self,
        parent: &MoRef,
        name: &str,
        kinds: &[&str],
    ) -> Result<Option<ManagedEntity>, Error> {
        let children = self.ctx.run(self.hv.children(parent)).await?;
        Ok(children.into_iter().find(|child| {
            child.name == name && kinds.contains(&child.moref.kind.as_str())
        }))
    }

    /// Finds a VCH appliance by inventory path, or by name beneath `pool`.
    pub async fn find_vch(
        &self,
        pool: &MoRef,
        name_or_path: &str,
    ) -> Result<Option<VirtualMachine>, Error> {
        let moref = if name_or_path.contains('/') {
            self.ctx.run(self.hv.find_by_inventory_path(name_or_path)).await?
        } else {
            // The appliance lives in a pool of its own name unless it was
            // placed directly in the parent.
            let container = self
                .child_named(pool, name_or_path, &[RESOURCE_POOL, VIRTUAL_APP])
                .await?
                .map_or_else(|| pool.clone(), |p| p.moref);
            self.child_named(&container, name_or_path, &[VIRTUAL_MACHINE])
                .await?
                .map(|vm| vm.moref)
        };
        let Some(moref) = moref.filter(|m| m.kind == VIRTUAL_MACHINE) else {
            return Ok(None);
        };
        let vm = self.vm(&moref);
        if !self.is_vch(&vm).await? {
            return Err(Error::NotAVch(name_or_path.to_string()));
        }
        Ok(Some(vm))
    }

    /// Whether `vm` carries a VCH configuration that names it.
    pub async fn is_vch(&self, vm: &VirtualMachine) -> Result<bool, Error> {
        let config = vm.fetch_extra_config(&self.ctx).await?;
        let executor: ExecutorConfig = match extraconfig::decode_with_prefix(
            &config,
            EXECUTOR_PREFIX,
            None,
        ) {
            Ok(executor) => executor,
            Err(err) => {
                debug!(self.log, "not a VCH";
                    "vm" => %vm.moref(), "error" => %err);
                return Ok(false);
            }
        };
        Ok(executor.id == vm.moref().to_string())
    }

    /// Extracts the per-VCH secret from the appliance's `.vmx`.
    pub async fn guest_info_secret(
        &self,
        vm: &VirtualMachine,
    ) -> Result<SecretKey, Error> {
        let props = vm.properties(&self.ctx).await?;
        if props.vmx_path.is_empty() {
            return Err(Error::NilDatastore);
        }
        let vmx: DatastorePath = props.vmx_path.parse()?;
        let contents = self.ctx.run(self.hv.download_file(&vmx)).await?;
        let secret = extract_secret(&String::from_utf8_lossy(&contents))?;
        secret.parse().map_err(Error::InvalidSecret)
    }

    /// Reads and decodes the configuration of the VCH running in `vm`.
    /// The secret is kept for re-encoding the configuration later.
    pub async fn get_vch_config(
        &mut self,
        vm: &VirtualMachine,
    ) -> Result<VchConfigSpec, Error> {
        let secret = self.guest_info_secret(vm).await?;
        let config = vm.fetch_extra_config(&self.ctx).await?;
        let spec = extraconfig::decode(&config, Some(&secret))?;
        self.secret = Some(secret);
        Ok(spec)
    }

    pub(crate) async fn secret_for(
        &mut self,
        vm: &VirtualMachine,
    ) -> Result<SecretKey, Error> {
        if let Some(secret) = &self.secret {
            return Ok(secret.clone());
        }
        let secret = self.guest_info_secret(vm).await?;
        self.secret = Some(secret.clone());
        Ok(secret)
    }

    /// Fails if the name `spec` asks for is already taken in the target
    /// pool, either by a VCH or by something else.
    pub async fn check_existence(
        &self,
        spec: &VchConfigSpec,
    ) -> Result<(), Error> {
        let name = spec.name();
        let parent =
            spec.compute_resources.last().ok_or(Error::NoComputeResource)?;

        let pool = self
            .child_named(parent, name, &[RESOURCE_POOL, VIRTUAL_APP])
            .await?;
        let container = pool.as_ref().map_or(parent, |p| &p.moref);
        let vm = self.child_named(container, name, &[VIRTUAL_MACHINE]).await?;
        let vm = match (vm, &pool) {
            (Some(vm), _) => vm,
            (None, Some(pool)) if pool.moref.kind == VIRTUAL_APP => {
                return Err(Error::VAppNotVch(name.to_string()));
            }
            (None, _) => return Ok(()),
        };

        info!(self.log, "appliance is found"; "vm" => %vm.moref);
        if self.is_vch(&self.vm(&vm.moref)).await? {
            Err(Error::ApplianceExists(name.to_string()))
        } else {
            Err(Error::NotAVch(name.to_string()))
        }
    }

    /// The appliance recorded in `spec`, if it still exists.
    pub(crate) async fn find_appliance_by_id(
        &self,
        spec: &VchConfigSpec,
    ) -> Result<Option<VirtualMachine>, Error> {
        let Ok(moref) = spec.executor.id.parse::<MoRef>() else {
            debug!(self.log, "appliance was never created";
                "id" => &spec.executor.id);
            return Ok(None);
        };
        match self.ctx.run(self.hv.vm_properties(&moref)).await {
            Ok(_) => Ok(Some(self.vm(&moref))),
            Err(err) if err.is_not_found() => {
                debug!(self.log, "appliance is not found"; "vm" => %moref);
                Ok(None)
            }
            Err(err) => {
                Err(err.context(format!("query appliance {moref}")).into())
            }
        }
    }

    /// The datastore of the first image store and that store's location.
    pub(crate) async fn image_datastore(
        &self,
        spec: &VchConfigSpec,
    ) -> Result<(DatastoreInfo, StoreUrl), Error> {
        let first = spec
            .image_stores
            .first()
            .ok_or(vch_common::config::SpecError::NoImageStores)?;
        let store: StoreUrl = first.parse()?;
        let ds = self
            .ctx
            .run(self.hv.datastore(&store.host))
            .await
            .map_err(|e| {
                e.context(format!("find image datastore {:?}", store.host))
            })?;
        Ok((ds, store))
    }
}

/// Finds the value of the secret key in the text of a `.vmx`, whose lines
/// read `key = "value"`.
fn extract_secret(vmx: &str) -> Result<String, Error> {
    for line in vmx.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if key.trim() == SECRET_KEY_VMX_KEY {
            let value = value.trim_matches(|c| c == '"' || c == ' ');
            return Ok(value.to_string());
        }
    }
    Err(Error::SecretKeyNotFound)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn secret_is_found_by_exact_key() {
        let vmx = format!(
            "displayName = \"vch1\"\n\
             {SECRET_KEY_VMX_KEY}.old = \"stale\"\n\
             {SECRET_KEY_VMX_KEY} = \"c2VjcmV0\"\n"
        );
        assert_eq!(extract_secret(&vmx).unwrap(), "c2VjcmV0");
        assert!(matches!(
            extract_secret("displayName = \"vch1\"\n"),
            Err(Error::SecretKeyNotFound)
        ));
    }
}
