// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Image and volume storage on datastores

use crate::delete::DeleteVolumeStores;
use crate::dispatcher::Dispatcher;
use crate::Error;
use camino::{Utf8Path, Utf8PathBuf};
use futures::future::join_all;
use slog::{debug, info, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use vch_common::backoff::{
    retry_notify, retry_policy_upload, BackoffError, UPLOAD_MAX_ATTEMPTS,
};
use vch_common::config::VchConfigSpec;
use vsphere_utils::datastore::{
    DatastorePath, StoreUrl, STORAGE_PARENT_DIR, VOLUMES_DIR,
};
use vsphere_utils::object::DatastoreInfo;
use vsphere_utils::{tasks, FaultKind};

/// Key/value stores the port layer keeps next to the images
const KV_STORES_DIR: &str = "kvStores";

fn image_name(file: &Utf8Path) -> &str {
    file.file_name().unwrap_or(file.as_str())
}

impl Dispatcher {
    /// Uploads `files` into `dir` concurrently, retrying each upload.
    pub(crate) async fn upload_images(
        &self,
        dir: &DatastorePath,
        files: &[Utf8PathBuf],
    ) -> Result<(), Error> {
        info!(self.log, "uploading images";
            "dir" => %dir, "count" => files.len());
        let uploads = files.iter().map(|file| self.upload_image(dir, file));
        let mut first_error = None;
        for result in join_all(uploads).await {
            match result {
                Ok(()) => (),
                Err(err) if self.force => {
                    warn!(self.log, "image upload failed, continuing";
                        "error" => %err);
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn upload_image(
        &self,
        dir: &DatastorePath,
        file: &Utf8Path,
    ) -> Result<(), Error> {
        let dest = dir.join(image_name(file));
        let attempts = AtomicUsize::new(0);
        let (attempts, dest_ref) = (&attempts, &dest);

        let upload = move || async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > 1 {
                // A failed upload can leave a partial file behind.
                let removed = self.ctx.run(self.hv.delete_file(dest_ref)).await;
                if let Err(err) = removed {
                    debug!(self.log, "no partial upload to remove";
                        "path" => %dest_ref, "error" => %err);
                }
            }
            match self.ctx.run(self.hv.upload_file(file, dest_ref)).await {
                Ok(()) => Ok(()),
                Err(err)
                    if attempt >= UPLOAD_MAX_ATTEMPTS
                        || err.is_not_found()
                        || self.ctx.is_done() =>
                {
                    Err(BackoffError::permanent(err))
                }
                Err(err) => Err(BackoffError::transient(err)),
            }
        };
        let notify = |err: vsphere_utils::Error, delay: Duration| {
            warn!(self.log, "upload failed, retrying";
                "file" => %file, "error" => %err, "delay" => ?delay);
        };
        retry_notify(retry_policy_upload(), upload, notify).await.map_err(
            |source| Error::Upload { file: file.to_string(), source },
        )?;
        info!(self.log, "uploaded image"; "file" => %file, "dest" => %dest);
        Ok(())
    }

    /// Creates the top-level directory of each datastore volume store.
    pub(crate) async fn create_volume_stores(
        &self,
        spec: &VchConfigSpec,
    ) -> Result<(), Error> {
        for (label, location) in &spec.volume_locations {
            let store: StoreUrl = location.parse()?;
            if !store.is_datastore() {
                continue;
            }
            let mut dir = store.datastore_path();
            if dir.is_root() {
                dir = dir.join(STORAGE_PARENT_DIR);
            }
            let created = tasks::wait(&self.ctx, &self.log, || {
                self.hv.make_directory(&dir)
            })
            .await;
            match created {
                Ok(()) => {
                    info!(self.log, "created volume store";
                        "label" => label, "path" => %dir);
                }
                Err(err) if err.is_fault(&FaultKind::FileAlreadyExists) => {
                    debug!(self.log, "volume store exists";
                        "label" => label, "path" => %dir);
                }
                Err(err) => {
                    let op = format!("create volume store {label:?} at {dir}");
                    return Err(err.context(op).into());
                }
            }
        }
        Ok(())
    }

    /// Removes `path` from `ds`.  A non-empty directory is left in place
    /// unless `force` is set; the return value says whether `path` is gone.
    pub(crate) async fn delete_datastore_files(
        &self,
        ds: &DatastoreInfo,
        path: &str,
        force: bool,
    ) -> Result<bool, Error> {
        if path.trim_matches('/').is_empty() {
            return Err(Error::EmptyDatastorePath(ds.name.clone()));
        }
        let dir = ds.path(path);
        let listed = self.ctx.run(self.hv.list_files(&dir, false)).await;
        let entries = match listed {
            Ok(entries) => entries,
            Err(err) if err.is_not_found() => {
                debug!(self.log, "nothing to remove"; "path" => %dir);
                return Ok(true);
            }
            Err(err) => return Err(err.context(format!("list {dir}")).into()),
        };
        if !entries.is_empty() && !force {
            info!(self.log, "folder is not empty, leaving it";
                "path" => %dir, "entries" => entries.len());
            return Ok(false);
        }

        if ds.kind.is_namespace_managed() {
            // Namespaces can only be removed once empty, deepest first.
            let mut all = self
                .ctx
                .run(self.hv.list_files(&dir, true))
                .await
                .map_err(|e| e.context(format!("list {dir}")))?;
            all.sort();
            all.reverse();
            for entry in &all {
                self.delete_file(entry).await?;
            }
        }
        self.delete_file(&dir).await?;
        info!(self.log, "removed datastore files"; "path" => %dir);
        Ok(true)
    }

    async fn delete_file(&self, path: &DatastorePath) -> Result<(), Error> {
        match tasks::wait(&self.ctx, &self.log, || self.hv.delete_file(path))
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.context(format!("delete {path}")).into()),
        }
    }

    /// Removes the images and key/value stores of every image store, and
    /// the store's own directory if that leaves it empty.
    pub(crate) async fn delete_images(
        &self,
        spec: &VchConfigSpec,
    ) -> Result<(), Error> {
        let mut errors = Vec::new();
        for location in &spec.image_stores {
            if let Err(err) = self.delete_image_store(location).await {
                warn!(self.log, "failed to remove image store";
                    "store" => location, "error" => %err);
                errors.push(format!("{location}: {err}"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Stores(errors.join("\n")))
        }
    }

    async fn delete_image_store(&self, location: &str) -> Result<(), Error> {
        let store: StoreUrl = location.parse()?;
        let ds = self.ctx.run(self.hv.datastore(&store.host)).await?;
        let base = DatastorePath::new(&ds.name, &store.path);
        for dir in [STORAGE_PARENT_DIR, KV_STORES_DIR] {
            self.delete_datastore_files(&ds, &base.join(dir).path, true)
                .await?;
        }
        if !base.is_root() {
            self.delete_datastore_files(&ds, &base.path, false).await?;
        }
        Ok(())
    }

    /// Removes the images uploaded by a failed upgrade, sparing any in
    /// `keep` that the restored appliance still uses.
    pub(crate) async fn delete_upgrade_images(
        &self,
        dir: &DatastorePath,
        files: &[Utf8PathBuf],
        keep: &[String],
    ) {
        for file in files {
            let path = dir.join(image_name(file));
            if keep.contains(&path.to_string()) {
                debug!(self.log, "image is in use, keeping it";
                    "path" => %path);
                continue;
            }
            info!(self.log, "removing upgrade image"; "path" => %path);
            if let Err(err) = self.delete_file(&path).await {
                warn!(self.log, "failed to remove upgrade image";
                    "path" => %path, "error" => %err);
            }
        }
    }

    /// Removes the VCH's volume stores when asked to; otherwise tells the
    /// operator which ones were left behind.
    pub(crate) async fn delete_volume_store_if_forced(
        &self,
        spec: &VchConfigSpec,
        volume_stores: DeleteVolumeStores,
    ) -> Result<(), Error> {
        let mut ds_stores = Vec::new();
        let mut nfs_stores = Vec::new();
        for (label, location) in &spec.volume_locations {
            let store: StoreUrl = location.parse()?;
            if store.is_datastore() {
                ds_stores.push((label, store));
            } else {
                nfs_stores.push((label, store));
            }
        }
        if ds_stores.is_empty() && nfs_stores.is_empty() {
            return Ok(());
        }

        if volume_stores == DeleteVolumeStores::None {
            warn!(self.log,
                "Since --force was not specified, the following volume stores \
                 will not be removed. Use the vSphere UI or supplied nfs \
                 targets to delete content you do not wish to keep.");
            for (label, store) in &ds_stores {
                warn!(self.log, "vSphere volume store";
                    "label" => *label, "location" => %store);
            }
            for (label, store) in &nfs_stores {
                warn!(self.log, "NFS volume store";
                    "label" => *label, "location" => %store);
            }
            return Ok(());
        }

        for (label, store) in &nfs_stores {
            warn!(self.log, "NFS volume stores cannot be removed, skipping";
                "label" => *label, "location" => %store);
        }
        let mut errors = Vec::new();
        for (label, store) in &ds_stores {
            let path = if store.path.is_empty()
                || store.path == STORAGE_PARENT_DIR
            {
                format!("{STORAGE_PARENT_DIR}/{VOLUMES_DIR}")
            } else {
                store.path.clone()
            };
            info!(self.log, "removing volume store";
                "label" => *label, "path" => &path);
            let lookup = self.ctx.run(self.hv.datastore(&store.host)).await;
            let removed = match lookup {
                Ok(ds) => self.delete_datastore_files(&ds, &path, true).await,
                Err(err) => Err(err.into()),
            };
            if let Err(err) = removed {
                warn!(self.log, "failed to remove volume store";
                    "label" => *label, "error" => %err);
                errors.push(format!("{label}: {err}"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Stores(errors.join("\n")))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use vch_test_utils::dev::{test_setup_log, LogContext};
    use vsphere_utils::fakes::{FakeHypervisor, Op, DATASTORE_NAME};
    use vsphere_utils::{Context, Fault, Hypervisor};

    fn setup(name: &str) -> (LogContext, Arc<FakeHypervisor>, Dispatcher) {
        let logctx = test_setup_log(name);
        let hv = Arc::new(FakeHypervisor::esx());
        let dispatcher = Dispatcher::new(
            hv.clone(),
            &logctx.log,
            false,
            Context::background(),
        );
        (logctx, hv, dispatcher)
    }

    fn ds_path(path: &str) -> DatastorePath {
        DatastorePath::new(DATASTORE_NAME, path)
    }

    #[tokio::test]
    async fn non_empty_folder_needs_force() {
        let (logctx, hv, dispatcher) =
            setup("non_empty_folder_needs_force");
        let ds = hv.datastore(DATASTORE_NAME).await.unwrap();
        hv.add_file(&ds_path("vch1/VIC/image.tar"), b"layer");

        assert!(matches!(
            dispatcher.delete_datastore_files(&ds, "", true).await,
            Err(Error::EmptyDatastorePath(_))
        ));
        assert!(dispatcher.delete_datastore_files(&ds, "missing", false)
            .await
            .unwrap());
        assert!(!dispatcher.delete_datastore_files(&ds, "vch1", false)
            .await
            .unwrap());
        assert!(hv.file_exists(&ds_path("vch1/VIC/image.tar")));
        assert!(dispatcher.delete_datastore_files(&ds, "vch1", true)
            .await
            .unwrap());
        assert!(!hv.file_exists(&ds_path("vch1")));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn image_store_parent_removed_when_empty() {
        let (logctx, hv, dispatcher) =
            setup("image_store_parent_removed_when_empty");
        hv.add_file(&ds_path("vch1/VIC/image.tar"), b"layer");
        hv.add_dir(&ds_path("vch1/kvStores"));
        hv.add_file(&ds_path("shared/VIC/image.tar"), b"layer");
        hv.add_file(&ds_path("shared/other.txt"), b"keep");

        let spec = VchConfigSpec {
            image_stores: vec![
                format!("ds://{DATASTORE_NAME}/vch1"),
                format!("ds://{DATASTORE_NAME}/shared"),
            ],
            ..Default::default()
        };
        dispatcher.delete_images(&spec).await.unwrap();
        assert!(!hv.file_exists(&ds_path("vch1")));
        assert!(!hv.file_exists(&ds_path("shared/VIC")));
        assert!(hv.file_exists(&ds_path("shared/other.txt")));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn volume_stores_kept_without_force() {
        let (logctx, hv, dispatcher) =
            setup("volume_stores_kept_without_force");
        let spec = VchConfigSpec {
            volume_locations: [
                ("default".to_string(), format!("ds://{DATASTORE_NAME}")),
                ("fast".to_string(), format!("ds://{DATASTORE_NAME}/fast")),
                ("shared".to_string(), "nfs://filer/export".to_string()),
            ]
            .into(),
            ..Default::default()
        };
        dispatcher.create_volume_stores(&spec).await.unwrap();
        // Creating them again is not an error.
        dispatcher.create_volume_stores(&spec).await.unwrap();
        assert!(hv.file_exists(&ds_path("VIC")));
        assert!(hv.file_exists(&ds_path("fast")));
        hv.add_file(&ds_path("VIC/volumes/data/disk.vmdk"), b"");
        hv.add_file(&ds_path("VIC/images/base.tar"), b"");

        dispatcher
            .delete_volume_store_if_forced(&spec, DeleteVolumeStores::None)
            .await
            .unwrap();
        assert!(hv.file_exists(&ds_path("VIC/volumes/data/disk.vmdk")));

        dispatcher
            .delete_volume_store_if_forced(&spec, DeleteVolumeStores::All)
            .await
            .unwrap();
        assert!(!hv.file_exists(&ds_path("VIC/volumes")));
        assert!(!hv.file_exists(&ds_path("fast")));
        assert!(hv.file_exists(&ds_path("VIC/images/base.tar")));
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn upload_is_retried() {
        let (logctx, hv, dispatcher) =
            setup("upload_is_retried");
        let dir = camino_tempfile::tempdir().unwrap();
        let iso = dir.path().join("appliance.iso");
        std::fs::write(&iso, b"iso").unwrap();
        hv.inject_fault(
            Op::UploadFile,
            Fault::vim(FaultKind::Other("HttpError".to_string()), "reset"),
            2,
        );

        dispatcher.upload_images(&ds_path("vch1"), &[iso]).await.unwrap();
        assert_eq!(hv.count(Op::UploadFile), 3);
        assert!(hv.file_exists(&ds_path("vch1/appliance.iso")));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn upgrade_images_spare_attached_iso() {
        let (logctx, hv, dispatcher) =
            setup("upgrade_images_spare_attached_iso");
        hv.add_file(&ds_path("vch1/appliance.iso"), b"old");
        hv.add_file(&ds_path("vch1/bootstrap.iso"), b"new");
        let files =
            [Utf8PathBuf::from("appliance.iso"), "bootstrap.iso".into()];
        let keep = [ds_path("vch1/appliance.iso").to_string()];
        dispatcher
            .delete_upgrade_images(&ds_path("vch1"), &files, &keep)
            .await;
        assert!(hv.file_exists(&ds_path("vch1/appliance.iso")));
        assert!(!hv.file_exists(&ds_path("vch1/bootstrap.iso")));
        logctx.cleanup_successful();
    }
}
