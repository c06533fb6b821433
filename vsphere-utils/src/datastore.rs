// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Datastore paths
//!
//! Files on a datastore are named `[<datastore>] <path>`.  Configuration
//! carries the same location as a URL, `ds://<datastore>/<path>`.

use crate::Error;
use std::fmt;
use std::str::FromStr;

pub const DS_SCHEME: &str = "ds";
pub const NFS_SCHEME: &str = "nfs";

/// Top-level directory holding container images and volumes
pub const STORAGE_PARENT_DIR: &str = "VIC";
pub const VOLUMES_DIR: &str = "volumes";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatastorePath {
    pub datastore: String,
    pub path: String,
}

impl DatastorePath {
    pub fn new(datastore: &str, path: &str) -> Self {
        DatastorePath {
            datastore: datastore.to_string(),
            path: path.trim_matches('/').to_string(),
        }
    }

    pub fn join(&self, segment: &str) -> Self {
        let segment = segment.trim_matches('/');
        let path = match (self.path.is_empty(), segment.is_empty()) {
            (true, _) => segment.to_string(),
            (false, true) => self.path.clone(),
            (false, false) => format!("{}/{}", self.path, segment),
        };
        DatastorePath { datastore: self.datastore.clone(), path }
    }

    /// The containing directory; the datastore root is its own parent.
    pub fn parent(&self) -> Self {
        let path = match self.path.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => String::new(),
        };
        DatastorePath { datastore: self.datastore.clone(), path }
    }

    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    /// Whether `other` lies beneath (or is) this path.
    pub fn contains(&self, other: &DatastorePath) -> bool {
        self.datastore == other.datastore
            && (self.path.is_empty()
                || other.path == self.path
                || other.path.starts_with(&format!("{}/", self.path)))
    }
}

impl fmt::Display for DatastorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "[{}]", self.datastore)
        } else {
            write!(f, "[{}] {}", self.datastore, self.path)
        }
    }
}

impl FromStr for DatastorePath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let invalid = || Error::DatastorePath(s.to_string());
        let rest = s.trim().strip_prefix('[').ok_or_else(invalid)?;
        let (datastore, path) = rest.split_once(']').ok_or_else(invalid)?;
        if datastore.is_empty() {
            return Err(invalid());
        }
        Ok(DatastorePath::new(datastore, path.trim()))
    }
}

/// A storage location from configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreUrl {
    pub scheme: String,
    pub host: String,
    pub path: String,
}

impl StoreUrl {
    pub fn is_datastore(&self) -> bool {
        self.scheme == DS_SCHEME
    }

    pub fn datastore_path(&self) -> DatastorePath {
        DatastorePath::new(&self.host, &self.path)
    }
}

impl fmt::Display for StoreUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)?;
        if !self.path.is_empty() {
            write!(f, "/{}", self.path)?;
        }
        Ok(())
    }
}

impl FromStr for StoreUrl {
    type Err = Error;

    /// Accepts `scheme://host/path` and, for datastores, the bare
    /// `host/path` form operators type on the command line.
    fn from_str(s: &str) -> Result<Self, Error> {
        let (scheme, rest) = match s.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => (DS_SCHEME, s),
        };
        let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
        if host.is_empty() {
            return Err(Error::DatastorePath(s.to_string()));
        }
        Ok(StoreUrl {
            scheme: scheme.to_string(),
            host: host.to_string(),
            path: path.trim_matches('/').to_string(),
        })
    }
}
