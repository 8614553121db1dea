// This file is part of ktrust and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

//! File-backed registry of directory domains with soft delete.

use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

const RECORD_EXTENSION: &str = "json";

/// Operator-side record of one domain.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub domain_id: String,
    pub map_id: i64,
    pub log_id: i64,
    #[serde(with = "crate::codec::hex_vec")]
    pub vrf_public_key: Vec<u8>,
    #[serde(with = "crate::codec::hex_vec")]
    pub vrf_private_key: Vec<u8>,
    pub min_interval: Duration,
    pub max_interval: Duration,
    #[serde(default)]
    pub deleted: bool,
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("domain_id", &self.domain_id)
            .field("map_id", &self.map_id)
            .field("log_id", &self.log_id)
            .field("vrf_public_key", &hex::encode(&self.vrf_public_key))
            .field("vrf_private_key", &"<redacted>")
            .field("min_interval", &self.min_interval)
            .field("max_interval", &self.max_interval)
            .field("deleted", &self.deleted)
            .finish()
    }
}

/// Errors produced while reading or writing domain records.
#[derive(Debug, Error)]
pub enum DomainStoreError {
    #[error("invalid domain identifier {domain_id:?}")]
    InvalidId { domain_id: String },
    #[error("domain {domain_id} already exists")]
    Duplicate { domain_id: String },
    #[error("domain {domain_id} not found")]
    NotFound { domain_id: String },
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: Arc<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write domain record {path}: {source}")]
    Write {
        path: Arc<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read domain record {path}: {source}")]
    Read {
        path: Arc<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read directory {path}: {source}")]
    ReadDir {
        path: Arc<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode domain record: {message}")]
    Encode { message: String },
    #[error("failed to decode domain record {path}: {error}")]
    Decode { path: Arc<PathBuf>, error: String },
}

/// One JSON file per domain under `root`.
#[derive(Clone, Debug)]
pub struct DomainStore {
    root: PathBuf,
}

impl DomainStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, DomainStoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|source| DomainStoreError::CreateDir {
            path: Arc::new(root.clone()),
            source,
        })?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stores a new domain. Existing identifiers, deleted or not, are refused.
    ///
    /// The record is staged in a temporary file and linked into place, so a
    /// failed write never leaves a partial record behind.
    pub fn write(&self, domain: &Domain) -> Result<(), DomainStoreError> {
        let path = self.record_path(&domain.domain_id)?;
        let bytes = encode(domain)?;
        let tmp = path.with_extension("tmp");
        let path_arc = Arc::new(path.clone());

        let staged = fs::File::create(&tmp).and_then(|mut handle| {
            handle.write_all(&bytes)?;
            handle.sync_all()
        });
        // Linking refuses to replace an existing record.
        let linked = staged.and_then(|()| fs::hard_link(&tmp, &path));
        if let Err(err) = fs::remove_file(&tmp) {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %err, "failed to remove staged domain record");
            }
        }
        linked.map_err(|source| {
            if source.kind() == ErrorKind::AlreadyExists {
                DomainStoreError::Duplicate {
                    domain_id: domain.domain_id.clone(),
                }
            } else {
                DomainStoreError::Write {
                    path: path_arc,
                    source,
                }
            }
        })?;
        info!(domain_id = %domain.domain_id, "domain created");
        Ok(())
    }

    pub fn read(&self, domain_id: &str, show_deleted: bool) -> Result<Domain, DomainStoreError> {
        let path = self.record_path(domain_id)?;
        let domain = read_record(&path).map_err(|err| match err {
            DomainStoreError::Read { source, .. } if source.kind() == ErrorKind::NotFound => {
                DomainStoreError::NotFound {
                    domain_id: domain_id.to_owned(),
                }
            }
            other => other,
        })?;
        if domain.deleted && !show_deleted {
            return Err(DomainStoreError::NotFound {
                domain_id: domain_id.to_owned(),
            });
        }
        Ok(domain)
    }

    /// All domains sorted by identifier.
    pub fn list(&self, show_deleted: bool) -> Result<Vec<Domain>, DomainStoreError> {
        let read_dir_err = |source| DomainStoreError::ReadDir {
            path: Arc::new(self.root.clone()),
            source,
        };
        let mut domains = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(read_dir_err)? {
            let path = entry.map_err(read_dir_err)?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let domain = read_record(&path)?;
            if show_deleted || !domain.deleted {
                domains.push(domain);
            }
        }
        domains.sort_by(|a, b| a.domain_id.cmp(&b.domain_id));
        Ok(domains)
    }

    /// Marks a domain deleted or restores it.
    pub fn set_delete(&self, domain_id: &str, deleted: bool) -> Result<(), DomainStoreError> {
        let mut domain = self.read(domain_id, true)?;
        domain.deleted = deleted;
        let path = self.record_path(domain_id)?;
        let bytes = encode(&domain)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)
            .and_then(|()| fs::rename(&tmp, &path))
            .map_err(|source| DomainStoreError::Write {
                path: Arc::new(path.clone()),
                source,
            })?;
        info!(domain_id, deleted, "domain deletion flag updated");
        Ok(())
    }

    fn record_path(&self, domain_id: &str) -> Result<PathBuf, DomainStoreError> {
        let valid = !domain_id.is_empty()
            && domain_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(DomainStoreError::InvalidId {
                domain_id: domain_id.to_owned(),
            });
        }
        Ok(self
            .root
            .join(format!("{domain_id}.{RECORD_EXTENSION}")))
    }
}

fn encode(domain: &Domain) -> Result<Vec<u8>, DomainStoreError> {
    serde_json::to_vec_pretty(domain).map_err(|err| DomainStoreError::Encode {
        message: err.to_string(),
    })
}

fn read_record(path: &Path) -> Result<Domain, DomainStoreError> {
    let path_buf = Arc::new(path.to_path_buf());
    let bytes = fs::read(path).map_err(|source| DomainStoreError::Read {
        path: path_buf.clone(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|err| DomainStoreError::Decode {
        path: path_buf,
        error: err.to_string(),
    })
}
