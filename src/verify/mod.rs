// This file is part of ktrust and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

//! Verification of server responses against the client's trusted root.
//!
//! [`Verifier::verify_entry_response`] never touches shared state. It returns
//! the candidate root inside [`VerifiedEntry`] and the caller decides when to
//! [`TrustedRoot::advance`].

pub mod trust;

use std::fs;
use std::io::{self, ErrorKind};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::crypto::{vrf_message, SignatureError, VrfError};
use crate::entry::{commitment, CommitmentError, Committed, Entry};
use crate::merkle::{self, Hash, ProofError};
use crate::service::{GetEntryResponse, SignedLogRoot, SignedMapRoot};

pub use trust::{DomainInfo, DomainTrustAnchors, TrustConfigError, TreeDescriptor};

/// Latest log checkpoint the client has verified.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedRoot {
    pub tree_size: u64,
    #[serde(with = "crate::codec::hex_array")]
    pub root_hash: Hash,
    pub timestamp_nanos: u64,
    #[serde(with = "crate::codec::hex_vec")]
    pub signature: Vec<u8>,
}

impl TrustedRoot {
    #[must_use]
    pub fn from_log_root(root: &SignedLogRoot) -> Self {
        Self {
            tree_size: root.tree_size,
            root_hash: root.root_hash,
            timestamp_nanos: root.timestamp_nanos,
            signature: root.signature.clone(),
        }
    }

    /// Moves to `candidate` if it is newer. Returns whether anything changed.
    ///
    /// A larger tree always wins. An equal tree only replaces the current root
    /// when the hash matches and the timestamp is newer.
    pub fn advance(&mut self, candidate: &TrustedRoot) -> bool {
        let newer = candidate.tree_size > self.tree_size
            || (candidate.tree_size == self.tree_size
                && candidate.root_hash == self.root_hash
                && candidate.timestamp_nanos > self.timestamp_nanos);
        if newer {
            *self = candidate.clone();
        }
        newer
    }

    /// Loads a saved root. A missing file yields the empty root.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        match fs::read(path.as_ref()) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|error| io::Error::new(ErrorKind::InvalidData, error)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(error) => Err(error),
        }
    }

    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// A response that passed every check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedEntry {
    pub index: Hash,
    pub leaf_value: Option<Vec<u8>>,
    pub committed: Option<Committed>,
    pub smr: SignedMapRoot,
    /// Root the caller may advance to.
    pub new_root: TrustedRoot,
}

impl VerifiedEntry {
    /// Opened profile bytes, `None` when the user has no committed profile.
    #[must_use]
    pub fn profile(&self) -> Option<&[u8]> {
        self.committed.as_ref().map(|c| c.data.as_slice())
    }

    pub fn entry(&self) -> Result<Option<Entry>, serde_json::Error> {
        Entry::from_leaf_value(self.leaf_value.as_deref())
    }
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("VRF proof rejected: {0}")]
    Vrf(#[source] VrfError),
    #[error("log root of size {got} is older than trusted size {trusted}")]
    StaleRoot { trusted: u64, got: u64 },
    #[error("log root of size {tree_size} differs from the trusted root of the same size")]
    ForkedRoot { tree_size: u64 },
    #[error("log root signature rejected: {0}")]
    LogRootSignature(#[source] SignatureError),
    #[error("log consistency proof from {old_size} to {new_size} rejected: {source}")]
    LogConsistency {
        old_size: u64,
        new_size: u64,
        #[source]
        source: ProofError,
    },
    #[error("map root signature rejected: {0}")]
    MapRootSignature(#[source] SignatureError),
    #[error("map revision {revision} is outside log of size {tree_size}")]
    MapRevisionOutOfRange { revision: u64, tree_size: u64 },
    #[error("map root inclusion in log rejected: {0}")]
    LogInclusion(#[source] ProofError),
    #[error("leaf index does not match the VRF output")]
    IndexMismatch,
    #[error("map inclusion proof rejected: {0}")]
    MapInclusion(#[source] ProofError),
    #[error("committed profile returned without a leaf")]
    CommittedWithoutLeaf,
    #[error("leaf value is not a valid entry: {0}")]
    LeafDecode(#[source] serde_json::Error),
    #[error("commitment check failed: {0}")]
    Commitment(#[source] CommitmentError),
}

/// Checks responses for one domain.
#[derive(Clone, Debug)]
pub struct Verifier {
    anchors: DomainTrustAnchors,
}

impl Verifier {
    pub fn new(anchors: DomainTrustAnchors) -> Self {
        Self { anchors }
    }

    #[must_use]
    pub fn anchors(&self) -> &DomainTrustAnchors {
        &self.anchors
    }

    /// Verifies a lookup for (`user_id`, `app_id`) against `trusted`.
    pub fn verify_entry_response(
        &self,
        user_id: &str,
        app_id: &str,
        trusted: &TrustedRoot,
        response: &GetEntryResponse,
    ) -> Result<VerifiedEntry, VerifyError> {
        let anchors = &self.anchors;
        let index = anchors
            .vrf()
            .proof_to_index(&vrf_message(user_id, app_id), &response.vrf_proof)
            .map_err(VerifyError::Vrf)?;

        let log_root = &response.log_root;
        if log_root.tree_size < trusted.tree_size {
            warn!(
                trusted = trusted.tree_size,
                got = log_root.tree_size,
                "rejecting regressed log root"
            );
            return Err(VerifyError::StaleRoot {
                trusted: trusted.tree_size,
                got: log_root.tree_size,
            });
        }
        if trusted.tree_size > 0
            && log_root.tree_size == trusted.tree_size
            && log_root.root_hash != trusted.root_hash
        {
            warn!(tree_size = trusted.tree_size, "log root fork detected");
            return Err(VerifyError::ForkedRoot {
                tree_size: trusted.tree_size,
            });
        }

        anchors
            .signature_verifier()
            .verify(
                anchors.log_public_key(),
                &log_root.signing_bytes(),
                &log_root.signature,
            )
            .map_err(VerifyError::LogRootSignature)?;

        // Equal sizes were settled by the fork check above.
        if trusted.tree_size > 0 && log_root.tree_size > trusted.tree_size {
            merkle::verify_consistency(
                anchors.log_hasher(),
                trusted.tree_size,
                log_root.tree_size,
                &trusted.root_hash,
                &log_root.root_hash,
                &response.log_consistency,
            )
            .map_err(|source| VerifyError::LogConsistency {
                old_size: trusted.tree_size,
                new_size: log_root.tree_size,
                source,
            })?;
        }

        let smr = &response.smr;
        anchors
            .signature_verifier()
            .verify(anchors.map_public_key(), &smr.signing_bytes(), &smr.signature)
            .map_err(VerifyError::MapRootSignature)?;

        if smr.revision >= log_root.tree_size {
            return Err(VerifyError::MapRevisionOutOfRange {
                revision: smr.revision,
                tree_size: log_root.tree_size,
            });
        }
        let smr_leaf = anchors.log_hasher().hash_leaf(&smr.log_leaf_data());
        merkle::verify_inclusion(
            anchors.log_hasher(),
            smr.revision,
            log_root.tree_size,
            &smr_leaf,
            &response.log_inclusion,
            &log_root.root_hash,
        )
        .map_err(VerifyError::LogInclusion)?;

        let leaf = &response.leaf_proof.leaf;
        if leaf.index != index {
            return Err(VerifyError::IndexMismatch);
        }
        merkle::verify_map_inclusion(
            anchors.map_hasher(),
            &index,
            leaf.leaf_value.as_deref(),
            &response.leaf_proof.inclusion,
            &smr.root_hash,
        )
        .map_err(VerifyError::MapInclusion)?;

        if let Some(committed) = &response.committed {
            let entry = Entry::from_leaf_value(leaf.leaf_value.as_deref())
                .map_err(VerifyError::LeafDecode)?
                .ok_or(VerifyError::CommittedWithoutLeaf)?;
            commitment::verify(user_id, app_id, &entry.commitment, committed)
                .map_err(VerifyError::Commitment)?;
        }

        Ok(VerifiedEntry {
            index,
            leaf_value: leaf.leaf_value.clone(),
            committed: response.committed.clone(),
            smr: smr.clone(),
            new_root: TrustedRoot::from_log_root(log_root),
        })
    }
}
