// This file is part of ktrust and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

//! Key-binding records and the machinery that moves them from one version to the next.

pub mod commitment;
pub mod mutation;
pub mod mutator;
pub mod objecthash;
pub mod policy;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{PublicKey, SignatureError};
use crate::merkle::Hash;

pub use commitment::{CommitmentError, NONCE_LEN};
pub use mutation::{Draft, Mutation, SignedMutation, Staged};
pub use mutator::{Mutator, MAX_MUTATION_SIZE};
pub use policy::{AuthorizationPolicy, PolicyError, PreviousKeyPolicy};

/// A user's key-binding record as stored in the map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    #[serde(with = "crate::codec::hex_array")]
    pub index: Hash,
    #[serde(with = "crate::codec::hex_vec", default)]
    pub commitment: Vec<u8>,
    #[serde(default)]
    pub authorized_keys: BTreeSet<PublicKey>,
    /// Canonical hash of the entry this one replaces.
    #[serde(with = "crate::codec::hex_array")]
    pub previous: Hash,
    #[serde(
        with = "crate::codec::hex_map",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub signatures: BTreeMap<String, Vec<u8>>,
}

impl Entry {
    /// Decodes a map leaf. A missing or empty leaf means no entry exists yet.
    pub fn from_leaf_value(value: Option<&[u8]>) -> Result<Option<Self>, serde_json::Error> {
        match value {
            None => Ok(None),
            Some(bytes) if bytes.is_empty() => Ok(None),
            Some(bytes) => serde_json::from_slice(bytes).map(Some),
        }
    }

    pub fn to_leaf_value(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Canonical hash over every field, signatures included when present.
    #[must_use]
    pub fn canonical_hash(&self) -> Hash {
        objecthash::hash_entry(Some(self))
    }

    /// Digest that signers sign: the canonical hash with signatures stripped.
    #[must_use]
    pub fn signing_digest(&self) -> Hash {
        if self.signatures.is_empty() {
            return self.canonical_hash();
        }
        let mut unsigned = self.clone();
        unsigned.signatures.clear();
        unsigned.canonical_hash()
    }
}

/// Opening of an entry's commitment, sent beside the entry and never inside it.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Committed {
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

impl fmt::Debug for Committed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Committed")
            .field("key_len", &self.key.len())
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Signed entry plus the commitment opening the server stores alongside it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryUpdate {
    pub mutation: Entry,
    pub committed: Committed,
}

/// Failures while building or applying a mutation.
#[derive(Debug, Error)]
pub enum MutationError {
    #[error("authorized key set must not be empty")]
    MissingKey,
    #[error("mutation rejected by authorization policy: {0}")]
    Unauthorized(#[from] PolicyError),
    #[error("previous hash does not match the current entry")]
    PreviousHashMismatch,
    #[error("mutation is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("failed to commit to profile data: {0}")]
    Commitment(#[from] CommitmentError),
    #[error("signer {key_id} failed: {source}")]
    Signing {
        key_id: String,
        #[source]
        source: SignatureError,
    },
    #[error("failed to decode entry: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode entry: {0}")]
    Encode(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Entry {
        Entry {
            index: [1u8; 32],
            commitment: vec![2u8; 32],
            authorized_keys: [PublicKey::new(vec![3u8; 4])].into_iter().collect(),
            previous: [4u8; 32],
            signatures: BTreeMap::new(),
        }
    }

    #[test]
    fn absent_or_empty_leaf_is_no_entry() {
        assert!(Entry::from_leaf_value(None).expect("none").is_none());
        assert!(Entry::from_leaf_value(Some(&[][..])).expect("empty").is_none());
        assert!(Entry::from_leaf_value(Some(&b"{oops"[..])).is_err());
    }

    #[test]
    fn leaf_value_decodes_back_to_same_entry() {
        let entry = sample();
        let bytes = entry.to_leaf_value().expect("encode");
        let decoded = Entry::from_leaf_value(Some(bytes.as_slice()))
            .expect("decode")
            .expect("present");
        assert_eq!(decoded, entry);
    }

    #[test]
    fn field_order_in_json_does_not_matter() {
        let entry = sample();
        let forward = format!(
            r#"{{"index":"{}","commitment":"{}","authorized_keys":[{{"bytes":"03030303"}}],"previous":"{}"}}"#,
            hex::encode(entry.index),
            hex::encode(&entry.commitment),
            hex::encode(entry.previous)
        );
        let reversed = format!(
            r#"{{"previous":"{}","authorized_keys":[{{"bytes":"03030303"}}],"commitment":"{}","index":"{}"}}"#,
            hex::encode(entry.previous),
            hex::encode(&entry.commitment),
            hex::encode(entry.index)
        );
        let a = Entry::from_leaf_value(Some(forward.as_bytes()))
            .expect("forward")
            .expect("present");
        let b = Entry::from_leaf_value(Some(reversed.as_bytes()))
            .expect("reversed")
            .expect("present");
        assert_eq!(a, b);
        assert_eq!(a.canonical_hash(), b.canonical_hash());
    }

    #[test]
    fn signing_digest_ignores_signatures() {
        let unsigned = sample();
        let mut signed = unsigned.clone();
        signed.signatures.insert("abcd".into(), vec![9, 9]);
        assert_eq!(unsigned.signing_digest(), signed.signing_digest());
        assert_ne!(unsigned.canonical_hash(), signed.canonical_hash());
    }

    #[test]
    fn committed_debug_hides_contents() {
        let committed = Committed {
            key: vec![0xaa; 16],
            data: b"secret profile".to_vec(),
        };
        let rendered = format!("{committed:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("data_len"));
    }
}
