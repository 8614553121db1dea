// This file is part of ktrust and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Hash strategies and proof checks for the append-only log and the sparse map.
//!
//! The log follows RFC 6962 (leaf prefix `0x00`, node prefix `0x01`). The map
//! is a 256-level sparse Merkle tree addressed by the VRF index, where every
//! empty subtree of a given height has a fixed hash.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Output size of every hash strategy in this crate.
pub const HASH_LEN: usize = 32;
/// Number of levels in the sparse map.
pub const MAP_DEPTH: usize = 256;

pub type Hash = [u8; HASH_LEN];

/// Reasons a Merkle proof failed to check out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProofError {
    #[error("leaf index {index} is outside a tree of size {tree_size}")]
    IndexOutOfRange { index: u64, tree_size: u64 },
    #[error("tree size regressed from {old_size} to {new_size}")]
    SizeRegression { old_size: u64, new_size: u64 },
    #[error("proof has {got} elements, expected {expected}")]
    UnexpectedLength { expected: usize, got: usize },
    #[error("proof has too many elements")]
    TooLong,
    #[error("proof has too few elements")]
    TooShort,
    #[error("calculated root does not match the expected root")]
    RootMismatch,
}

pub(crate) fn sha256(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Hashing rules for the append-only log.
pub trait LogHasher: Send + Sync {
    fn empty_root(&self) -> Hash;
    fn hash_leaf(&self, leaf: &[u8]) -> Hash;
    fn hash_children(&self, left: &Hash, right: &Hash) -> Hash;
}

/// RFC 6962 hashing with SHA-256.
#[derive(Clone, Copy, Debug, Default)]
pub struct Rfc6962Sha256;

impl LogHasher for Rfc6962Sha256 {
    fn empty_root(&self) -> Hash {
        sha256(&[])
    }

    fn hash_leaf(&self, leaf: &[u8]) -> Hash {
        sha256(&[&[0x00], leaf])
    }

    fn hash_children(&self, left: &Hash, right: &Hash) -> Hash {
        sha256(&[&[0x01], left, right])
    }
}

/// Verifies that `leaf_hash` sits at `leaf_index` in a tree of `tree_size` leaves.
pub fn verify_inclusion(
    hasher: &dyn LogHasher,
    leaf_index: u64,
    tree_size: u64,
    leaf_hash: &Hash,
    proof: &[Hash],
    root: &Hash,
) -> Result<(), ProofError> {
    if leaf_index >= tree_size {
        return Err(ProofError::IndexOutOfRange {
            index: leaf_index,
            tree_size,
        });
    }

    let mut node = leaf_index;
    let mut last_node = tree_size - 1;
    let mut hash = *leaf_hash;
    for sibling in proof {
        if last_node == 0 {
            return Err(ProofError::TooLong);
        }
        if node & 1 == 1 || node == last_node {
            hash = hasher.hash_children(sibling, &hash);
            while node & 1 == 0 && node != 0 {
                node >>= 1;
                last_node >>= 1;
            }
        } else {
            hash = hasher.hash_children(&hash, sibling);
        }
        node >>= 1;
        last_node >>= 1;
    }

    if last_node != 0 {
        return Err(ProofError::TooShort);
    }
    if hash != *root {
        return Err(ProofError::RootMismatch);
    }
    Ok(())
}

/// Verifies that the tree of `new_size` leaves is an extension of the one of `old_size`.
pub fn verify_consistency(
    hasher: &dyn LogHasher,
    old_size: u64,
    new_size: u64,
    old_root: &Hash,
    new_root: &Hash,
    proof: &[Hash],
) -> Result<(), ProofError> {
    if old_size > new_size {
        return Err(ProofError::SizeRegression { old_size, new_size });
    }
    if old_size == new_size || old_size == 0 {
        if !proof.is_empty() {
            return Err(ProofError::UnexpectedLength {
                expected: 0,
                got: proof.len(),
            });
        }
        if old_size == new_size && old_root != new_root {
            return Err(ProofError::RootMismatch);
        }
        return Ok(());
    }
    if proof.is_empty() {
        return Err(ProofError::TooShort);
    }

    let mut path = Vec::with_capacity(proof.len() + 1);
    if old_size.is_power_of_two() {
        path.push(*old_root);
    }
    path.extend_from_slice(proof);

    let mut node = old_size - 1;
    let mut last_node = new_size - 1;
    while node & 1 == 1 {
        node >>= 1;
        last_node >>= 1;
    }

    let mut old_hash = path[0];
    let mut new_hash = path[0];
    for sibling in &path[1..] {
        if last_node == 0 {
            return Err(ProofError::TooLong);
        }
        if node & 1 == 1 || node == last_node {
            old_hash = hasher.hash_children(sibling, &old_hash);
            new_hash = hasher.hash_children(sibling, &new_hash);
            while node & 1 == 0 && node != 0 {
                node >>= 1;
                last_node >>= 1;
            }
        } else {
            new_hash = hasher.hash_children(&new_hash, sibling);
        }
        node >>= 1;
        last_node >>= 1;
    }

    if last_node != 0 {
        return Err(ProofError::TooShort);
    }
    if old_hash != *old_root || new_hash != *new_root {
        return Err(ProofError::RootMismatch);
    }
    Ok(())
}

/// Hashing rules for the sparse map.
pub trait MapHasher: Send + Sync {
    /// Hash of an empty subtree whose root sits `height` levels above the leaves.
    fn hash_empty(&self, height: usize) -> Hash;
    fn hash_leaf(&self, index: &Hash, value: &[u8]) -> Hash;
    fn hash_children(&self, left: &Hash, right: &Hash) -> Hash;
}

/// SHA-256 sparse map hasher with precomputed empty subtrees.
#[derive(Clone, Debug)]
pub struct SparseSha256 {
    empty: Vec<Hash>,
}

impl SparseSha256 {
    pub fn new() -> Self {
        let mut empty = Vec::with_capacity(MAP_DEPTH + 1);
        let mut current = sha256(&[&[0x02]]);
        empty.push(current);
        for _ in 0..MAP_DEPTH {
            current = sha256(&[&[0x01], &current, &current]);
            empty.push(current);
        }
        Self { empty }
    }
}

impl Default for SparseSha256 {
    fn default() -> Self {
        Self::new()
    }
}

impl MapHasher for SparseSha256 {
    fn hash_empty(&self, height: usize) -> Hash {
        self.empty[height.min(MAP_DEPTH)]
    }

    fn hash_leaf(&self, index: &Hash, value: &[u8]) -> Hash {
        sha256(&[&[0x00], index, value])
    }

    fn hash_children(&self, left: &Hash, right: &Hash) -> Hash {
        sha256(&[&[0x01], left, right])
    }
}

/// Bit of `index` that selects the branch taken at `depth` below the root.
pub fn index_bit(index: &Hash, depth: usize) -> bool {
    (index[depth / 8] >> (7 - depth % 8)) & 1 == 1
}

/// Verifies inclusion (`Some(value)`) or absence (`None`) of the leaf at `index`.
///
/// `proof` lists one sibling per level starting at the leaves; `None` stands
/// for an empty subtree.
pub fn verify_map_inclusion(
    hasher: &dyn MapHasher,
    index: &Hash,
    value: Option<&[u8]>,
    proof: &[Option<Hash>],
    root: &Hash,
) -> Result<(), ProofError> {
    if proof.len() != MAP_DEPTH {
        return Err(ProofError::UnexpectedLength {
            expected: MAP_DEPTH,
            got: proof.len(),
        });
    }

    let mut hash = match value {
        Some(value) => hasher.hash_leaf(index, value),
        None => hasher.hash_empty(0),
    };
    for (height, sibling) in proof.iter().enumerate() {
        let sibling = sibling.unwrap_or_else(|| hasher.hash_empty(height));
        hash = if index_bit(index, MAP_DEPTH - 1 - height) {
            hasher.hash_children(&sibling, &hash)
        } else {
            hasher.hash_children(&hash, &sibling)
        };
    }

    if hash != *root {
        return Err(ProofError::RootMismatch);
    }
    Ok(())
}
