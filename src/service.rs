// This file is part of ktrust and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

//! Request and response shapes of the key server, and the transport seam.

use async_trait::async_trait;

use crate::entry::{Committed, EntryUpdate};
use crate::merkle::Hash;

type AnyResult<T> = anyhow::Result<T>;

const LOG_ROOT_CONTEXT: &[u8] = b"KTRUST_LOG_ROOT_V1";
const MAP_ROOT_CONTEXT: &[u8] = b"KTRUST_MAP_ROOT_V1";

/// Checkpoint of the append-only log of map roots, signed by the log operator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignedLogRoot {
    pub tree_size: u64,
    pub root_hash: Hash,
    pub timestamp_nanos: u64,
    pub signature: Vec<u8>,
}

impl SignedLogRoot {
    /// Bytes covered by `signature`.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LOG_ROOT_CONTEXT.len() + 48);
        out.extend_from_slice(LOG_ROOT_CONTEXT);
        out.extend_from_slice(&self.tree_size.to_be_bytes());
        out.extend_from_slice(&self.root_hash);
        out.extend_from_slice(&self.timestamp_nanos.to_be_bytes());
        out
    }
}

/// Root of one map revision, signed by the map operator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignedMapRoot {
    pub revision: u64,
    pub root_hash: Hash,
    pub timestamp_nanos: u64,
    pub signature: Vec<u8>,
}

impl SignedMapRoot {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAP_ROOT_CONTEXT.len() + 48);
        out.extend_from_slice(MAP_ROOT_CONTEXT);
        out.extend_from_slice(&self.revision.to_be_bytes());
        out.extend_from_slice(&self.root_hash);
        out.extend_from_slice(&self.timestamp_nanos.to_be_bytes());
        out
    }

    /// Leaf data under which this root is appended to the log.
    pub fn log_leaf_data(&self) -> Vec<u8> {
        let mut out = self.signing_bytes();
        out.extend_from_slice(&self.signature);
        out
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MapLeaf {
    pub index: Hash,
    /// Encoded entry, `None` when nothing is stored at `index`.
    pub leaf_value: Option<Vec<u8>>,
}

/// A map leaf and its siblings from the leaf level up, `None` marking empty subtrees.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MapLeafInclusion {
    pub leaf: MapLeaf,
    pub inclusion: Vec<Option<Hash>>,
}

/// Everything a client needs to check a single (user, app) lookup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GetEntryResponse {
    pub vrf_proof: Vec<u8>,
    pub committed: Option<Committed>,
    pub leaf_proof: MapLeafInclusion,
    pub smr: SignedMapRoot,
    pub log_root: SignedLogRoot,
    /// Consistency proof from the requested `first_tree_size` to `log_root`.
    pub log_consistency: Vec<Hash>,
    /// Inclusion proof of `smr` at position `smr.revision` in `log_root`.
    pub log_inclusion: Vec<Hash>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetEntryRequest {
    pub domain_id: String,
    pub user_id: String,
    pub app_id: String,
    pub first_tree_size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListEntryHistoryRequest {
    pub domain_id: String,
    pub user_id: String,
    pub app_id: String,
    pub first_tree_size: u64,
    pub start: u64,
    pub page_size: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListEntryHistoryResponse {
    pub values: Vec<GetEntryResponse>,
    /// Revision to continue from, `0` once there is nothing left.
    pub next_start: u64,
}

/// A signed mutation ready to be sent. Resubmissions reuse it unchanged
/// apart from `first_tree_size`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateEntryRequest {
    pub domain_id: String,
    pub user_id: String,
    pub app_id: String,
    pub first_tree_size: u64,
    pub entry_update: EntryUpdate,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateEntryResponse {
    pub proof: GetEntryResponse,
}

/// Remote key server. Implementations own dispatch and connection handling.
#[async_trait]
pub trait KeyServer: Send + Sync + 'static {
    async fn get_entry(&self, request: GetEntryRequest) -> AnyResult<GetEntryResponse>;
    async fn list_entry_history(
        &self,
        request: ListEntryHistoryRequest,
    ) -> AnyResult<ListEntryHistoryResponse>;
    async fn update_entry(&self, request: UpdateEntryRequest) -> AnyResult<UpdateEntryResponse>;
}
