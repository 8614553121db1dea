// This file is part of ktrust and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! In-process key server that signs real roots and produces real proofs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use blstrs::Scalar;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::crypto::{vrf_message, BlsSigner, BlsVerifier, BlsVrfSigner, PublicKey, Signer};
use crate::entry::commitment::{commit, generate_nonce};
use crate::entry::objecthash::hash_entry;
use crate::entry::{Committed, Entry, Mutator, PreviousKeyPolicy};
use crate::merkle::{index_bit, Hash, LogHasher, MapHasher, Rfc6962Sha256, SparseSha256, MAP_DEPTH};
use crate::service::{
    GetEntryRequest, GetEntryResponse, KeyServer, ListEntryHistoryRequest,
    ListEntryHistoryResponse, MapLeaf, MapLeafInclusion, SignedLogRoot, SignedMapRoot,
    UpdateEntryRequest, UpdateEntryResponse,
};
use crate::verify::trust::{LOG_STRATEGY_RFC6962_SHA256, MAP_STRATEGY_SPARSE_SHA256};
use crate::verify::{DomainInfo, TreeDescriptor};

/// Operator keys of a test domain and the descriptor clients receive.
pub struct TestDomain {
    log_signer: BlsSigner,
    map_signer: BlsSigner,
    vrf: BlsVrfSigner,
    pub info: DomainInfo,
}

impl TestDomain {
    pub fn new(domain_id: &str) -> Self {
        let log_signer = BlsSigner::from_scalar(Scalar::from(1001u64));
        let map_signer = BlsSigner::from_scalar(Scalar::from(1002u64));
        let vrf = BlsVrfSigner::from_scalar(Scalar::from(1003u64));
        let info = DomainInfo {
            domain_id: domain_id.to_owned(),
            log: TreeDescriptor {
                hash_strategy: LOG_STRATEGY_RFC6962_SHA256.to_owned(),
                public_key: hex::encode(&log_signer.public_key().bytes),
            },
            map: TreeDescriptor {
                hash_strategy: MAP_STRATEGY_SPARSE_SHA256.to_owned(),
                public_key: hex::encode(&map_signer.public_key().bytes),
            },
            vrf_public_key: hex::encode(vrf.public_key_bytes()),
        };
        Self {
            log_signer,
            map_signer,
            vrf,
            info,
        }
    }

    pub fn log_public_key(&self) -> PublicKey {
        self.log_signer.public_key()
    }

    pub fn map_public_key(&self) -> PublicKey {
        self.map_signer.public_key()
    }

    /// VRF index and proof for a user.
    pub fn index(&self, user_id: &str, app_id: &str) -> (Hash, Vec<u8>) {
        self.vrf.evaluate(&vrf_message(user_id, app_id))
    }
}

fn split_point(n: usize) -> usize {
    let mut k = 1;
    while k << 1 < n {
        k <<= 1;
    }
    k
}

/// RFC 6962 tree head over already hashed leaves.
pub fn log_root(hasher: &dyn LogHasher, leaves: &[Hash]) -> Hash {
    match leaves.len() {
        0 => hasher.empty_root(),
        1 => leaves[0],
        n => {
            let k = split_point(n);
            hasher.hash_children(&log_root(hasher, &leaves[..k]), &log_root(hasher, &leaves[k..]))
        }
    }
}

pub fn log_inclusion_proof(hasher: &dyn LogHasher, index: usize, leaves: &[Hash]) -> Vec<Hash> {
    let n = leaves.len();
    if n <= 1 {
        return Vec::new();
    }
    let k = split_point(n);
    if index < k {
        let mut proof = log_inclusion_proof(hasher, index, &leaves[..k]);
        proof.push(log_root(hasher, &leaves[k..]));
        proof
    } else {
        let mut proof = log_inclusion_proof(hasher, index - k, &leaves[k..]);
        proof.push(log_root(hasher, &leaves[..k]));
        proof
    }
}

pub fn log_consistency_proof(hasher: &dyn LogHasher, old_size: usize, leaves: &[Hash]) -> Vec<Hash> {
    if old_size == 0 || old_size >= leaves.len() {
        return Vec::new();
    }
    consistency_subproof(hasher, old_size, leaves, true)
}

fn consistency_subproof(
    hasher: &dyn LogHasher,
    m: usize,
    leaves: &[Hash],
    complete: bool,
) -> Vec<Hash> {
    let n = leaves.len();
    if m == n {
        return if complete {
            Vec::new()
        } else {
            vec![log_root(hasher, leaves)]
        };
    }
    let k = split_point(n);
    if m <= k {
        let mut proof = consistency_subproof(hasher, m, &leaves[..k], complete);
        proof.push(log_root(hasher, &leaves[k..]));
        proof
    } else {
        let mut proof = consistency_subproof(hasher, m - k, &leaves[k..], false);
        proof.push(log_root(hasher, &leaves[..k]));
        proof
    }
}

/// Sparse map held as its non-empty leaves.
#[derive(Clone, Debug, Default)]
pub struct SparseMap {
    leaves: BTreeMap<Hash, Vec<u8>>,
}

type LeafRef<'a> = (&'a Hash, &'a Vec<u8>);

impl SparseMap {
    pub fn insert(&mut self, index: Hash, value: Vec<u8>) {
        self.leaves.insert(index, value);
    }

    pub fn get(&self, index: &Hash) -> Option<&Vec<u8>> {
        self.leaves.get(index)
    }

    pub fn root(&self, hasher: &dyn MapHasher) -> Hash {
        let leaves: Vec<LeafRef<'_>> = self.leaves.iter().collect();
        map_subtree(hasher, &leaves, 0)
    }

    /// Siblings of `index` from the leaf level up.
    pub fn prove(&self, hasher: &dyn MapHasher, index: &Hash) -> Vec<Option<Hash>> {
        let leaves: Vec<LeafRef<'_>> = self.leaves.iter().collect();
        let mut proof = vec![None; MAP_DEPTH];
        let mut current: &[LeafRef<'_>] = &leaves;
        for depth in 0..MAP_DEPTH {
            let split = current.partition_point(|(key, _)| !index_bit(key, depth));
            let (left, right) = current.split_at(split);
            let (sibling, next) = if index_bit(index, depth) {
                (left, right)
            } else {
                (right, left)
            };
            if !sibling.is_empty() {
                proof[MAP_DEPTH - 1 - depth] = Some(map_subtree(hasher, sibling, depth + 1));
            }
            current = next;
        }
        proof
    }
}

fn map_subtree(hasher: &dyn MapHasher, leaves: &[LeafRef<'_>], depth: usize) -> Hash {
    if leaves.is_empty() {
        return hasher.hash_empty(MAP_DEPTH - depth);
    }
    if depth == MAP_DEPTH {
        let (index, value) = leaves[0];
        return hasher.hash_leaf(index, value);
    }
    let split = leaves.partition_point(|(key, _)| !index_bit(key, depth));
    hasher.hash_children(
        &map_subtree(hasher, &leaves[..split], depth + 1),
        &map_subtree(hasher, &leaves[split..], depth + 1),
    )
}

struct Revision {
    map: SparseMap,
    committed: HashMap<Hash, Committed>,
    smr: SignedMapRoot,
}

#[derive(Default)]
struct State {
    map: SparseMap,
    committed: HashMap<Hash, Committed>,
    revisions: Vec<Revision>,
    log_leaves: Vec<Hash>,
    apply_updates: bool,
    fail_updates: bool,
    tamper_log_signature: bool,
    latency: Option<Duration>,
    update_calls: Vec<Instant>,
    received_updates: Vec<UpdateEntryRequest>,
    history_calls: usize,
}

/// Key server with one map revision per published change.
pub struct FakeKeyServer {
    domain: TestDomain,
    log_hasher: Rfc6962Sha256,
    map_hasher: SparseSha256,
    mutator: Mutator,
    state: Mutex<State>,
}

impl FakeKeyServer {
    /// Starts with an empty map published as revision 0.
    pub fn new(domain: TestDomain) -> Self {
        let server = Self {
            domain,
            log_hasher: Rfc6962Sha256,
            map_hasher: SparseSha256::new(),
            mutator: Mutator::new(Arc::new(PreviousKeyPolicy::new(Arc::new(BlsVerifier)))),
            state: Mutex::new(State {
                apply_updates: true,
                ..State::default()
            }),
        };
        {
            let mut state = server.state.try_lock().expect("fresh lock");
            server.publish(&mut state);
        }
        server
    }

    pub fn domain(&self) -> &TestDomain {
        &self.domain
    }

    /// Stores an entry directly, bypassing authorization, and publishes it.
    pub async fn seed_entry(&self, user_id: &str, app_id: &str, keys: &[PublicKey], profile: &[u8]) {
        let mut state = self.state.lock().await;
        let (index, _) = self.domain.index(user_id, app_id);
        let old = state
            .map
            .get(&index)
            .and_then(|value| Entry::from_leaf_value(Some(value.as_slice())).expect("stored entry"));
        let nonce = generate_nonce().expect("nonce");
        let entry = Entry {
            index,
            commitment: commit(user_id, app_id, profile, &nonce[..]),
            authorized_keys: keys.iter().cloned().collect(),
            previous: hash_entry(old.as_ref()),
            signatures: BTreeMap::new(),
        };
        state
            .map
            .insert(index, entry.to_leaf_value().expect("encode"));
        state.committed.insert(
            index,
            Committed {
                key: nonce.to_vec(),
                data: profile.to_vec(),
            },
        );
        self.publish(&mut state);
    }

    /// Publishes a revision without changing the map.
    pub async fn advance_empty(&self) {
        let mut state = self.state.lock().await;
        self.publish(&mut state);
    }

    /// Response for the latest revision, with consistency from `first_tree_size`.
    pub async fn response_for(&self, user_id: &str, app_id: &str, first_tree_size: u64) -> GetEntryResponse {
        let state = self.state.lock().await;
        let latest = state.revisions.len() - 1;
        self.build_response(&state, user_id, app_id, latest, first_tree_size)
    }

    pub async fn set_apply_updates(&self, apply: bool) {
        self.state.lock().await.apply_updates = apply;
    }

    pub async fn set_fail_updates(&self, fail: bool) {
        self.state.lock().await.fail_updates = fail;
    }

    pub async fn set_tamper_log_signature(&self, tamper: bool) {
        self.state.lock().await.tamper_log_signature = tamper;
    }

    pub async fn set_latency(&self, latency: Duration) {
        self.state.lock().await.latency = Some(latency);
    }

    pub async fn update_calls(&self) -> Vec<Instant> {
        self.state.lock().await.update_calls.clone()
    }

    pub async fn received_updates(&self) -> Vec<UpdateEntryRequest> {
        self.state.lock().await.received_updates.clone()
    }

    pub async fn history_calls(&self) -> usize {
        self.state.lock().await.history_calls
    }

    fn publish(&self, state: &mut State) {
        let revision = state.revisions.len() as u64;
        let mut smr = SignedMapRoot {
            revision,
            root_hash: state.map.root(&self.map_hasher),
            timestamp_nanos: revision + 1,
            signature: Vec::new(),
        };
        smr.signature = self
            .domain
            .map_signer
            .sign(&smr.signing_bytes())
            .expect("sign map root");
        state
            .log_leaves
            .push(self.log_hasher.hash_leaf(&smr.log_leaf_data()));
        let snapshot = Revision {
            map: state.map.clone(),
            committed: state.committed.clone(),
            smr,
        };
        state.revisions.push(snapshot);
    }

    fn signed_log_root(&self, state: &State) -> SignedLogRoot {
        let tree_size = state.log_leaves.len() as u64;
        let mut root = SignedLogRoot {
            tree_size,
            root_hash: log_root(&self.log_hasher, &state.log_leaves),
            timestamp_nanos: tree_size,
            signature: Vec::new(),
        };
        let signer = if state.tamper_log_signature {
            &self.domain.map_signer
        } else {
            &self.domain.log_signer
        };
        root.signature = signer.sign(&root.signing_bytes()).expect("sign log root");
        root
    }

    fn build_response(
        &self,
        state: &State,
        user_id: &str,
        app_id: &str,
        revision: usize,
        first_tree_size: u64,
    ) -> GetEntryResponse {
        let (index, vrf_proof) = self.domain.index(user_id, app_id);
        let snapshot = &state.revisions[revision];
        let old_size = usize::try_from(first_tree_size).unwrap_or(usize::MAX);
        GetEntryResponse {
            vrf_proof,
            committed: snapshot.committed.get(&index).cloned(),
            leaf_proof: MapLeafInclusion {
                leaf: MapLeaf {
                    index,
                    leaf_value: snapshot.map.get(&index).cloned(),
                },
                inclusion: snapshot.map.prove(&self.map_hasher, &index),
            },
            smr: snapshot.smr.clone(),
            log_root: self.signed_log_root(state),
            log_consistency: log_consistency_proof(&self.log_hasher, old_size, &state.log_leaves),
            log_inclusion: log_inclusion_proof(&self.log_hasher, revision, &state.log_leaves),
        }
    }

    async fn delay(&self) {
        let latency = self.state.lock().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl KeyServer for FakeKeyServer {
    async fn get_entry(&self, request: GetEntryRequest) -> anyhow::Result<GetEntryResponse> {
        self.delay().await;
        let state = self.state.lock().await;
        let latest = state.revisions.len() - 1;
        Ok(self.build_response(
            &state,
            &request.user_id,
            &request.app_id,
            latest,
            request.first_tree_size,
        ))
    }

    async fn list_entry_history(
        &self,
        request: ListEntryHistoryRequest,
    ) -> anyhow::Result<ListEntryHistoryResponse> {
        self.delay().await;
        let mut state = self.state.lock().await;
        state.history_calls += 1;
        let total = state.revisions.len() as u64;
        let start = request.start.min(total);
        let end = (start + u64::from(request.page_size)).min(total);
        let values = (start..end)
            .map(|revision| {
                self.build_response(
                    &state,
                    &request.user_id,
                    &request.app_id,
                    revision as usize,
                    request.first_tree_size,
                )
            })
            .collect();
        let next_start = if end < total { end } else { 0 };
        Ok(ListEntryHistoryResponse { values, next_start })
    }

    async fn update_entry(&self, request: UpdateEntryRequest) -> anyhow::Result<UpdateEntryResponse> {
        self.delay().await;
        let mut state = self.state.lock().await;
        state.update_calls.push(Instant::now());
        state.received_updates.push(request.clone());
        if state.fail_updates {
            anyhow::bail!("connection reset");
        }

        let (index, _) = self.domain.index(&request.user_id, &request.app_id);
        if state.apply_updates {
            let old = Entry::from_leaf_value(state.map.get(&index).map(Vec::as_slice))?;
            let new = self
                .mutator
                .mutate(old.as_ref(), &request.entry_update.mutation)?;
            state.map.insert(index, new.to_leaf_value()?);
            state
                .committed
                .insert(index, request.entry_update.committed.clone());
            self.publish(&mut state);
        }

        let latest = state.revisions.len() - 1;
        Ok(UpdateEntryResponse {
            proof: self.build_response(
                &state,
                &request.user_id,
                &request.app_id,
                latest,
                request.first_tree_size,
            ),
        })
    }
}
