// This file is part of ktrust and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Builder for the next version of an entry.
//!
//! A [`Mutation`] starts as a [`Draft`] seeded from the current entry. Setting
//! the commitment moves it to [`Staged`], the only state that can be signed.
//! Signing consumes the builder and yields an immutable [`SignedMutation`].

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;
use zeroize::Zeroizing;

use super::commitment::{self, NONCE_LEN};
use super::{objecthash, AuthorizationPolicy, Committed, Entry, EntryUpdate, MutationError};
use crate::crypto::{PublicKey, Signer};
use crate::merkle::Hash;
use crate::service::UpdateEntryRequest;

/// No commitment has been set yet.
#[derive(Debug)]
pub struct Draft;

/// Profile data and its opening nonce, kept on the client only.
pub struct Staged {
    data: Vec<u8>,
    nonce: Zeroizing<[u8; NONCE_LEN]>,
}

pub struct Mutation<S> {
    user_id: String,
    app_id: String,
    old_keys: BTreeSet<PublicKey>,
    entry: Entry,
    state: S,
}

impl Mutation<Draft> {
    /// Seeds a mutation from the leaf value currently stored at `index`.
    pub fn new(
        old_value: Option<&[u8]>,
        index: Hash,
        user_id: &str,
        app_id: &str,
    ) -> Result<Self, MutationError> {
        let old = Entry::from_leaf_value(old_value).map_err(MutationError::Decode)?;
        let previous = objecthash::hash_entry(old.as_ref());
        let (commitment, old_keys) = match old {
            Some(old) => (old.commitment, old.authorized_keys),
            None => (Vec::new(), BTreeSet::new()),
        };

        Ok(Self {
            user_id: user_id.to_owned(),
            app_id: app_id.to_owned(),
            entry: Entry {
                index,
                commitment,
                authorized_keys: old_keys.clone(),
                previous,
                signatures: BTreeMap::new(),
            },
            old_keys,
            state: Draft,
        })
    }
}

impl<S> Mutation<S> {
    /// Commits to `data` under a fresh nonce.
    pub fn set_commitment(self, data: &[u8]) -> Result<Mutation<Staged>, MutationError> {
        let nonce = commitment::generate_nonce()?;
        let mut entry = self.entry;
        entry.commitment = commitment::commit(&self.user_id, &self.app_id, data, &nonce[..]);
        Ok(Mutation {
            user_id: self.user_id,
            app_id: self.app_id,
            old_keys: self.old_keys,
            entry,
            state: Staged {
                data: data.to_vec(),
                nonce,
            },
        })
    }

    /// Replaces the authorized key set. An empty set is refused and leaves
    /// the mutation untouched.
    pub fn replace_authorized_keys<I>(&mut self, keys: I) -> Result<(), MutationError>
    where
        I: IntoIterator<Item = PublicKey>,
    {
        let keys: BTreeSet<PublicKey> = keys.into_iter().collect();
        if keys.is_empty() {
            return Err(MutationError::MissingKey);
        }
        self.entry.authorized_keys = keys;
        Ok(())
    }

    /// The unsigned entry as built so far.
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn old_keys(&self) -> &BTreeSet<PublicKey> {
        &self.old_keys
    }
}

impl Mutation<Staged> {
    /// Signs the entry with every signer and checks the result against `policy`.
    pub fn finalize(
        self,
        signers: &[&dyn Signer],
        policy: &dyn AuthorizationPolicy,
    ) -> Result<SignedMutation, MutationError> {
        let mut entry = self.entry;
        entry.signatures.clear();
        let digest = entry.signing_digest();

        let mut signatures = BTreeMap::new();
        for signer in signers {
            let key_id = signer.key_id();
            let signature = signer
                .sign(&digest)
                .map_err(|source| MutationError::Signing {
                    key_id: key_id.clone(),
                    source,
                })?;
            signatures.insert(key_id, signature);
        }

        policy.authorize(&self.old_keys, &entry.authorized_keys, &entry, &signatures)?;
        entry.signatures = signatures;
        debug!(
            user_id = %self.user_id,
            app_id = %self.app_id,
            signers = entry.signatures.len(),
            "mutation signed"
        );

        Ok(SignedMutation {
            user_id: self.user_id,
            app_id: self.app_id,
            entry,
            committed: Committed {
                key: self.state.nonce.to_vec(),
                data: self.state.data,
            },
        })
    }
}

/// A finalized mutation. Its contents can no longer change.
#[derive(Clone, Debug)]
pub struct SignedMutation {
    user_id: String,
    app_id: String,
    entry: Entry,
    committed: Committed,
}

impl SignedMutation {
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn committed(&self) -> &Committed {
        &self.committed
    }

    pub fn into_request(self, domain_id: &str) -> UpdateEntryRequest {
        UpdateEntryRequest {
            domain_id: domain_id.to_owned(),
            user_id: self.user_id,
            app_id: self.app_id,
            first_tree_size: 0,
            entry_update: EntryUpdate {
                mutation: self.entry,
                committed: self.committed,
            },
        }
    }
}
