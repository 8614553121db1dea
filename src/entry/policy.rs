// This file is part of ktrust and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Key-rotation policy checked before a mutation is sent or applied.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;

use super::Entry;
use crate::crypto::{PublicKey, SignatureVerifier};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("no signature from an authorized key")]
    NoSignature,
    #[error("signature by {key_id} did not verify")]
    InvalidSignature { key_id: String },
}

/// Decides whether a set of signatures authorizes a key-set transition.
pub trait AuthorizationPolicy: Send + Sync {
    fn authorize(
        &self,
        old_keys: &BTreeSet<PublicKey>,
        new_keys: &BTreeSet<PublicKey>,
        unsigned: &Entry,
        signatures: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), PolicyError>;
}

/// Requires one valid signature from a key of the previous entry.
///
/// The first entry of a user has no previous keys, so it must be signed by
/// one of its own keys instead.
#[derive(Clone)]
pub struct PreviousKeyPolicy {
    verifier: Arc<dyn SignatureVerifier>,
}

impl PreviousKeyPolicy {
    pub fn new(verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self { verifier }
    }
}

impl AuthorizationPolicy for PreviousKeyPolicy {
    fn authorize(
        &self,
        old_keys: &BTreeSet<PublicKey>,
        new_keys: &BTreeSet<PublicKey>,
        unsigned: &Entry,
        signatures: &BTreeMap<String, Vec<u8>>,
    ) -> Result<(), PolicyError> {
        let candidates = if old_keys.is_empty() {
            new_keys
        } else {
            old_keys
        };
        let message = unsigned.signing_digest();

        let mut rejected = None;
        for key in candidates {
            let key_id = key.key_id();
            let Some(signature) = signatures.get(&key_id) else {
                continue;
            };
            match self.verifier.verify(key, &message, signature) {
                Ok(()) => return Ok(()),
                Err(_) => rejected = Some(key_id),
            }
        }
        Err(match rejected {
            Some(key_id) => PolicyError::InvalidSignature { key_id },
            None => PolicyError::NoSignature,
        })
    }
}
