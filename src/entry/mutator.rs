// This file is part of ktrust and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::{objecthash, AuthorizationPolicy, Entry, MutationError};

/// Largest encoded entry accepted as a mutation.
pub const MAX_MUTATION_SIZE: usize = 16 * 1024;

/// Transition function from the current entry to a proposed one.
///
/// The server applies the same rules; clients replay it before submitting.
#[derive(Clone)]
pub struct Mutator {
    policy: Arc<dyn AuthorizationPolicy>,
}

impl Mutator {
    pub fn new(policy: Arc<dyn AuthorizationPolicy>) -> Self {
        Self { policy }
    }

    pub fn mutate(&self, old: Option<&Entry>, update: &Entry) -> Result<Entry, MutationError> {
        let size = update.to_leaf_value().map_err(MutationError::Encode)?.len();
        if size > MAX_MUTATION_SIZE {
            return Err(MutationError::TooLarge {
                size,
                limit: MAX_MUTATION_SIZE,
            });
        }
        if update.previous != objecthash::hash_entry(old) {
            return Err(MutationError::PreviousHashMismatch);
        }
        if update.authorized_keys.is_empty() {
            return Err(MutationError::MissingKey);
        }

        let empty = BTreeSet::new();
        let old_keys = old.map_or(&empty, |entry| &entry.authorized_keys);
        let mut unsigned = update.clone();
        unsigned.signatures.clear();
        self.policy.authorize(
            old_keys,
            &update.authorized_keys,
            &unsigned,
            &update.signatures,
        )?;
        Ok(update.clone())
    }
}
