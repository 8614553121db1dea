// This file is part of ktrust and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Hiding commitments to profile data.
//!
//! `commit = HMAC-SHA256(nonce, len(user) || user || len(app) || app || data)`.

use hmac::{Hmac, Mac};
use rand_core_06::{OsRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

use super::Committed;

pub const NONCE_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitmentError {
    #[error("entropy source failed: {0}")]
    Entropy(String),
    #[error("commitment does not open to the supplied data")]
    Mismatch,
}

/// Draws a fresh commitment nonce from the operating system.
pub fn generate_nonce() -> Result<Zeroizing<[u8; NONCE_LEN]>, CommitmentError> {
    let mut nonce = Zeroizing::new([0u8; NONCE_LEN]);
    OsRng
        .try_fill_bytes(&mut nonce[..])
        .map_err(|err| CommitmentError::Entropy(err.to_string()))?;
    Ok(nonce)
}

pub fn commit(user_id: &str, app_id: &str, data: &[u8], nonce: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(nonce) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(&(user_id.len() as u32).to_be_bytes());
    mac.update(user_id.as_bytes());
    mac.update(&(app_id.len() as u32).to_be_bytes());
    mac.update(app_id.as_bytes());
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Checks that `committed` opens `commitment` for this user and application.
pub fn verify(
    user_id: &str,
    app_id: &str,
    commitment: &[u8],
    committed: &Committed,
) -> Result<(), CommitmentError> {
    let expected = commit(user_id, app_id, &committed.data, &committed.key);
    if expected.is_empty() || !bool::from(expected.as_slice().ct_eq(commitment)) {
        return Err(CommitmentError::Mismatch);
    }
    Ok(())
}
