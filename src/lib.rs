// This file is part of ktrust and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

//! Client-side trust core for a verifiable key transparency directory.

/// File-backed domain registry for directory operators.
pub mod admin;
/// Verifying client: lookups, update/retry and history.
pub mod client;
mod codec;
/// Signature and VRF capabilities.
pub mod crypto;
/// Entries, canonical hashing, commitments and mutations.
pub mod entry;
/// Log and sparse map hash strategies and proof checks.
pub mod merkle;
/// Key server request/response types and transport seam.
pub mod service;
/// Response verification and trusted-root tracking.
pub mod verify;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{Client, ClientConfig, ClientError, HistoryPoint};
pub use crypto::{PublicKey, SignatureVerifier, Signer, VrfVerifier};
pub use entry::{Committed, Entry, EntryUpdate, Mutation, MutationError, Mutator};
pub use service::KeyServer;
pub use verify::{DomainInfo, TrustedRoot, VerifiedEntry, Verifier, VerifyError};
