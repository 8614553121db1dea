// This file is part of ktrust and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! Signature and VRF capabilities used by the verifier and the mutation builder.
//!
//! The core only talks to the [`Signer`], [`SignatureVerifier`] and
//! [`VrfVerifier`] traits. The BLS12-381 implementations below are the
//! defaults selected by [`crate::verify::DomainInfo`].

use std::convert::TryInto;
use std::fmt;

use blstrs::{pairing, G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use ff::Field;
use group::prime::PrimeCurveAffine;
use group::{Curve, Group};
use rand_core_06::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Domain separation tag used when hashing messages for signatures.
pub const SIG_DST: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_NUL_";
/// Domain separation tag for VRF evaluations.
pub const VRF_DST: &[u8] = b"KTRUST_VRF_BLS12381G1_XMD:SHA-256_SSWU_RO_";

const G1_COMPRESSED_LEN: usize = 48;
const G2_COMPRESSED_LEN: usize = 96;
const KEY_ID_LEN: usize = 8;

/// Failures raised by signature capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("public key encoding is invalid")]
    MalformedKey,
    #[error("signature encoding is invalid")]
    MalformedSignature,
    #[error("signature rejected")]
    Invalid,
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Failures raised while checking a VRF proof.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VrfError {
    #[error("VRF proof encoding is invalid")]
    MalformedProof,
    #[error("VRF proof rejected")]
    InvalidProof,
}

/// Serialized public key as it appears in an entry's authorized key set.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    #[serde(with = "crate::codec::hex_vec")]
    pub bytes: Vec<u8>,
}

impl PublicKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Stable identifier under which signatures by this key are stored.
    #[must_use]
    pub fn key_id(&self) -> String {
        let digest = Sha256::digest(&self.bytes);
        hex::encode(&digest[..KEY_ID_LEN])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.key_id()).finish()
    }
}

/// Produces signatures over canonical entry digests.
pub trait Signer: Send + Sync {
    fn public_key(&self) -> PublicKey;

    fn key_id(&self) -> String {
        self.public_key().key_id()
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignatureError>;
}

/// Checks signatures made by a serialized public key.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, key: &PublicKey, message: &[u8], signature: &[u8])
        -> Result<(), SignatureError>;

    /// Returns true when `key` is a well-formed key for this scheme.
    fn accepts_key(&self, key: &PublicKey) -> bool;
}

/// Maps a VRF proof over `message` to the index it proves.
pub trait VrfVerifier: Send + Sync {
    fn proof_to_index(&self, message: &[u8], proof: &[u8]) -> Result<[u8; 32], VrfError>;
}

/// Hashes arbitrary data into the G1 curve using the provided domain separation tag.
pub fn hash_to_g1(msg: &[u8], dst: &[u8]) -> G1Projective {
    G1Projective::hash_to_curve(msg, dst, &[])
}

/// Produces a BLS signature for `msg` using `sk` and domain separation `dst`.
pub fn bls_sign(sk: &Scalar, msg: &[u8], dst: &[u8]) -> G1Projective {
    let h = hash_to_g1(msg, dst);
    h * sk
}

/// Verifies a BLS signature against the supplied public key and message.
pub fn bls_verify(pk: &G2Projective, msg: &[u8], sig: &G1Projective, dst: &[u8]) -> bool {
    let h = hash_to_g1(msg, dst);
    pairing(&sig.to_affine(), &G2Affine::generator()) == pairing(&h.to_affine(), &pk.to_affine())
}

pub(crate) fn g1_from_bytes(bytes: &[u8]) -> Option<G1Projective> {
    let arr: [u8; G1_COMPRESSED_LEN] = bytes.try_into().ok()?;
    let affine: G1Affine = Option::from(G1Affine::from_compressed(&arr))?;
    if bool::from(affine.is_identity()) {
        None
    } else {
        Some(G1Projective::from(affine))
    }
}

pub(crate) fn g2_from_bytes(bytes: &[u8]) -> Option<G2Projective> {
    let arr: [u8; G2_COMPRESSED_LEN] = bytes.try_into().ok()?;
    let affine: G2Affine = Option::from(G2Affine::from_compressed(&arr))?;
    if bool::from(affine.is_identity()) {
        None
    } else {
        Some(G2Projective::from(affine))
    }
}

/// BLS12-381 signing key producing G1 signatures.
#[derive(Clone)]
pub struct BlsSigner {
    sk: Scalar,
    pk: G2Projective,
}

impl BlsSigner {
    pub fn from_scalar(sk: Scalar) -> Self {
        Self {
            sk,
            pk: G2Projective::generator() * sk,
        }
    }

    pub fn generate(rng: &mut impl RngCore) -> Self {
        Self::from_scalar(Scalar::random(rng))
    }
}

impl fmt::Debug for BlsSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlsSigner")
            .field("key_id", &self.key_id())
            .finish_non_exhaustive()
    }
}

impl Signer for BlsSigner {
    fn public_key(&self) -> PublicKey {
        PublicKey::new(self.pk.to_affine().to_compressed().to_vec())
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignatureError> {
        Ok(bls_sign(&self.sk, message, SIG_DST)
            .to_affine()
            .to_compressed()
            .to_vec())
    }
}

/// Verifier for BLS12-381 keys in compressed G2 form.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlsVerifier;

impl SignatureVerifier for BlsVerifier {
    fn verify(
        &self,
        key: &PublicKey,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), SignatureError> {
        let pk = g2_from_bytes(&key.bytes).ok_or(SignatureError::MalformedKey)?;
        let sig = g1_from_bytes(signature).ok_or(SignatureError::MalformedSignature)?;
        if bls_verify(&pk, message, &sig, SIG_DST) {
            Ok(())
        } else {
            Err(SignatureError::Invalid)
        }
    }

    fn accepts_key(&self, key: &PublicKey) -> bool {
        g2_from_bytes(&key.bytes).is_some()
    }
}

/// Message the VRF is evaluated over for a user/application pair.
pub fn vrf_message(user_id: &str, app_id: &str) -> Vec<u8> {
    let mut message = Vec::with_capacity(8 + user_id.len() + app_id.len());
    message.extend_from_slice(&(user_id.len() as u32).to_be_bytes());
    message.extend_from_slice(user_id.as_bytes());
    message.extend_from_slice(&(app_id.len() as u32).to_be_bytes());
    message.extend_from_slice(app_id.as_bytes());
    message
}

fn vrf_index(proof: &G1Projective) -> [u8; 32] {
    Sha256::digest(proof.to_affine().to_compressed()).into()
}

/// Verifier half of the BLS unique-signature VRF.
#[derive(Clone, Debug)]
pub struct BlsVrfVerifier {
    pk: G2Projective,
}

impl BlsVrfVerifier {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        g2_from_bytes(bytes).map(|pk| Self { pk })
    }
}

impl VrfVerifier for BlsVrfVerifier {
    fn proof_to_index(&self, message: &[u8], proof: &[u8]) -> Result<[u8; 32], VrfError> {
        let sig = g1_from_bytes(proof).ok_or(VrfError::MalformedProof)?;
        if !bls_verify(&self.pk, message, &sig, VRF_DST) {
            return Err(VrfError::InvalidProof);
        }
        Ok(vrf_index(&sig))
    }
}

/// Evaluation half of the BLS VRF, held by the directory operator.
#[derive(Clone)]
pub struct BlsVrfSigner {
    sk: Scalar,
}

impl BlsVrfSigner {
    pub fn from_scalar(sk: Scalar) -> Self {
        Self { sk }
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        (G2Projective::generator() * self.sk)
            .to_affine()
            .to_compressed()
            .to_vec()
    }

    /// Returns the index and the proof for `message`.
    pub fn evaluate(&self, message: &[u8]) -> ([u8; 32], Vec<u8>) {
        let sig = bls_sign(&self.sk, message, VRF_DST);
        (vrf_index(&sig), sig.to_affine().to_compressed().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core_06::OsRng;

    #[test]
    fn bls_sign_verify_roundtrip() {
        let signer = BlsSigner::generate(&mut OsRng);
        let sig = signer.sign(b"hello").expect("sign");
        let key = signer.public_key();
        assert!(BlsVerifier.verify(&key, b"hello", &sig).is_ok());
        assert_eq!(
            BlsVerifier.verify(&key, b"other", &sig),
            Err(SignatureError::Invalid)
        );
    }

    #[test]
    fn malformed_material_is_rejected() {
        let signer = BlsSigner::from_scalar(Scalar::from(7u64));
        let sig = signer.sign(b"msg").expect("sign");
        let bad_key = PublicKey::new(vec![0u8; 12]);
        assert_eq!(
            BlsVerifier.verify(&bad_key, b"msg", &sig),
            Err(SignatureError::MalformedKey)
        );
        let identity = G1Projective::identity().to_affine().to_compressed().to_vec();
        assert_eq!(
            BlsVerifier.verify(&signer.public_key(), b"msg", &identity),
            Err(SignatureError::MalformedSignature)
        );
        assert!(!BlsVerifier.accepts_key(&bad_key));
        assert!(BlsVerifier.accepts_key(&signer.public_key()));
    }

    #[test]
    fn key_ids_are_stable_and_distinct() {
        let a = BlsSigner::from_scalar(Scalar::from(1u64)).public_key();
        let b = BlsSigner::from_scalar(Scalar::from(2u64)).public_key();
        assert_eq!(a.key_id(), a.clone().key_id());
        assert_eq!(a.key_id().len(), KEY_ID_LEN * 2);
        assert_ne!(a.key_id(), b.key_id());
    }

    #[test]
    fn vrf_proof_yields_index() {
        let vrf = BlsVrfSigner::from_scalar(Scalar::from(99u64));
        let verifier = BlsVrfVerifier::from_bytes(&vrf.public_key_bytes()).expect("vrf key");
        let message = vrf_message("alice", "app");
        let (index, proof) = vrf.evaluate(&message);
        assert_eq!(verifier.proof_to_index(&message, &proof), Ok(index));
        assert_eq!(
            verifier.proof_to_index(&vrf_message("bob", "app"), &proof),
            Err(VrfError::InvalidProof)
        );
        assert_eq!(
            verifier.proof_to_index(&message, &proof[1..]),
            Err(VrfError::MalformedProof)
        );
    }

    #[test]
    fn vrf_message_is_length_prefixed() {
        assert_ne!(vrf_message("ab", "c"), vrf_message("a", "bc"));
    }
}
