// This file is part of ktrust and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{BlsVerifier, BlsVrfVerifier, PublicKey, SignatureVerifier, VrfVerifier};
use crate::merkle::{LogHasher, MapHasher, Rfc6962Sha256, SparseSha256};

pub const LOG_STRATEGY_RFC6962_SHA256: &str = "RFC6962_SHA256";
pub const MAP_STRATEGY_SPARSE_SHA256: &str = "SPARSE_SHA256";

/// Everything a verifier needs to know about one directory domain.
#[derive(Clone)]
pub struct DomainTrustAnchors {
    domain_id: String,
    log_hasher: Arc<dyn LogHasher>,
    map_hasher: Arc<dyn MapHasher>,
    signatures: Arc<dyn SignatureVerifier>,
    log_key: PublicKey,
    map_key: PublicKey,
    vrf: Arc<dyn VrfVerifier>,
}

impl DomainTrustAnchors {
    pub fn new(
        domain_id: String,
        log_hasher: Arc<dyn LogHasher>,
        map_hasher: Arc<dyn MapHasher>,
        signatures: Arc<dyn SignatureVerifier>,
        log_key: PublicKey,
        map_key: PublicKey,
        vrf: Arc<dyn VrfVerifier>,
    ) -> Result<Self, TrustConfigError> {
        if domain_id.is_empty() {
            return Err(TrustConfigError::EmptyDomainId);
        }
        if !signatures.accepts_key(&log_key) {
            return Err(TrustConfigError::InvalidLogPublicKey);
        }
        if !signatures.accepts_key(&map_key) {
            return Err(TrustConfigError::InvalidMapPublicKey);
        }
        Ok(Self {
            domain_id,
            log_hasher,
            map_hasher,
            signatures,
            log_key,
            map_key,
            vrf,
        })
    }

    #[must_use]
    pub fn domain_id(&self) -> &str {
        &self.domain_id
    }

    #[must_use]
    pub fn log_hasher(&self) -> &dyn LogHasher {
        self.log_hasher.as_ref()
    }

    #[must_use]
    pub fn map_hasher(&self) -> &dyn MapHasher {
        self.map_hasher.as_ref()
    }

    #[must_use]
    pub fn signature_verifier(&self) -> &Arc<dyn SignatureVerifier> {
        &self.signatures
    }

    #[must_use]
    pub fn log_public_key(&self) -> &PublicKey {
        &self.log_key
    }

    #[must_use]
    pub fn map_public_key(&self) -> &PublicKey {
        &self.map_key
    }

    #[must_use]
    pub fn vrf(&self) -> &dyn VrfVerifier {
        self.vrf.as_ref()
    }
}

impl fmt::Debug for DomainTrustAnchors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainTrustAnchors")
            .field("domain_id", &self.domain_id)
            .field("log_key", &self.log_key)
            .field("map_key", &self.map_key)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDescriptor {
    pub hash_strategy: String,
    pub public_key: String,
}

/// Domain descriptor as published by the directory operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub domain_id: String,
    pub log: TreeDescriptor,
    pub map: TreeDescriptor,
    pub vrf_public_key: String,
}

impl DomainInfo {
    /// Parses keys and selects hash strategies.
    pub fn trust_anchors(&self) -> Result<DomainTrustAnchors, TrustConfigError> {
        let log_hasher: Arc<dyn LogHasher> = match self.log.hash_strategy.as_str() {
            LOG_STRATEGY_RFC6962_SHA256 => Arc::new(Rfc6962Sha256),
            other => {
                return Err(TrustConfigError::UnsupportedLogHashStrategy {
                    strategy: other.to_owned(),
                })
            }
        };
        let map_hasher: Arc<dyn MapHasher> = match self.map.hash_strategy.as_str() {
            MAP_STRATEGY_SPARSE_SHA256 => Arc::new(SparseSha256::new()),
            other => {
                return Err(TrustConfigError::UnsupportedMapHashStrategy {
                    strategy: other.to_owned(),
                })
            }
        };

        let log_key = decode_key(&self.log.public_key).ok_or(TrustConfigError::InvalidLogPublicKey)?;
        let map_key = decode_key(&self.map.public_key).ok_or(TrustConfigError::InvalidMapPublicKey)?;
        let vrf = hex::decode(&self.vrf_public_key)
            .ok()
            .and_then(|bytes| BlsVrfVerifier::from_bytes(&bytes))
            .ok_or(TrustConfigError::InvalidVrfPublicKey)?;

        DomainTrustAnchors::new(
            self.domain_id.clone(),
            log_hasher,
            map_hasher,
            Arc::new(BlsVerifier),
            log_key,
            map_key,
            Arc::new(vrf),
        )
    }
}

fn decode_key(encoded: &str) -> Option<PublicKey> {
    hex::decode(encoded).ok().map(PublicKey::new)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrustConfigError {
    #[error("domain identifier must not be empty")]
    EmptyDomainId,
    #[error("unsupported log hash strategy {strategy}")]
    UnsupportedLogHashStrategy { strategy: String },
    #[error("unsupported map hash strategy {strategy}")]
    UnsupportedMapHashStrategy { strategy: String },
    #[error("invalid log public key encoding")]
    InvalidLogPublicKey,
    #[error("invalid map public key encoding")]
    InvalidMapPublicKey,
    #[error("invalid VRF public key encoding")]
    InvalidVrfPublicKey,
}
