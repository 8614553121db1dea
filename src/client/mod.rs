// This file is part of ktrust and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

//! Verifying client for one directory domain.
//!
//! Every response is checked by the [`Verifier`] before it is used, and the
//! client's [`TrustedRoot`] only moves forward through compare-and-advance
//! under its own lock.

mod history;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::crypto::{PublicKey, Signer};
use crate::entry::{AuthorizationPolicy, Entry, Mutation, MutationError, Mutator, PreviousKeyPolicy};
use crate::service::{GetEntryRequest, KeyServer, SignedMapRoot, UpdateEntryRequest};
use crate::verify::{
    DomainInfo, TrustConfigError, TrustedRoot, VerifiedEntry, Verifier, VerifyError,
};

pub use history::HistoryPoint;

/// Tunables for a [`Client`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Extra submissions of an update that is not yet visible.
    pub retry_count: u32,
    /// Pause between those submissions.
    pub retry_delay: Duration,
    /// Largest history page requested from the server.
    pub page_size: u32,
    /// Deadline applied to each server call.
    pub call_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry_count: 1,
            retry_delay: Duration::from_secs(3),
            page_size: 16,
            call_timeout: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("update not visible after {attempts} attempt(s)")]
    NotVisible { attempts: u32 },
    #[error("incomplete history: received {received} of {wanted} revisions")]
    IncompleteHistory { received: u64, wanted: u64 },
    #[error("invalid revision range {start}..={end}")]
    InvalidRange { start: u64, end: u64 },
    #[error("history returned revision {got}, expected {expected}")]
    UnexpectedRevision { expected: u64, got: u64 },
    #[error("history continues at {got}, expected {expected}")]
    UnexpectedCursor { expected: u64, got: u64 },
    #[error("history returned revisions outside {start}..={end}")]
    TooManyRevisions { start: u64, end: u64 },
    #[error(transparent)]
    Verification(#[from] VerifyError),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error("failed to decode entry from server: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("{call} failed: {source}")]
    Transport {
        call: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("{call} timed out after {limit:?}")]
    Timeout { call: &'static str, limit: Duration },
    #[error(transparent)]
    Config(#[from] TrustConfigError),
}

impl ClientError {
    /// True for the eventual-consistency condition that a later retry may clear.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotVisible { .. })
    }
}

pub struct Client<S> {
    server: Arc<S>,
    domain_id: String,
    verifier: Verifier,
    policy: Arc<dyn AuthorizationPolicy>,
    mutator: Mutator,
    config: ClientConfig,
    trusted: RwLock<TrustedRoot>,
}

impl<S: KeyServer> Client<S> {
    /// Builds a client using [`PreviousKeyPolicy`] for local checks.
    pub fn new(server: Arc<S>, verifier: Verifier, config: ClientConfig) -> Self {
        let policy: Arc<dyn AuthorizationPolicy> = Arc::new(PreviousKeyPolicy::new(Arc::clone(
            verifier.anchors().signature_verifier(),
        )));
        Self {
            server,
            domain_id: verifier.anchors().domain_id().to_owned(),
            mutator: Mutator::new(Arc::clone(&policy)),
            policy,
            verifier,
            config,
            trusted: RwLock::new(TrustedRoot::default()),
        }
    }

    pub fn from_domain_info(
        server: Arc<S>,
        info: &DomainInfo,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let anchors = info.trust_anchors()?;
        Ok(Self::new(server, Verifier::new(anchors), config))
    }

    /// Swaps the authorization policy used for signing checks and local replay.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn AuthorizationPolicy>) -> Self {
        self.mutator = Mutator::new(Arc::clone(&policy));
        self.policy = policy;
        self
    }

    /// Starts from a previously saved root instead of the empty one.
    #[must_use]
    pub fn with_trusted_root(self, root: TrustedRoot) -> Self {
        Self {
            trusted: RwLock::new(root),
            ..self
        }
    }

    pub async fn trusted_root(&self) -> TrustedRoot {
        self.trusted.read().await.clone()
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the verified profile of a user, `None` if none is committed.
    pub async fn get_entry(
        &self,
        user_id: &str,
        app_id: &str,
    ) -> Result<(Option<Vec<u8>>, SignedMapRoot), ClientError> {
        let verified = self.fetch_verified(user_id, app_id).await?;
        let profile = verified.profile().map(<[u8]>::to_vec);
        Ok((profile, verified.smr))
    }

    async fn fetch_verified(&self, user_id: &str, app_id: &str) -> Result<VerifiedEntry, ClientError> {
        let snapshot = self.trusted_root().await;
        let request = GetEntryRequest {
            domain_id: self.domain_id.clone(),
            user_id: user_id.to_owned(),
            app_id: app_id.to_owned(),
            first_tree_size: snapshot.tree_size,
        };
        let response = self.call("get_entry", self.server.get_entry(request)).await?;
        self.verify_and_advance(user_id, app_id, &response).await
    }

    /// Reads the current entry and builds a signed request that replaces its
    /// profile and authorized keys.
    pub async fn prepare_update(
        &self,
        user_id: &str,
        app_id: &str,
        profile: &[u8],
        signers: &[&dyn Signer],
        authorized_keys: &[PublicKey],
    ) -> Result<UpdateEntryRequest, ClientError> {
        let current = self.fetch_verified(user_id, app_id).await?;

        let mut mutation = Mutation::new(
            current.leaf_value.as_deref(),
            current.index,
            user_id,
            app_id,
        )?;
        mutation.replace_authorized_keys(authorized_keys.iter().cloned())?;
        let signed = mutation
            .set_commitment(profile)?
            .finalize(signers, self.policy.as_ref())?;

        let old = current.entry().map_err(ClientError::Decode)?;
        self.mutator.mutate(old.as_ref(), signed.entry())?;

        Ok(signed.into_request(&self.domain_id))
    }

    /// Submits `request` until it becomes visible or the retries run out.
    ///
    /// The same signed request is resent each time. Only `NotVisible` is
    /// retried; every other failure is returned at once.
    pub async fn submit(&self, request: &UpdateEntryRequest) -> Result<VerifiedEntry, ClientError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.retry(request).await {
                Err(ClientError::NotVisible { .. }) if attempt <= self.config.retry_count => {
                    debug!(
                        user_id = %request.user_id,
                        attempt,
                        delay = ?self.config.retry_delay,
                        "update not visible yet, retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(ClientError::NotVisible { .. }) => {
                    warn!(user_id = %request.user_id, attempts = attempt, "update still not visible");
                    return Err(ClientError::NotVisible { attempts: attempt });
                }
                other => return other,
            }
        }
    }

    /// Builds, signs and submits an update. Returns the request that was sent.
    pub async fn update(
        &self,
        user_id: &str,
        app_id: &str,
        profile: &[u8],
        signers: &[&dyn Signer],
        authorized_keys: &[PublicKey],
    ) -> Result<UpdateEntryRequest, ClientError> {
        let request = self
            .prepare_update(user_id, app_id, profile, signers, authorized_keys)
            .await?;
        let verified = self.submit(&request).await?;
        info!(
            user_id,
            app_id,
            revision = verified.smr.revision,
            "update applied"
        );
        Ok(request)
    }

    /// Sends `request` once and checks whether the server now holds its entry.
    pub async fn retry(&self, request: &UpdateEntryRequest) -> Result<VerifiedEntry, ClientError> {
        let snapshot = self.trusted_root().await;
        let mut outgoing = request.clone();
        outgoing.first_tree_size = snapshot.tree_size;

        let response = self
            .call("update_entry", self.server.update_entry(outgoing))
            .await?;
        let verified = self
            .verify_and_advance(&request.user_id, &request.app_id, &response.proof)
            .await?;

        let current = Entry::from_leaf_value(verified.leaf_value.as_deref())
            .map_err(ClientError::Decode)?;
        if current.as_ref() == Some(&request.entry_update.mutation) {
            Ok(verified)
        } else {
            Err(ClientError::NotVisible { attempts: 1 })
        }
    }

    /// Checks `response` against the current trusted root and advances it,
    /// all under the write lock.
    async fn verify_and_advance(
        &self,
        user_id: &str,
        app_id: &str,
        response: &crate::service::GetEntryResponse,
    ) -> Result<VerifiedEntry, ClientError> {
        let mut trusted = self.trusted.write().await;
        let verified = self
            .verifier
            .verify_entry_response(user_id, app_id, &trusted, response)?;
        if trusted.advance(&verified.new_root) {
            debug!(tree_size = trusted.tree_size, "trusted root advanced");
        }
        Ok(verified)
    }

    async fn call<T, F>(&self, call: &'static str, future: F) -> Result<T, ClientError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let result = match self.config.call_timeout {
            Some(limit) => tokio::time::timeout(limit, future)
                .await
                .map_err(|_| ClientError::Timeout { call, limit })?,
            None => future.await,
        };
        result.map_err(|err| ClientError::Transport {
            call,
            source: err.into(),
        })
    }
}
