// This file is part of ktrust and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

use tracing::debug;

use super::{Client, ClientError};
use crate::service::{KeyServer, ListEntryHistoryRequest, SignedMapRoot};

/// A revision at which a user's profile changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryPoint {
    pub revision: u64,
    pub map_root: SignedMapRoot,
    /// `None` when the profile was removed at this revision.
    pub profile: Option<Vec<u8>>,
}

impl<S: KeyServer> Client<S> {
    /// Verified profile changes for revisions `start..=end`, oldest first.
    ///
    /// Runs of identical profiles collapse into their earliest revision, and
    /// revisions before the first profile are skipped. The server must return
    /// consecutive revisions starting at `start`. Fails with
    /// [`ClientError::IncompleteHistory`] when it runs out of revisions early.
    pub async fn list_history(
        &self,
        user_id: &str,
        app_id: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<HistoryPoint>, ClientError> {
        let wanted = end
            .checked_sub(start)
            .and_then(|span| span.checked_add(1))
            .ok_or(ClientError::InvalidRange { start, end })?;
        let mut received = 0u64;
        let mut cursor = start;
        let mut current: Option<Vec<u8>> = None;
        let mut points = Vec::new();

        while received < wanted {
            let snapshot = self.trusted_root().await;
            let page_size = (wanted - received).min(u64::from(self.config.page_size)) as u32;
            let request = ListEntryHistoryRequest {
                domain_id: self.domain_id.clone(),
                user_id: user_id.to_owned(),
                app_id: app_id.to_owned(),
                first_tree_size: snapshot.tree_size,
                start: cursor,
                page_size,
            };
            let response = self
                .call("list_entry_history", self.server.list_entry_history(request))
                .await?;
            debug!(
                user_id,
                start = cursor,
                values = response.values.len(),
                next_start = response.next_start,
                "history page received"
            );

            for value in &response.values {
                if received == wanted {
                    return Err(ClientError::TooManyRevisions { start, end });
                }
                let expected = start + received;
                let verified = self.verify_and_advance(user_id, app_id, value).await?;
                if verified.smr.revision != expected {
                    return Err(ClientError::UnexpectedRevision {
                        expected,
                        got: verified.smr.revision,
                    });
                }
                received += 1;

                let profile = verified.profile().map(<[u8]>::to_vec);
                if profile.as_deref().unwrap_or_default() == current.as_deref().unwrap_or_default() {
                    continue;
                }
                points.push(HistoryPoint {
                    revision: verified.smr.revision,
                    map_root: verified.smr,
                    profile: profile.clone(),
                });
                current = profile;
            }

            if received == wanted || response.next_start == 0 || response.values.is_empty() {
                break;
            }
            cursor = start + received;
            if response.next_start != cursor {
                return Err(ClientError::UnexpectedCursor {
                    expected: cursor,
                    got: response.next_start,
                });
            }
        }

        if received < wanted {
            return Err(ClientError::IncompleteHistory { received, wanted });
        }
        Ok(points)
    }
}
