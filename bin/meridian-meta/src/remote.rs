//! HTTP replication client
//!
//! Followers pull the leader's journal and checkpoint images over the node
//! API served by [`crate::http`]. Leader announcements are pushed to peers
//! the same way.

use crate::http::{ErrorEnvelope, FIRST_AVAILABLE_HEADER};
use async_trait::async_trait;
use bytes::Bytes;
use meridian_common::{Error, LeaderInfo, NodeEndpoint, Result, SequenceId};
use meridian_meta_store::journal::record::decode_batch;
use meridian_meta_store::{JournalEntry, ReplicationSource, SourceConnector};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Slack on top of the long-poll wait before a pull counts as timed out
const PULL_GRACE: Duration = Duration::from_secs(5);

/// Pulls from a leader's node API
pub struct HttpReplicationSource {
    client: reqwest::Client,
    leader: NodeEndpoint,
}

impl HttpReplicationSource {
    #[must_use]
    pub const fn new(client: reqwest::Client, leader: NodeEndpoint) -> Self {
        Self { client, leader }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.leader.address.trim_end_matches('/'), path)
    }

    fn unreachable(&self, e: &reqwest::Error) -> Error {
        Error::Unavailable(format!("leader {} unreachable: {}", self.leader, e))
    }

    async fn failure(&self, response: reqwest::Response) -> Error {
        let status = response.status();
        let first_available = response
            .headers()
            .get(FIRST_AVAILABLE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<SequenceId>().ok());
        let message = response
            .json::<ErrorEnvelope>()
            .await
            .map(|e| e.error.message)
            .unwrap_or_default();

        match (status, first_available) {
            (StatusCode::GONE, Some(first_available)) => {
                Error::JournalTruncated { first_available }
            }
            _ => Error::Unavailable(format!(
                "leader {} answered {}: {}",
                self.leader, status, message
            )),
        }
    }
}

#[async_trait]
impl ReplicationSource for HttpReplicationSource {
    async fn pull_entries(
        &self,
        from: SequenceId,
        max_entries: usize,
        wait: Duration,
    ) -> Result<Vec<JournalEntry>> {
        let wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
        let response = self
            .client
            .get(self.url("/v1/journal"))
            .query(&[
                ("from", from.to_string()),
                ("max", max_entries.to_string()),
                ("wait_ms", wait_ms.to_string()),
            ])
            .timeout(wait + PULL_GRACE)
            .send()
            .await
            .map_err(|e| self.unreachable(&e))?;

        if !response.status().is_success() {
            return Err(self.failure(response).await);
        }

        let body = response.bytes().await.map_err(|e| self.unreachable(&e))?;
        // A batch mangled in transit is retried, not treated as local corruption
        let entries = decode_batch(&body, from).map_err(|e| {
            Error::Unavailable(format!("undecodable batch from {}: {}", self.leader, e))
        })?;
        debug!(
            "Pulled {} entries from {} starting at {}",
            entries.len(),
            self.leader,
            from
        );
        Ok(entries)
    }

    async fn fetch_image(&self) -> Result<Option<Bytes>> {
        let response = self
            .client
            .get(self.url("/v1/checkpoint/latest"))
            .send()
            .await
            .map_err(|e| self.unreachable(&e))?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => response
                .bytes()
                .await
                .map(Some)
                .map_err(|e| self.unreachable(&e)),
            _ => Err(self.failure(response).await),
        }
    }
}

/// Opens [`HttpReplicationSource`]s on a shared client
#[derive(Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("http client: {e}")))?;
        Ok(Self { client })
    }

    /// Tell every peer who leads now. Unreachable peers are logged and
    /// skipped; they learn the leader when they come back and are told again.
    pub async fn announce(&self, peers: &[NodeEndpoint], leader: &LeaderInfo) {
        for peer in peers {
            let url = format!("{}/v1/election/observe", peer.address.trim_end_matches('/'));
            let result = self
                .client
                .post(&url)
                .json(leader)
                .timeout(Duration::from_secs(5))
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    debug!("Announced {} to {}", leader.node, peer);
                }
                Ok(response) => {
                    warn!(
                        "Peer {} refused announcement of {}: {}",
                        peer,
                        leader.node,
                        response.status()
                    );
                }
                Err(e) => warn!("Peer {} unreachable for announcement: {}", peer, e),
            }
        }
    }
}

impl SourceConnector for HttpConnector {
    fn connect(&self, leader: &LeaderInfo) -> Result<Arc<dyn ReplicationSource>> {
        Ok(Arc::new(HttpReplicationSource::new(
            self.client.clone(),
            leader.node.clone(),
        )))
    }
}
