//! Replication transport seams
//!
//! Followers pull journal entries from the leader through a
//! [`ReplicationSource`]; a [`SourceConnector`] turns a leader announcement
//! into a source. The node binary provides an HTTP implementation; the
//! in-process ones here serve tests and embedded deployments.

use crate::checkpoint::CheckpointManager;
use crate::coordinator::StateCoordinator;
use crate::journal::{JournalEntry, JournalStore};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use meridian_common::{Error, LeaderInfo, NodeId, Result, SequenceId};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Where a follower reads the leader's history from
#[async_trait]
pub trait ReplicationSource: Send + Sync {
    /// Up to `max_entries` entries starting at `from`. Waits up to `wait`
    /// for entries to appear when there are none yet, then returns an
    /// empty batch. Fails with [`Error::JournalTruncated`] when `from` is
    /// no longer retained.
    async fn pull_entries(
        &self,
        from: SequenceId,
        max_entries: usize,
        wait: Duration,
    ) -> Result<Vec<JournalEntry>>;

    /// Latest checkpoint image, if the source has one
    async fn fetch_image(&self) -> Result<Option<Bytes>>;
}

/// Opens sources for announced leaders
pub trait SourceConnector: Send + Sync {
    fn connect(&self, leader: &LeaderInfo) -> Result<Arc<dyn ReplicationSource>>;
}

/// Source reading a journal directly
///
/// Serves a leader's durable history even when the leader process is gone,
/// as long as its journal stays readable.
pub struct JournalSource {
    journal: Arc<dyn JournalStore>,
    images: Option<Arc<CheckpointManager>>,
    poll_interval: Duration,
}

impl JournalSource {
    #[must_use]
    pub fn new(journal: Arc<dyn JournalStore>) -> Self {
        Self {
            journal,
            images: None,
            poll_interval: Duration::from_millis(10),
        }
    }

    /// Also serve images from `images`
    #[must_use]
    pub fn with_images(mut self, images: Arc<CheckpointManager>) -> Self {
        self.images = Some(images);
        self
    }
}

#[async_trait]
impl ReplicationSource for JournalSource {
    async fn pull_entries(
        &self,
        from: SequenceId,
        max_entries: usize,
        wait: Duration,
    ) -> Result<Vec<JournalEntry>> {
        let deadline = Instant::now() + wait;
        loop {
            let first = self.journal.first_sequence();
            if from < first {
                return Err(Error::JournalTruncated {
                    first_available: first,
                });
            }
            let last = self.journal.last_sequence();
            if from <= last {
                let to = last.min(from.saturating_add(max_entries.max(1) as u64 - 1));
                let journal = Arc::clone(&self.journal);
                return tokio::task::spawn_blocking(move || journal.read(from, to))
                    .await
                    .map_err(|e| Error::internal(format!("journal read task failed: {e}")))?;
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn fetch_image(&self) -> Result<Option<Bytes>> {
        let Some(images) = self.images.clone() else {
            return Ok(None);
        };
        let image = tokio::task::spawn_blocking(move || images.latest_image())
            .await
            .map_err(|e| Error::internal(format!("image read task failed: {e}")))??;
        Ok(image.map(Bytes::from))
    }
}

/// Source backed by a coordinator in the same process
pub struct CoordinatorSource {
    coordinator: StateCoordinator,
}

impl CoordinatorSource {
    #[must_use]
    pub const fn new(coordinator: StateCoordinator) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl ReplicationSource for CoordinatorSource {
    async fn pull_entries(
        &self,
        from: SequenceId,
        max_entries: usize,
        wait: Duration,
    ) -> Result<Vec<JournalEntry>> {
        self.coordinator.pull_entries(from, max_entries, wait).await
    }

    async fn fetch_image(&self) -> Result<Option<Bytes>> {
        self.coordinator.latest_image().await
    }
}

/// Connector over a fixed table of sources
#[derive(Default)]
pub struct StaticConnector {
    sources: DashMap<NodeId, Arc<dyn ReplicationSource>>,
}

impl StaticConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `node`'s history from `source`
    pub fn register(&self, node: NodeId, source: Arc<dyn ReplicationSource>) {
        self.sources.insert(node, source);
    }

    pub fn unregister(&self, node: NodeId) {
        self.sources.remove(&node);
    }
}

impl SourceConnector for StaticConnector {
    fn connect(&self, leader: &LeaderInfo) -> Result<Arc<dyn ReplicationSource>> {
        self.sources
            .get(&leader.node.node_id)
            .map(|source| Arc::clone(source.value()))
            .ok_or_else(|| Error::Unavailable(format!("no route to {}", leader.node)))
    }
}
