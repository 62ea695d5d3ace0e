//! Configuration types for Meridian
//!
//! Every section has defaults so a config file only needs the keys it
//! changes. The daemon layers file, environment and CLI values on top.

use crate::error::{Error, Result};
use crate::types::{Epoch, NodeEndpoint, NodeId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for a metadata node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node identity and storage location
    pub node: NodeConfig,
    /// Journal store and writer
    pub journal: JournalConfig,
    /// Checkpoint images
    pub checkpoint: CheckpointConfig,
    /// Replay error policy
    pub replay: ReplayConfig,
    /// Follower catch-up
    pub replication: ReplicationConfig,
    /// Request handling
    pub coordinator: CoordinatorConfig,
    /// Cluster membership and initial leadership
    pub cluster: ClusterConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl Config {
    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.journal.max_batch_entries == 0 {
            return Err(Error::Configuration(
                "journal.max_batch_entries must be at least 1".into(),
            ));
        }
        if self.journal.queue_capacity == 0 {
            return Err(Error::Configuration(
                "journal.queue_capacity must be at least 1".into(),
            ));
        }
        if self.journal.segment_size_bytes < 4096 {
            return Err(Error::Configuration(
                "journal.segment_size_bytes must be at least 4096".into(),
            ));
        }
        if self.checkpoint.retain_images == 0 {
            return Err(Error::Configuration(
                "checkpoint.retain_images must be at least 1".into(),
            ));
        }
        if self.replication.retry_initial_ms > self.replication.retry_max_ms {
            return Err(Error::Configuration(
                "replication.retry_initial_ms exceeds replication.retry_max_ms".into(),
            ));
        }
        if let Some(leader) = &self.cluster.leader
            && self.node.observer
            && leader.node_id == self.node.node_id
        {
            return Err(Error::Configuration(
                "an observer cannot be configured as the initial leader".into(),
            ));
        }
        Ok(())
    }

    /// This node's endpoint as advertised to peers
    #[must_use]
    pub fn local_endpoint(&self) -> NodeEndpoint {
        let address = self
            .node
            .advertise_addr
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.node.listen));
        NodeEndpoint::new(NodeId(self.node.node_id), address)
    }
}

/// Node identity and role configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Numeric node id, unique in the cluster
    pub node_id: u64,
    /// Human-readable name
    pub name: String,
    /// Data directory for journal and images
    pub data_dir: PathBuf,
    /// HTTP listen address
    pub listen: String,
    /// Address peers use to reach this node (defaults to `http://{listen}`)
    pub advertise_addr: Option<String>,
    /// Run as an observer (replicates, never leads)
    pub observer: bool,
}

impl NodeConfig {
    /// Directory holding journal segments
    #[must_use]
    pub fn journal_dir(&self) -> PathBuf {
        self.data_dir.join("journal")
    }

    /// Directory holding checkpoint images
    #[must_use]
    pub fn image_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            name: "meridian-meta".to_string(),
            data_dir: PathBuf::from("/var/lib/meridian"),
            listen: "0.0.0.0:9110".to_string(),
            advertise_addr: None,
            observer: false,
        }
    }
}

/// Journal store and writer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// fsync after every appended batch
    pub sync_on_append: bool,
    /// Roll to a new segment file past this size
    pub segment_size_bytes: u64,
    /// Write buffer size per segment file
    pub write_buffer_size: usize,
    /// Maximum entries per append batch
    pub max_batch_entries: usize,
    /// How long the writer waits to fill a batch
    pub batch_window_ms: u64,
    /// Proposals that may wait for the writer before submitters block
    pub queue_capacity: usize,
}

impl JournalConfig {
    /// Batch window as a duration
    #[must_use]
    pub const fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            sync_on_append: true,
            segment_size_bytes: 64 * 1024 * 1024, // 64 MB
            write_buffer_size: 64 * 1024,         // 64 KB
            max_batch_entries: 256,
            batch_window_ms: 2,
            queue_capacity: 4096,
        }
    }
}

/// Checkpoint image configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// How often the scheduler checks whether an image is due
    pub interval_secs: u64,
    /// Entries applied since the last image before a new one is taken
    pub min_entries: u64,
    /// Images kept on disk
    pub retain_images: usize,
    /// Journal entries kept below the newest image (serves lagging followers)
    pub journal_retain_entries: u64,
    /// Let followers and observers take local images too
    pub on_followers: bool,
}

impl CheckpointConfig {
    /// Scheduler interval as a duration
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            min_entries: 10_000,
            retain_images: 2,
            journal_retain_entries: 1_000,
            on_followers: true,
        }
    }
}

/// Replay error policy
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Operation codes whose apply failures are skipped with a warning
    /// instead of halting the node. Empty unless an operator opts in.
    pub skip_op_codes: Vec<u32>,
}

/// Follower catch-up configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Entries requested per pull
    pub max_batch_entries: usize,
    /// How long a pull may wait on the leader for new entries
    pub poll_wait_ms: u64,
    /// First retry delay after a failed pull or local append
    pub retry_initial_ms: u64,
    /// Retry delay cap
    pub retry_max_ms: u64,
    /// Time a promoted follower spends draining the old leader
    pub leader_drain_timeout_ms: u64,
}

impl ReplicationConfig {
    /// Long-poll wait as a duration
    #[must_use]
    pub const fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    /// Drain timeout as a duration
    #[must_use]
    pub const fn leader_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_drain_timeout_ms)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_batch_entries: 512,
            poll_wait_ms: 1_000,
            retry_initial_ms: 50,
            retry_max_ms: 5_000,
            leader_drain_timeout_ms: 2_000,
        }
    }
}

/// Request handling configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Default time a submission waits for durability + apply
    pub request_timeout_ms: u64,
    /// Default time multi-entity DDL waits for region locks
    pub lock_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            lock_timeout_ms: 3_000,
        }
    }
}

/// Cluster membership
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster name
    pub name: String,
    /// Known members, including this node
    pub members: Vec<MemberConfig>,
    /// Initial leader, if one is designated
    pub leader: Option<MemberConfig>,
    /// Epoch the initial leader holds
    pub epoch: Epoch,
}

/// A member of the cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberConfig {
    /// Node id
    pub node_id: u64,
    /// Advertised address
    pub address: String,
}

impl MemberConfig {
    /// As a node endpoint
    #[must_use]
    pub fn endpoint(&self) -> NodeEndpoint {
        NodeEndpoint::new(NodeId(self.node_id), self.address.clone())
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.node_id, 1);
        assert!(config.journal.sync_on_append);
        assert!(config.replay.skip_op_codes.is_empty());
        assert_eq!(config.node.journal_dir(), PathBuf::from("/var/lib/meridian/journal"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_local_endpoint() {
        let mut config = Config::default();
        assert_eq!(config.local_endpoint().address, "http://0.0.0.0:9110");

        config.node.advertise_addr = Some("http://meta-1:9110".into());
        assert_eq!(config.local_endpoint().address, "http://meta-1:9110");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.journal.max_batch_entries = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let mut config = Config::default();
        config.node.observer = true;
        config.cluster.leader = Some(MemberConfig {
            node_id: 1,
            address: "http://x".into(),
        });
        assert!(config.validate().is_err());
    }
}
