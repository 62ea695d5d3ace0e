//! Core type definitions for Meridian
//!
//! Identity, role and position types shared by every component of the
//! metadata coordination core.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Position of an entry in the journal. Starts at 1; 0 means "nothing".
pub type SequenceId = u64;

/// Leader epoch, used as the fencing token for journal appends.
pub type Epoch = u64;

/// Identifier of a metadata node
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into,
    Display,
)]
#[display("node-{_0}")]
pub struct NodeId(pub u64);

impl NodeId {
    /// Raw numeric id
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Role a node currently plays in the metadata cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterRole {
    /// Starting up; recovery not finished yet
    #[default]
    Init,
    /// Accepts writes and produces journal entries
    Leader,
    /// Replicates from the leader, may be promoted
    Follower,
    /// Replicates from the leader, never promoted
    Observer,
    /// Lost contact with the cluster
    Unknown,
}

impl ClusterRole {
    /// Check whether a transition from `self` to `to` is allowed.
    ///
    /// ```text
    /// INIT ──► FOLLOWER | OBSERVER | LEADER
    /// FOLLOWER ◄──► LEADER
    /// any ──► UNKNOWN ──► FOLLOWER | OBSERVER
    /// ```
    ///
    /// Followers and observers may "transition" to themselves when the
    /// leader they replicate from changes.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        use ClusterRole::{Follower, Init, Leader, Observer, Unknown};
        matches!(
            (self, to),
            (Init, Follower | Observer | Leader)
                | (Follower, Leader | Follower)
                | (Leader, Follower)
                | (Observer, Observer)
                | (Unknown, Follower | Observer)
                | (_, Unknown)
        )
    }

    /// Whether the node replicates from a leader in this role
    #[must_use]
    pub const fn is_replica(self) -> bool {
        matches!(self, Self::Follower | Self::Observer)
    }
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Leader => "LEADER",
            Self::Follower => "FOLLOWER",
            Self::Observer => "OBSERVER",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Network identity of a node
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeEndpoint {
    /// Node id
    pub node_id: NodeId,
    /// Address other nodes use to reach this node (e.g. `http://10.0.0.4:9110`)
    pub address: String,
}

impl NodeEndpoint {
    /// Create a new endpoint
    #[must_use]
    pub fn new(node_id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.address)
    }
}

/// The leader as announced by the election collaborator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderInfo {
    /// Who leads
    pub node: NodeEndpoint,
    /// Epoch the leadership was granted in
    pub epoch: Epoch,
}

/// Current wall-clock time in unix milliseconds.
///
/// Only the leader reads the clock, when it sequences an entry. Apply code
/// must use the entry's timestamp instead.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
