//! Leader election collaborator
//!
//! The core does not elect leaders itself. It asks a [`LeaderElection`]
//! who leads and in which epoch, and follows its announcements.
//! [`LocalElection`] is an in-process implementation driven by an
//! operator (or a test): whoever it appoints leads, each appointment in a
//! strictly higher epoch.

use meridian_common::{Epoch, LeaderInfo, NodeEndpoint, NodeId};
use tokio::sync::watch;
use tracing::info;

/// Source of leadership decisions
pub trait LeaderElection: Send + Sync {
    /// Current leader, `None` while there is none or it is unreachable
    fn current_leader(&self) -> Option<LeaderInfo>;

    /// Announcements of leadership changes
    fn subscribe(&self) -> watch::Receiver<Option<LeaderInfo>>;

    /// Give up leadership held by `node`, if it holds it
    fn resign(&self, node: NodeId);
}

/// Operator-driven election
pub struct LocalElection {
    leader: watch::Sender<Option<LeaderInfo>>,
    epoch: parking_lot::Mutex<Epoch>,
}

impl LocalElection {
    /// No leader yet; the first appointment gets `initial_epoch + 1`
    #[must_use]
    pub fn new(initial_epoch: Epoch) -> Self {
        let (leader, _) = watch::channel(None);
        Self {
            leader,
            epoch: parking_lot::Mutex::new(initial_epoch),
        }
    }

    /// Start with `node` leading in `epoch`
    #[must_use]
    pub fn with_leader(node: NodeEndpoint, epoch: Epoch) -> Self {
        let (leader, _) = watch::channel(Some(LeaderInfo { node, epoch }));
        Self {
            leader,
            epoch: parking_lot::Mutex::new(epoch),
        }
    }

    /// Make `node` the leader in a new epoch
    pub fn appoint(&self, node: NodeEndpoint) -> LeaderInfo {
        let mut epoch = self.epoch.lock();
        *epoch += 1;
        let info = LeaderInfo {
            node,
            epoch: *epoch,
        };
        info!("Appointed {} as leader in epoch {}", info.node, info.epoch);
        self.leader.send_replace(Some(info.clone()));
        info
    }

    /// Follow a leader decided elsewhere. Stale announcements are ignored.
    pub fn observe(&self, leader: LeaderInfo) -> bool {
        let mut epoch = self.epoch.lock();
        if leader.epoch < *epoch {
            return false;
        }
        *epoch = leader.epoch;
        self.leader.send_replace(Some(leader));
        true
    }

    /// Announce that no leader is reachable
    pub fn partition(&self) {
        info!("Leader announcement withdrawn");
        self.leader.send_replace(None);
    }

    /// Highest epoch handed out
    #[must_use]
    pub fn epoch(&self) -> Epoch {
        *self.epoch.lock()
    }
}

impl LeaderElection for LocalElection {
    fn current_leader(&self) -> Option<LeaderInfo> {
        self.leader.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<LeaderInfo>> {
        self.leader.subscribe()
    }

    fn resign(&self, node: NodeId) {
        self.leader.send_if_modified(|leader| {
            if leader.as_ref().is_some_and(|l| l.node.node_id == node) {
                info!("{} resigned leadership", node);
                *leader = None;
                true
            } else {
                false
            }
        });
    }
}
