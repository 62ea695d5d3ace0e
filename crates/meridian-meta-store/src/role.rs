//! Node role state machine
//!
//! Tracks which role this node plays, who it believes leads and in which
//! epoch. The state is published on a watch channel so request handlers
//! and background tasks can react to changes. The actual work of a
//! transition (starting or stopping the writer, catch-up and checkpoint
//! tasks) is driven by [`StateCoordinator`](crate::StateCoordinator).

use crate::metric_definitions::{LEADER_EPOCH, ROLE_TRANSITIONS};
use meridian_common::{
    ClusterRole, Epoch, Error, LeaderInfo, NodeEndpoint, Result, SequenceId,
};
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

/// Role, leader and epoch as seen by this node
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RoleState {
    pub role: ClusterRole,
    pub leader: Option<LeaderInfo>,
    pub epoch: Epoch,
}

/// Something a background component needs the coordinator to act on
#[derive(Debug)]
pub(crate) enum NodeEvent {
    /// The writer of `epoch` could not append; leadership must end
    StepDown { epoch: Epoch, error: Error },
    /// Local state can no longer be trusted
    Halt { error: Error },
}

/// Owner of the node's role
pub struct RoleCoordinator {
    node: NodeEndpoint,
    observer: bool,
    state: watch::Sender<RoleState>,
}

impl RoleCoordinator {
    #[must_use]
    pub fn new(node: NodeEndpoint, observer: bool) -> Self {
        let (state, _) = watch::channel(RoleState::default());
        Self {
            node,
            observer,
            state,
        }
    }

    /// This node
    #[must_use]
    pub const fn node(&self) -> &NodeEndpoint {
        &self.node
    }

    /// Whether this node is configured never to lead
    #[must_use]
    pub const fn is_observer(&self) -> bool {
        self.observer
    }

    #[must_use]
    pub fn current(&self) -> RoleState {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn role(&self) -> ClusterRole {
        self.state.borrow().role
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.role() == ClusterRole::Leader
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RoleState> {
        self.state.subscribe()
    }

    /// Role this node takes when replicating
    #[must_use]
    pub const fn replica_role(&self) -> ClusterRole {
        if self.observer {
            ClusterRole::Observer
        } else {
            ClusterRole::Follower
        }
    }

    /// Whether `leader` names this node
    #[must_use]
    pub fn is_self(&self, leader: &LeaderInfo) -> bool {
        leader.node.node_id == self.node.node_id
    }

    /// Check that moving to `to` is allowed for this node
    pub fn check(&self, to: ClusterRole) -> Result<()> {
        let from = self.role();
        let allowed = from.can_transition_to(to)
            && match to {
                ClusterRole::Leader | ClusterRole::Follower => !self.observer,
                ClusterRole::Observer => self.observer,
                ClusterRole::Init | ClusterRole::Unknown => true,
            };
        if allowed {
            Ok(())
        } else {
            Err(Error::InvalidTransition { from, to })
        }
    }

    /// Move to `to`, recording the leader if one is known
    pub fn transition(&self, to: ClusterRole, leader: Option<LeaderInfo>) -> Result<RoleState> {
        self.check(to)?;
        let mut next = RoleState {
            role: to,
            epoch: 0,
            leader,
        };
        self.state.send_modify(|state| {
            next.epoch = next
                .leader
                .as_ref()
                .map_or(state.epoch, |l| l.epoch.max(state.epoch));
            if state.role != to {
                info!(
                    "{} role {} -> {} (epoch {})",
                    self.node.node_id, state.role, to, next.epoch
                );
                counter!(ROLE_TRANSITIONS, "to" => to.to_string()).increment(1);
            }
            *state = next.clone();
        });
        #[allow(clippy::cast_precision_loss)]
        gauge!(LEADER_EPOCH).set(next.epoch as f64);
        Ok(next)
    }

    /// The error returned to writes that reach a node which is not leader
    #[must_use]
    pub fn not_leader(&self, last_applied: SequenceId) -> Error {
        let state = self.state.borrow();
        Error::NotLeader {
            role: state.role,
            leader: state.leader.as_ref().map(|l| l.node.clone()),
            last_applied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::NodeId;

    fn endpoint(id: u64) -> NodeEndpoint {
        NodeEndpoint::new(NodeId(id), format!("http://node-{id}"))
    }

    #[test]
    fn test_follower_to_leader() {
        let role = RoleCoordinator::new(endpoint(1), false);
        assert_eq!(role.role(), ClusterRole::Init);

        let leader = LeaderInfo {
            node: endpoint(2),
            epoch: 3,
        };
        role.transition(ClusterRole::Follower, Some(leader.clone()))
            .unwrap();
        assert_eq!(role.current().epoch, 3);
        assert!(!role.is_self(&leader));

        let err = role.not_leader(9);
        assert!(matches!(
            err,
            Error::NotLeader {
                role: ClusterRole::Follower,
                leader: Some(ref l),
                last_applied: 9
            } if l.node_id == NodeId(2)
        ));

        role.transition(
            ClusterRole::Leader,
            Some(LeaderInfo {
                node: endpoint(1),
                epoch: 4,
            }),
        )
        .unwrap();
        assert!(role.is_leader());
        assert_eq!(role.current().epoch, 4);
    }

    #[test]
    fn test_observer_never_leads() {
        let role = RoleCoordinator::new(endpoint(5), true);
        assert_eq!(role.replica_role(), ClusterRole::Observer);
        assert!(matches!(
            role.transition(ClusterRole::Leader, None),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(role.check(ClusterRole::Follower).is_err());
        role.transition(ClusterRole::Observer, None).unwrap();
        role.transition(ClusterRole::Unknown, None).unwrap();
        role.transition(ClusterRole::Observer, None).unwrap();
    }

    #[test]
    fn test_invalid_transitions() {
        let role = RoleCoordinator::new(endpoint(1), false);
        role.transition(ClusterRole::Unknown, None).unwrap();
        assert!(matches!(
            role.transition(ClusterRole::Leader, None),
            Err(Error::InvalidTransition {
                from: ClusterRole::Unknown,
                to: ClusterRole::Leader
            })
        ));
    }
}
