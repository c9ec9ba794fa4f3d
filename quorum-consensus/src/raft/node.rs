use std::collections::HashSet;
use std::time::Duration;

use super::log::LogStore;
use super::replication::LeaderState;
use super::storage::{HardState, StableStore};
use quorum_common::config;
use quorum_common::error::{QuorumError, Result};
use quorum_common::types::{ClusterConfig, LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Role of the node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

/// Per-node settings derived from the cluster configuration.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    pub id: NodeId,
    pub peers: Vec<NodeId>,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub rpc_timeout: Duration,
    pub max_append_entries: usize,
}

impl RaftOptions {
    pub fn from_config(cluster: &ClusterConfig, id: NodeId) -> Result<Self> {
        config::validate(cluster)?;
        if !cluster.contains(id) {
            return Err(QuorumError::Config(format!(
                "node {} is not a cluster member",
                id
            )));
        }
        Ok(Self {
            id,
            peers: cluster.peers_of(id),
            election_timeout_min: Duration::from_millis(cluster.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(cluster.election_timeout_max_ms),
            heartbeat_interval: Duration::from_millis(cluster.heartbeat_interval_ms),
            rpc_timeout: Duration::from_millis(cluster.rpc_timeout_ms),
            max_append_entries: cluster.max_append_entries,
        })
    }
}

/// A reply to an inbound RPC, plus whether the call proved there is a live
/// leader or candidate worth waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handled<R> {
    pub reply: R,
    pub reset_election_timer: bool,
}

/// Point-in-time view of a node, for clients and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub term: Term,
    pub role: NodeRole,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
}

impl NodeStatus {
    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }
}

/// A Raft node: owns its term, vote, role and log, and is driven one event
/// at a time. It performs no I/O beyond its log and stable stores; replies
/// and outbound requests are returned to the caller.
pub struct RaftNode<L, S> {
    pub(crate) id: NodeId,
    pub(crate) peers: Vec<NodeId>,
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) role: NodeRole,
    pub(crate) leader_id: Option<NodeId>,
    pub(crate) commit_index: LogIndex,
    pub(crate) last_applied: LogIndex,
    pub(crate) votes_received: HashSet<NodeId>,
    pub(crate) leader: Option<LeaderState>, // Present only while role == Leader
    pub(crate) max_append_entries: usize,
    pub(crate) log: L,
    stable: S,
}

impl<L: LogStore, S: StableStore> RaftNode<L, S> {
    /// Creates a follower, restoring term and vote from `stable` if it holds
    /// any.
    pub fn new(options: &RaftOptions, log: L, stable: S) -> Result<Self> {
        let hard_state = stable.load()?.unwrap_or_default();
        let mut peers: Vec<NodeId> = options
            .peers
            .iter()
            .copied()
            .filter(|&p| p != options.id)
            .collect();
        peers.sort_unstable();
        peers.dedup();

        info!(
            node = options.id,
            term = hard_state.current_term,
            voted_for = ?hard_state.voted_for,
            last_log_index = log.last_index(),
            "Restored node state"
        );

        Ok(Self {
            id: options.id,
            peers,
            current_term: hard_state.current_term,
            voted_for: hard_state.voted_for,
            role: NodeRole::Follower,
            leader_id: None,
            commit_index: 0,
            last_applied: 0,
            votes_received: HashSet::new(),
            leader: None,
            max_append_entries: options.max_append_entries.max(1),
            log,
            stable,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }

    /// The leader this node last accepted AppendLogs from in the current
    /// term (itself when leading).
    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn stable_store(&self) -> &S {
        &self.stable
    }

    pub fn leader_state(&self) -> Option<&LeaderState> {
        self.leader.as_ref()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            term: self.current_term,
            role: self.role,
            leader_id: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
        }
    }

    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Smallest number of nodes, self included, that forms a majority.
    pub fn quorum(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    pub(crate) fn persist_hard_state(&mut self) -> Result<()> {
        self.stable.save(&HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        })
    }

    /// Applies the all-servers rule: a term greater than ours is adopted
    /// and we revert to follower. Returns whether that happened.
    pub(crate) fn observe_term(&mut self, term: Term) -> Result<bool> {
        if term > self.current_term {
            self.become_follower(term)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Step down to follower, moving to `term` if it is newer.
    pub(crate) fn become_follower(&mut self, term: Term) -> Result<()> {
        debug_assert!(term >= self.current_term);
        let previous = self.role;
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            self.persist_hard_state()?;
        }
        self.role = NodeRole::Follower;
        self.leader = None;
        self.votes_received.clear();
        if previous != NodeRole::Follower {
            info!(
                node = self.id,
                term = self.current_term,
                from = ?previous,
                "Became follower"
            );
        }
        Ok(())
    }

    /// Start a new term as candidate, voting for ourselves.
    pub(crate) fn become_candidate(&mut self) -> Result<()> {
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.persist_hard_state()?;
        self.role = NodeRole::Candidate;
        self.leader = None;
        self.leader_id = None;
        self.votes_received.clear();
        self.votes_received.insert(self.id);
        info!(
            node = self.id,
            term = self.current_term,
            "Starting election"
        );
        Ok(())
    }

    /// Transition to leader role after winning the current term's election.
    pub(crate) fn become_leader(&mut self) {
        debug_assert_eq!(self.role, NodeRole::Candidate);
        self.role = NodeRole::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();
        self.leader = Some(LeaderState::new(&self.peers, self.log.last_index()));
        info!(
            node = self.id,
            term = self.current_term,
            last_log_index = self.log.last_index(),
            "Became leader"
        );
        // A single-node cluster already has a majority for its own entries.
        self.advance_commit_index();
    }
}
