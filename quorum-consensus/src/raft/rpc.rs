use super::log::LogEntry;
use quorum_common::error::Result;
use quorum_common::types::{LogIndex, NodeId, Term};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Sent by leader to replicate log entries or as heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendLogsArgs {
    pub term: Term,                       // Leader's term
    pub leader_id: NodeId,                // So followers can redirect clients
    pub prev_log_index: LogIndex,         // Index of log entry before new ones
    pub prev_log_term: Term,              // Term of that entry, 0 if none
    pub entries: Vec<LogEntry>,           // New log entries to store, empty for heartbeat
    pub leader_committed_index: LogIndex, // Leader's commit index
}

/// Response from follower to AppendLogs RPC
///
/// `append_term`, `prev_log_index` and `prev_log_term` echo the request so
/// the leader can match the reply to its replication cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendLogsReply {
    pub peer_id: NodeId,
    pub term: Term, // Follower's current term (may be newer)
    pub append_term: Term,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries_len: u64, // Entries accepted on success
    pub success: bool,
}

impl AppendLogsReply {
    /// Highest index the follower is known to hold after a successful call.
    pub fn match_index(&self) -> LogIndex {
        self.prev_log_index + self.entries_len
    }
}

/// RequestVote RPC: Candidate → Peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Response to RequestVote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

/// Serializes a wire message with the workspace codec.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}
