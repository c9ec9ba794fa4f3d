use crate::types::NodeId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuorumError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Codec Error: {0}")]
    Codec(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    /// The log or hard state could not be made durable. The node must stop
    /// participating rather than acknowledge what it cannot record.
    #[error("Durability Error: {0}")]
    Durability(String),

    #[error("Not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("RPC timed out")]
    Timeout,

    #[error("Peer {0} unreachable")]
    Unreachable(NodeId),

    #[error("Node stopped")]
    Stopped,
}

impl QuorumError {
    /// Errors after which the node cannot keep taking part in consensus.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            QuorumError::Io(_) | QuorumError::Durability(_) | QuorumError::Config(_)
        )
    }

    /// Failures of a single RPC attempt; these are retried, never fatal.
    pub fn is_transport(&self) -> bool {
        matches!(self, QuorumError::Timeout | QuorumError::Unreachable(_))
    }
}

pub type Result<T> = std::result::Result<T, QuorumError>;

impl From<bincode::Error> for QuorumError {
    fn from(err: bincode::Error) -> Self {
        QuorumError::Codec(format!("Bincode Error: {}", err))
    }
}
