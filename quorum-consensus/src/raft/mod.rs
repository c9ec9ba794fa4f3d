// Raft consensus: the synchronous node core plus the async driver around it
mod commit;
mod election;
pub mod driver;
pub mod log;
pub mod node;
pub mod replication;
pub mod rpc;
pub mod state_machine;
pub mod storage;
pub mod timer;
pub mod transport;

pub use driver::{RaftDriver, RaftHandle, RaftMsg};
pub use log::{LogEntry, LogStore, MemLog};
pub use node::{Handled, NodeRole, NodeStatus, RaftNode, RaftOptions};
pub use replication::{LeaderState, Progress, ReplyOutcome};
pub use rpc::{AppendLogsArgs, AppendLogsReply, RequestVoteArgs, RequestVoteReply};
pub use state_machine::{ChannelStateMachine, StateMachine, VecStateMachine};
pub use storage::{FileLog, FileStableStore, HardState, MemStableStore, StableStore};
pub use transport::{LocalNetwork, LocalTransport, Transport};
