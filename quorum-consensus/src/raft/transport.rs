use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::driver::RaftHandle;
use super::rpc::{self, AppendLogsArgs, AppendLogsReply, RequestVoteArgs, RequestVoteReply};
use async_trait::async_trait;
use quorum_common::error::{QuorumError, Result};
use quorum_common::types::NodeId;
use tracing::info;

/// Outbound RPCs to other members. Failures are reported as errors and
/// treated as lost messages; callers never retry on their own.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request_vote(&self, peer: NodeId, args: RequestVoteArgs) -> Result<RequestVoteReply>;

    async fn append_logs(&self, peer: NodeId, args: AppendLogsArgs) -> Result<AppendLogsReply>;
}

#[derive(Debug, Default)]
struct Routes {
    handles: HashMap<NodeId, RaftHandle>,
    isolated: HashSet<NodeId>,
}

/// In-process network connecting nodes of one cluster by id. Nodes can be
/// isolated and healed to simulate partitions.
#[derive(Debug, Default)]
pub struct LocalNetwork {
    routes: Mutex<Routes>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, handle: RaftHandle) {
        self.routes().handles.insert(handle.id(), handle);
    }

    pub fn transport_for(self: &Arc<Self>, me: NodeId) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            me,
            network: Arc::clone(self),
        })
    }

    /// Cuts `id` off from every other node, in both directions.
    pub fn isolate(&self, id: NodeId) {
        info!(node = id, "Isolating node");
        self.routes().isolated.insert(id);
    }

    pub fn heal(&self, id: NodeId) {
        info!(node = id, "Reconnecting node");
        self.routes().isolated.remove(&id);
    }

    fn check_link(&self, from: NodeId, to: NodeId) -> Result<()> {
        let routes = self.routes();
        if routes.isolated.contains(&from) || routes.isolated.contains(&to) {
            return Err(QuorumError::Unreachable(to));
        }
        Ok(())
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<RaftHandle> {
        self.check_link(from, to)?;
        self.routes()
            .handles
            .get(&to)
            .cloned()
            .ok_or(QuorumError::Unreachable(to))
    }
}

/// One node's view of a [`LocalNetwork`]. Requests and replies pass through
/// the wire codec, as they would over a socket.
#[derive(Debug)]
pub struct LocalTransport {
    me: NodeId,
    network: Arc<LocalNetwork>,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request_vote(&self, peer: NodeId, args: RequestVoteArgs) -> Result<RequestVoteReply> {
        let handle = self.network.route(self.me, peer)?;
        let args = rpc::decode(&rpc::encode(&args)?)?;
        let reply = handle.request_vote(args).await?;
        // The link may have been cut while the request was in flight.
        self.network.check_link(peer, self.me)?;
        rpc::decode(&rpc::encode(&reply)?)
    }

    async fn append_logs(&self, peer: NodeId, args: AppendLogsArgs) -> Result<AppendLogsReply> {
        let handle = self.network.route(self.me, peer)?;
        let args = rpc::decode(&rpc::encode(&args)?)?;
        let reply = handle.append_logs(args).await?;
        self.network.check_link(peer, self.me)?;
        rpc::decode(&rpc::encode(&reply)?)
    }
}
