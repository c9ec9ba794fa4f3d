//! Async runtime around a [`RaftNode`]. One task owns the node and handles
//! every event in turn: inbound RPCs, client commands, replies to our own
//! RPCs and the two timers. Outbound RPCs run on their own tasks and feed
//! their replies back through the same inbox, so nothing blocks the loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::log::{LogEntry, LogStore};
use super::node::{NodeRole, NodeStatus, RaftNode, RaftOptions};
use super::replication::ReplyOutcome;
use super::rpc::{AppendLogsArgs, AppendLogsReply, RequestVoteArgs, RequestVoteReply};
use super::state_machine::StateMachine;
use super::storage::StableStore;
use super::timer::{ElectionTimer, HeartbeatTimer};
use super::transport::Transport;
use bytes::Bytes;
use quorum_common::error::{QuorumError, Result};
use quorum_common::metrics::MetricsCollector;
use quorum_common::types::{LogIndex, NodeId, Term};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub enum RaftMsg {
    RequestVote {
        args: RequestVoteArgs,
        reply: oneshot::Sender<RequestVoteReply>,
    },
    AppendLogs {
        args: AppendLogsArgs,
        reply: oneshot::Sender<AppendLogsReply>,
    },
    Start {
        command: Bytes,
        reply: oneshot::Sender<Result<(LogIndex, Term)>>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    /// Reply to a RequestVote we sent during `term`.
    VoteResult {
        term: Term,
        peer: NodeId,
        reply: RequestVoteReply,
    },
    /// Reply from `peer` to an AppendLogs we sent it.
    AppendResult {
        peer: NodeId,
        reply: AppendLogsReply,
    },
    Shutdown,
}

/// Cloneable endpoint for a running node. Every call fails with
/// [`QuorumError::Stopped`] once the node's loop has exited.
#[derive(Debug, Clone)]
pub struct RaftHandle {
    id: NodeId,
    tx: mpsc::UnboundedSender<RaftMsg>,
}

impl RaftHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    async fn call<T>(&self, msg: impl FnOnce(oneshot::Sender<T>) -> RaftMsg) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(msg(tx)).map_err(|_| QuorumError::Stopped)?;
        rx.await.map_err(|_| QuorumError::Stopped)
    }

    pub async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply> {
        self.call(|reply| RaftMsg::RequestVote { args, reply }).await
    }

    pub async fn append_logs(&self, args: AppendLogsArgs) -> Result<AppendLogsReply> {
        self.call(|reply| RaftMsg::AppendLogs { args, reply }).await
    }

    /// Submits a command. On the leader, returns the index the command will
    /// occupy if it commits and the current term.
    pub async fn start(&self, command: impl Into<Bytes>) -> Result<(LogIndex, Term)> {
        let command = command.into();
        self.call(|reply| RaftMsg::Start { command, reply }).await?
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        self.call(|reply| RaftMsg::Status { reply }).await
    }

    pub async fn term(&self) -> Result<Term> {
        Ok(self.status().await?.term)
    }

    pub async fn is_leader(&self) -> Result<bool> {
        Ok(self.status().await?.is_leader())
    }

    /// Asks the loop to stop. Queued requests are dropped and their callers
    /// see `Stopped`.
    pub fn shutdown(&self) {
        let _ = self.tx.send(RaftMsg::Shutdown);
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }
}

enum Event {
    Message(Option<RaftMsg>),
    ElectionTimeout,
    Heartbeat,
}

pub struct RaftDriver<L, S> {
    node: RaftNode<L, S>,
    options: RaftOptions,
    transport: Arc<dyn Transport>,
    metrics: Arc<dyn MetricsCollector>,
    tx: mpsc::UnboundedSender<RaftMsg>,
    rx: mpsc::UnboundedReceiver<RaftMsg>,
    election_timer: ElectionTimer,
    heartbeat: HeartbeatTimer,
    apply_tx: mpsc::UnboundedSender<Vec<LogEntry>>,
}

impl<L: LogStore, S: StableStore> RaftDriver<L, S> {
    /// Starts the node's event loop and its applier on the current runtime.
    /// The join handle resolves when the loop exits; an error means the
    /// node stopped because its storage failed.
    pub fn spawn<M: StateMachine>(
        node: RaftNode<L, S>,
        options: RaftOptions,
        transport: Arc<dyn Transport>,
        state_machine: M,
        metrics: Arc<dyn MetricsCollector>,
    ) -> (RaftHandle, JoinHandle<Result<()>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_applier(node.id(), state_machine, apply_rx));

        let handle = RaftHandle { id: node.id(), tx: tx.clone() };
        let driver = Self {
            election_timer: ElectionTimer::new(
                options.election_timeout_min,
                options.election_timeout_max,
            ),
            heartbeat: HeartbeatTimer::new(options.heartbeat_interval),
            node,
            options,
            transport,
            metrics,
            tx,
            rx,
            apply_tx,
        };
        (handle, tokio::spawn(driver.run()))
    }

    async fn run(mut self) -> Result<()> {
        info!(
            node = self.node.id(),
            term = self.node.current_term(),
            peers = ?self.node.peers(),
            "Raft node started"
        );
        loop {
            let event = tokio::select! {
                msg = self.rx.recv() => Event::Message(msg),
                _ = self.election_timer.expired() => Event::ElectionTimeout,
                _ = self.heartbeat.tick() => Event::Heartbeat,
            };

            let was_leader = self.node.is_leader();
            let commit_before = self.node.commit_index();
            let outcome = match event {
                Event::Message(None) | Event::Message(Some(RaftMsg::Shutdown)) => break,
                Event::Message(Some(msg)) => self.handle_message(msg),
                Event::ElectionTimeout => self.handle_election_timeout(),
                Event::Heartbeat => {
                    self.replicate_all();
                    Ok(())
                }
            };
            if let Err(e) = outcome {
                error!(
                    node = self.node.id(),
                    term = self.node.current_term(),
                    error = %e,
                    "Stopping node after storage failure"
                );
                self.metrics.inc_counter("raft.fatal_errors");
                return Err(e);
            }
            self.after_event(was_leader, commit_before);
        }
        info!(
            node = self.node.id(),
            term = self.node.current_term(),
            "Raft node stopped"
        );
        Ok(())
    }

    fn handle_message(&mut self, msg: RaftMsg) -> Result<()> {
        match msg {
            RaftMsg::RequestVote { args, reply } => {
                let handled = self.node.handle_request_vote(&args)?;
                if handled.reset_election_timer {
                    self.election_timer.reset();
                }
                let _ = reply.send(handled.reply);
            }
            RaftMsg::AppendLogs { args, reply } => {
                let handled = self.node.handle_append_logs(&args)?;
                if handled.reset_election_timer {
                    self.election_timer.reset();
                }
                let _ = reply.send(handled.reply);
            }
            RaftMsg::Start { command, reply } => match self.node.start(command) {
                Ok(accepted) => {
                    let _ = reply.send(Ok(accepted));
                    self.replicate_all();
                }
                Err(e) if e.is_fatal() => {
                    let _ = reply.send(Err(QuorumError::Stopped));
                    return Err(e);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            RaftMsg::Status { reply } => {
                let _ = reply.send(self.node.status());
            }
            RaftMsg::VoteResult { term, peer, reply } => {
                self.node.handle_vote_reply(peer, term, &reply)?;
            }
            RaftMsg::AppendResult { peer, reply } => {
                match self.node.handle_append_logs_reply(peer, &reply)? {
                    ReplyOutcome::Retry(args) | ReplyOutcome::Continue(args) => {
                        self.send_append_logs(peer, args);
                    }
                    ReplyOutcome::Accepted | ReplyOutcome::Ignored | ReplyOutcome::SteppedDown => {}
                }
            }
            RaftMsg::Shutdown => {}
        }
        Ok(())
    }

    fn handle_election_timeout(&mut self) -> Result<()> {
        self.election_timer.reset();
        let Some(args) = self.node.start_election()? else {
            return Ok(());
        };
        self.metrics.inc_counter("raft.elections_started");
        let peers = self.node.peers().to_vec();
        for peer in peers {
            self.send_request_vote(peer, args.clone());
        }
        Ok(())
    }

    fn after_event(&mut self, was_leader: bool, commit_before: LogIndex) {
        match (was_leader, self.node.is_leader()) {
            (false, true) => {
                self.metrics.inc_counter("raft.leaderships_won");
                self.heartbeat.reset();
                self.replicate_all();
            }
            (true, false) => {
                self.metrics.inc_counter("raft.step_downs");
                self.election_timer.reset();
            }
            _ => {}
        }
        if self.node.commit_index() != commit_before {
            self.metrics
                .observe_gauge("raft.commit_index", self.node.commit_index() as f64);
        }
        self.apply_committed();
    }

    fn apply_committed(&mut self) {
        let entries = self.node.take_committed();
        if entries.is_empty() {
            return;
        }
        self.metrics
            .observe_gauge("raft.applied_index", self.node.last_applied() as f64);
        if self.apply_tx.send(entries).is_err() {
            warn!(node = self.node.id(), "Applier task is gone");
        }
    }

    /// AppendLogs to every peer. No-op unless leader.
    fn replicate_all(&mut self) {
        if self.node.role() != NodeRole::Leader {
            return;
        }
        for (peer, args) in self.node.broadcast_append_logs() {
            self.send_append_logs(peer, args);
        }
    }

    fn send_request_vote(&self, peer: NodeId, args: RequestVoteArgs) {
        let transport = Arc::clone(&self.transport);
        let metrics = Arc::clone(&self.metrics);
        let tx = self.tx.clone();
        let limit = self.options.rpc_timeout;
        let node = self.node.id();
        let term = args.term;
        tokio::spawn(async move {
            match with_timeout(limit, transport.request_vote(peer, args)).await {
                Ok(reply) => {
                    let _ = tx.send(RaftMsg::VoteResult { term, peer, reply });
                }
                Err(e) => {
                    metrics.inc_counter("raft.transport_failures");
                    debug!(node, peer, term, error = %e, "RequestVote failed");
                }
            }
        });
    }

    fn send_append_logs(&self, peer: NodeId, args: AppendLogsArgs) {
        let transport = Arc::clone(&self.transport);
        let metrics = Arc::clone(&self.metrics);
        let tx = self.tx.clone();
        let limit = self.options.rpc_timeout;
        let node = self.node.id();
        tokio::spawn(async move {
            let term = args.term;
            match with_timeout(limit, transport.append_logs(peer, args)).await {
                Ok(reply) => {
                    let _ = tx.send(RaftMsg::AppendResult { peer, reply });
                }
                Err(e) => {
                    metrics.inc_counter("raft.transport_failures");
                    debug!(node, peer, term, error = %e, "AppendLogs failed");
                }
            }
        });
    }
}

async fn with_timeout<T>(limit: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| QuorumError::Timeout)?
}

async fn run_applier<M: StateMachine>(
    node: NodeId,
    mut state_machine: M,
    mut rx: mpsc::UnboundedReceiver<Vec<LogEntry>>,
) {
    while let Some(batch) = rx.recv().await {
        for entry in &batch {
            state_machine.apply(entry);
        }
        if let Some(last) = batch.last() {
            debug!(node, index = last.index, "Applied committed entries");
        }
    }
}
