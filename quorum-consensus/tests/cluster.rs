//! In-process clusters running the full async driver over a LocalNetwork.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use quorum_common::error::{QuorumError, Result};
use quorum_common::metrics::NoopMetrics;
use quorum_common::types::{ClusterConfig, NodeId, Term};
use quorum_common::types::LogIndex;
use quorum_consensus::raft::{
    AppendLogsArgs, ChannelStateMachine, FileLog, FileStableStore, HardState, LocalNetwork,
    LogEntry, LogStore, MemLog, MemStableStore, NodeStatus, RaftDriver, RaftHandle, RaftNode,
    RaftOptions, RequestVoteArgs, StableStore,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_config(ids: &[NodeId]) -> ClusterConfig {
    let mut config = ClusterConfig::local(ids);
    config.election_timeout_min_ms = 150;
    config.election_timeout_max_ms = 300;
    config.heartbeat_interval_ms = 30;
    config.rpc_timeout_ms = 50;
    config
}

struct Member {
    handle: RaftHandle,
    task: JoinHandle<Result<()>>,
    applied: UnboundedReceiver<LogEntry>,
}

fn spawn_member<L: LogStore, S: StableStore>(
    network: &Arc<LocalNetwork>,
    config: &ClusterConfig,
    id: NodeId,
    log: L,
    stable: S,
) -> Member {
    let options = RaftOptions::from_config(config, id).unwrap();
    let node = RaftNode::new(&options, log, stable).unwrap();
    let (state_machine, applied) = ChannelStateMachine::new();
    let (handle, task) = RaftDriver::spawn(
        node,
        options,
        network.transport_for(id),
        state_machine,
        Arc::new(NoopMetrics),
    );
    network.register(handle.clone());
    Member {
        handle,
        task,
        applied,
    }
}

/// Hard state store on a disk that rejects every write.
struct FullDiskStableStore;

impl StableStore for FullDiskStableStore {
    fn save(&mut self, _state: &HardState) -> Result<()> {
        Err(QuorumError::Durability("no space left on device".into()))
    }

    fn load(&self) -> Result<Option<HardState>> {
        Ok(None)
    }
}

/// Log on a disk that rejects every append.
#[derive(Default)]
struct FullDiskLog(MemLog);

impl LogStore for FullDiskLog {
    fn append(&mut self, _entries: &[LogEntry]) -> Result<()> {
        Err(QuorumError::Durability("no space left on device".into()))
    }

    fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        self.0.entry_at(index)
    }

    fn last_index(&self) -> LogIndex {
        self.0.last_index()
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        self.0.truncate_from(index)
    }
}

struct TestCluster {
    network: Arc<LocalNetwork>,
    members: BTreeMap<NodeId, Member>,
}

impl TestCluster {
    fn start(size: u64) -> Self {
        init_tracing();
        let ids: Vec<NodeId> = (1..=size).collect();
        let config = fast_config(&ids);
        let network = LocalNetwork::new();
        let members = ids
            .iter()
            .map(|&id| {
                let member =
                    spawn_member(&network, &config, id, MemLog::new(), MemStableStore::new());
                (id, member)
            })
            .collect();
        Self { network, members }
    }

    fn handle(&self, id: NodeId) -> &RaftHandle {
        &self.members[&id].handle
    }

    async fn statuses(&self, ids: &[NodeId]) -> Vec<NodeStatus> {
        let mut statuses = Vec::new();
        for id in ids {
            if let Ok(status) = self.handle(*id).status().await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Waits until one of `ids` leads a term that none of `ids` has passed.
    async fn wait_for_leader(&self, ids: &[NodeId]) -> (NodeId, Term) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let statuses = self.statuses(ids).await;
            let max_term = statuses.iter().map(|s| s.term).max().unwrap_or(0);
            let leaders: Vec<&NodeStatus> = statuses
                .iter()
                .filter(|s| s.is_leader() && s.term == max_term)
                .collect();
            assert!(leaders.len() <= 1, "two leaders in term {}", max_term);
            if let Some(leader) = leaders.first() {
                return (leader.id, leader.term);
            }
            assert!(Instant::now() < deadline, "no leader elected among {:?}", ids);
            sleep(Duration::from_millis(20)).await;
        }
    }

    async fn next_applied(&mut self, id: NodeId) -> LogEntry {
        let rx = &mut self.members.get_mut(&id).unwrap().applied;
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for an applied entry")
            .expect("applier closed")
    }

    async fn shutdown(self) {
        for member in self.members.values() {
            member.handle.shutdown();
        }
        for (_, member) in self.members {
            member.task.await.unwrap().unwrap();
        }
    }
}

#[tokio::test]
async fn test_elects_one_leader() {
    let cluster = TestCluster::start(3);
    let (leader, term) = cluster.wait_for_leader(&[1, 2, 3]).await;
    assert!(term >= 1);

    // Followers settle on the leader's term.
    sleep(Duration::from_millis(200)).await;
    for status in cluster.statuses(&[1, 2, 3]).await {
        if status.id != leader && status.term == term {
            assert!(!status.is_leader());
            assert_eq!(status.leader_id, Some(leader));
        }
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_replicates_and_applies_commands() {
    let mut cluster = TestCluster::start(3);
    let (leader, term) = cluster.wait_for_leader(&[1, 2, 3]).await;

    let (index, start_term) = cluster.handle(leader).start(&b"first"[..]).await.unwrap();
    assert_eq!((index, start_term), (1, term));
    cluster.handle(leader).start(&b"second"[..]).await.unwrap();

    for id in [1, 2, 3] {
        let first = cluster.next_applied(id).await;
        let second = cluster.next_applied(id).await;
        assert_eq!(first.index, 1);
        assert_eq!(first.command_buf.as_ref(), b"first");
        assert_eq!(second.index, 2);
        assert_eq!(second.command_buf.as_ref(), b"second");
    }

    let follower = [1, 2, 3].into_iter().find(|&id| id != leader).unwrap();
    match cluster.handle(follower).start(&b"nope"[..]).await {
        Err(QuorumError::NotLeader { leader_hint }) => assert_eq!(leader_hint, Some(leader)),
        other => panic!("expected NotLeader, got {:?}", other),
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_partitioned_leader_is_replaced() {
    let mut cluster = TestCluster::start(3);
    let (old_leader, old_term) = cluster.wait_for_leader(&[1, 2, 3]).await;
    let rest: Vec<NodeId> = [1, 2, 3]
        .into_iter()
        .filter(|&id| id != old_leader)
        .collect();

    cluster.network.isolate(old_leader);
    let (index, _) = cluster.handle(old_leader).start(&b"lost"[..]).await.unwrap();
    assert_eq!(index, 1);

    let (new_leader, new_term) = cluster.wait_for_leader(&rest).await;
    assert!(new_term > old_term);
    let (index, _) = cluster.handle(new_leader).start(&b"kept"[..]).await.unwrap();
    assert_eq!(index, 1);
    for &id in &rest {
        assert_eq!(cluster.next_applied(id).await.command_buf.as_ref(), b"kept");
    }

    cluster.network.heal(old_leader);
    let entry = cluster.next_applied(old_leader).await;
    assert_eq!(entry.index, 1);
    assert_eq!(entry.command_buf.as_ref(), b"kept");

    let status = cluster.handle(old_leader).status().await.unwrap();
    assert!(!status.is_leader());
    assert!(status.term >= new_term);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_single_node_commits_alone() {
    let mut cluster = TestCluster::start(1);
    let (leader, term) = cluster.wait_for_leader(&[1]).await;
    assert_eq!(leader, 1);

    let (index, start_term) = cluster.handle(1).start(&b"solo"[..]).await.unwrap();
    assert_eq!((index, start_term), (1, term));
    let entry = cluster.next_applied(1).await;
    assert_eq!(entry.command_buf.as_ref(), b"solo");
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_node() {
    let cluster = TestCluster::start(1);
    let handle = cluster.handle(1).clone();
    cluster.shutdown().await;

    assert!(handle.is_stopped());
    assert!(matches!(handle.status().await, Err(QuorumError::Stopped)));
    assert!(matches!(
        handle.start(&b"late"[..]).await,
        Err(QuorumError::Stopped)
    ));
}

#[tokio::test]
async fn test_restart_from_disk() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("raft.log");
    let state_path = dir.path().join("hard_state");
    let config = fast_config(&[1]);

    let network = LocalNetwork::new();
    let mut member = spawn_member(
        &network,
        &config,
        1,
        FileLog::open(&log_path, true).unwrap(),
        FileStableStore::new(&state_path),
    );
    let mut first_term = 0;
    for command in ["a", "b"] {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match member.handle.start(command).await {
                Ok((_, term)) => {
                    first_term = term;
                    break;
                }
                Err(QuorumError::NotLeader { .. }) => {
                    assert!(Instant::now() < deadline, "node never became leader");
                    sleep(Duration::from_millis(20)).await;
                }
                Err(e) => panic!("start failed: {}", e),
            }
        }
    }
    for expected in [1, 2] {
        let entry = timeout(Duration::from_secs(5), member.applied.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.index, expected);
    }
    member.handle.shutdown();
    member.task.await.unwrap().unwrap();

    let log = FileLog::open(&log_path, true).unwrap();
    assert_eq!(log.last_index(), 2);
    let stable = FileStableStore::new(&state_path);
    assert_eq!(stable.load().unwrap().unwrap().current_term, first_term);

    let network = LocalNetwork::new();
    let mut member = spawn_member(&network, &config, 1, log, stable);
    let cluster_deadline = Instant::now() + Duration::from_secs(10);
    let (index, term) = loop {
        match member.handle.start("c").await {
            Ok(accepted) => break accepted,
            Err(QuorumError::NotLeader { .. }) => {
                assert!(Instant::now() < cluster_deadline, "node never became leader");
                sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("start failed: {}", e),
        }
    };
    assert_eq!(index, 3);
    assert!(term > first_term);

    // Applied state is volatile, so the whole log is replayed.
    let mut replayed = Vec::new();
    for _ in 0..3 {
        let entry = timeout(Duration::from_secs(5), member.applied.recv())
            .await
            .unwrap()
            .unwrap();
        replayed.push(entry.command_buf);
    }
    assert_eq!(replayed, vec!["a", "b", "c"]);
    member.handle.shutdown();
    member.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_failed_vote_write_stops_node() {
    init_tracing();
    let network = LocalNetwork::new();
    let member = spawn_member(
        &network,
        &fast_config(&[1, 2, 3]),
        1,
        MemLog::new(),
        FullDiskStableStore,
    );

    let args = RequestVoteArgs {
        term: 5,
        candidate_id: 2,
        last_log_index: 0,
        last_log_term: 0,
    };
    assert!(matches!(
        member.handle.request_vote(args).await,
        Err(QuorumError::Stopped)
    ));
    let exit = timeout(Duration::from_secs(5), member.task).await.unwrap();
    assert!(matches!(exit.unwrap(), Err(QuorumError::Durability(_))));
    assert!(member.handle.is_stopped());
}

#[tokio::test]
async fn test_failed_log_write_stops_node() {
    init_tracing();
    let network = LocalNetwork::new();
    let member = spawn_member(
        &network,
        &fast_config(&[1, 2, 3]),
        1,
        FullDiskLog::default(),
        MemStableStore::new(),
    );

    let args = AppendLogsArgs {
        term: 100,
        leader_id: 2,
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![LogEntry::new(100, 1, &b"x"[..])],
        leader_committed_index: 1,
    };
    assert!(matches!(
        member.handle.append_logs(args).await,
        Err(QuorumError::Stopped)
    ));
    let exit = timeout(Duration::from_secs(5), member.task).await.unwrap();
    assert!(matches!(exit.unwrap(), Err(QuorumError::Durability(_))));
    assert!(member.handle.is_stopped());
}
