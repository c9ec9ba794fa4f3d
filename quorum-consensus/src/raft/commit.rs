use super::log::{LogEntry, LogStore};
use super::node::{NodeRole, RaftNode};
use super::storage::StableStore;
use quorum_common::types::LogIndex;
use tracing::{debug, info};

/// The highest index replicated on at least `quorum` of the given match
/// indexes.
pub(crate) fn majority_match(mut matches: Vec<LogIndex>, quorum: usize) -> LogIndex {
    if quorum == 0 || matches.len() < quorum {
        return 0;
    }
    matches.sort_unstable_by(|a, b| b.cmp(a));
    matches[quorum - 1]
}

impl<L: LogStore, S: StableStore> RaftNode<L, S> {
    /// Leader only: moves the commit index to the highest entry of the
    /// current term held by a majority. Entries from earlier terms are only
    /// committed indirectly, through a later entry of the current term.
    pub(crate) fn advance_commit_index(&mut self) -> bool {
        if self.role != NodeRole::Leader {
            return false;
        }
        let Some(leader) = self.leader.as_ref() else {
            return false;
        };
        let mut matches: Vec<LogIndex> = leader.match_indexes().collect();
        matches.push(self.log.last_index());
        let candidate = majority_match(matches, self.quorum());

        if candidate <= self.commit_index {
            return false;
        }
        if self.log.term_at(candidate) != Some(self.current_term) {
            debug!(
                node = self.id,
                term = self.current_term,
                index = candidate,
                "Majority entry is from an earlier term, not committing"
            );
            return false;
        }
        info!(
            node = self.id,
            term = self.current_term,
            from = self.commit_index,
            to = candidate,
            "Commit index advanced"
        );
        self.commit_index = candidate;
        true
    }

    /// Drains committed entries that have not been applied yet, in log
    /// order, and marks them applied.
    pub fn take_committed(&mut self) -> Vec<LogEntry> {
        let mut applied = Vec::new();
        while self.last_applied < self.commit_index {
            let next = self.last_applied + 1;
            match self.log.entry_at(next) {
                Some(entry) => applied.push(entry.clone()),
                None => break,
            }
            self.last_applied = next;
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::log::MemLog;
    use crate::raft::node::tests::options;
    use crate::raft::rpc::{AppendLogsReply, RequestVoteReply};
    use crate::raft::storage::MemStableStore;
    use quorum_common::types::{NodeId, Term};

    #[test]
    fn test_majority_match() {
        assert_eq!(majority_match(vec![5], 1), 5);
        assert_eq!(majority_match(vec![3, 1, 2], 2), 2);
        assert_eq!(majority_match(vec![0, 4, 4, 2, 9], 3), 4);
        assert_eq!(majority_match(vec![1, 2, 3, 4], 3), 2);
        assert_eq!(majority_match(vec![], 1), 0);
    }

    fn leader(members: &[NodeId], terms: &[Term], term: Term) -> RaftNode<MemLog, MemStableStore> {
        let log: MemLog = terms
            .iter()
            .enumerate()
            .map(|(i, &t)| LogEntry::new(t, i as LogIndex + 1, vec![i as u8]))
            .collect::<Vec<_>>()
            .into();
        let mut node = RaftNode::new(&options(1, members), log, MemStableStore::new()).unwrap();
        node.become_follower(term - 1).unwrap();
        node.start_election().unwrap();
        for &peer in &members[1..] {
            if node.is_leader() {
                break;
            }
            let reply = RequestVoteReply {
                term,
                vote_granted: true,
            };
            node.handle_vote_reply(peer, term, &reply).unwrap();
        }
        assert!(node.is_leader());
        node
    }

    fn ack(peer: NodeId, term: Term, match_index: LogIndex) -> AppendLogsReply {
        AppendLogsReply {
            peer_id: peer,
            term,
            append_term: term,
            prev_log_index: 0,
            prev_log_term: 0,
            entries_len: match_index,
            success: true,
        }
    }

    #[test]
    fn test_commit_requires_majority() {
        let mut node = leader(&[1, 2, 3, 4, 5], &[], 1);
        node.start(vec![1]).unwrap();
        node.start(vec![2]).unwrap();

        node.handle_append_logs_reply(2, &ack(2, 1, 2)).unwrap();
        assert_eq!(node.commit_index(), 0, "two of five is not a majority");
        node.handle_append_logs_reply(3, &ack(3, 1, 1)).unwrap();
        assert_eq!(node.commit_index(), 1);
        node.handle_append_logs_reply(4, &ack(4, 1, 2)).unwrap();
        assert_eq!(node.commit_index(), 2);
    }

    #[test]
    fn test_never_commits_earlier_term_by_counting() {
        // Entry 2 from term 2 sits on a majority but was not created by
        // this leader.
        let mut node = leader(&[1, 2, 3], &[1, 2], 4);
        node.handle_append_logs_reply(2, &ack(2, 4, 2)).unwrap();
        assert_eq!(node.commit_index(), 0);

        let (index, _) = node.start(vec![9]).unwrap();
        assert_eq!(index, 3);
        node.handle_append_logs_reply(2, &ack(2, 4, 3)).unwrap();
        assert_eq!(node.commit_index(), 3, "earlier entries commit indirectly");
    }

    #[test]
    fn test_single_node_commits_on_start() {
        let mut node = leader(&[1], &[], 1);
        let (index, term) = node.start(vec![7]).unwrap();
        assert_eq!((index, term), (1, 1));
        assert_eq!(node.commit_index(), 1);
    }

    #[test]
    fn test_take_committed_applies_in_order() {
        let mut node = leader(&[1], &[], 1);
        node.start(vec![1]).unwrap();
        node.start(vec![2]).unwrap();
        let applied = node.take_committed();
        assert_eq!(
            applied.iter().map(|e| e.index).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(node.last_applied(), 2);
        assert!(node.take_committed().is_empty(), "entries apply exactly once");
    }

    #[test]
    fn test_follower_does_not_advance_commit() {
        let mut node = leader(&[1, 2, 3], &[], 1);
        node.become_follower(2).unwrap();
        assert!(!node.advance_commit_index());
    }
}
