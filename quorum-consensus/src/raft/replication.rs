//! Log replication. Leader side: per-peer progress cursors, building
//! AppendLogs and folding replies back in. Follower side: the consistency
//! check and conflict resolution for inbound AppendLogs.

use std::collections::BTreeMap;

use super::log::{LogEntry, LogStore};
use super::node::{Handled, NodeRole, RaftNode};
use super::rpc::{AppendLogsArgs, AppendLogsReply};
use super::storage::StableStore;
use bytes::Bytes;
use quorum_common::error::{QuorumError, Result};
use quorum_common::types::{LogIndex, NodeId, Term};
use tracing::{debug, error, info, warn};

/// Replication cursor for one follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub next_index: LogIndex,  // Next entry to send
    pub match_index: LogIndex, // Highest entry known to be replicated
}

/// Volatile state on leaders, rebuilt after every election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderState {
    progress: BTreeMap<NodeId, Progress>,
}

impl LeaderState {
    pub fn new(peers: &[NodeId], last_log_index: LogIndex) -> Self {
        let progress = peers
            .iter()
            .map(|&peer| {
                (
                    peer,
                    Progress {
                        next_index: last_log_index + 1,
                        match_index: 0,
                    },
                )
            })
            .collect();
        Self { progress }
    }

    pub fn progress(&self, peer: NodeId) -> Option<Progress> {
        self.progress.get(&peer).copied()
    }

    pub fn match_indexes(&self) -> impl Iterator<Item = LogIndex> + '_ {
        self.progress.values().map(|p| p.match_index)
    }

    /// Records that `peer` holds everything up to `match_index`. Replies may
    /// arrive out of order, so neither cursor ever moves backwards here.
    fn record_success(&mut self, peer: NodeId, match_index: LogIndex) -> bool {
        let Some(p) = self.progress.get_mut(&peer) else {
            return false;
        };
        let before = *p;
        p.match_index = p.match_index.max(match_index);
        p.next_index = p.next_index.max(p.match_index + 1);
        *p != before
    }

    /// Moves `next_index` back after the follower rejected the entry at
    /// `rejected_prev`. `hint` is the first index of that entry's term in
    /// the leader's log; skipping the whole term saves a round trip per
    /// entry. Duplicate or outdated rejections leave the cursor alone.
    fn back_off(&mut self, peer: NodeId, rejected_prev: LogIndex, hint: LogIndex) -> bool {
        let Some(p) = self.progress.get_mut(&peer) else {
            return false;
        };
        if rejected_prev == 0 || p.next_index != rejected_prev + 1 || rejected_prev <= p.match_index
        {
            return false;
        }
        p.next_index = hint.clamp(p.match_index + 1, rejected_prev);
        true
    }
}

/// What the leader should do after an AppendLogs reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Stale, duplicate or otherwise irrelevant.
    Ignored,
    /// The follower's progress was recorded and it holds the whole log.
    Accepted,
    /// Progress was recorded but the follower still lags; send the next
    /// batch right away.
    Continue(AppendLogsArgs),
    /// The follower's log conflicts; send this request right away.
    Retry(AppendLogsArgs),
    /// The reply carried a newer term and we are no longer leader.
    SteppedDown,
}

impl<L: LogStore, S: StableStore> RaftNode<L, S> {
    /// Appends a client command to the leader's log. Returns the index it
    /// will occupy if committed and the current term.
    pub fn start(&mut self, command: impl Into<Bytes>) -> Result<(LogIndex, Term)> {
        if self.role != NodeRole::Leader {
            return Err(QuorumError::NotLeader {
                leader_hint: self.leader_id,
            });
        }
        let index = self.log.last_index() + 1;
        let entry = LogEntry::new(self.current_term, index, command);
        self.log.append(std::slice::from_ref(&entry))?;
        debug!(
            node = self.id,
            term = self.current_term,
            index,
            "Appended client command"
        );
        self.advance_commit_index();
        Ok((index, self.current_term))
    }

    /// Builds the next AppendLogs for `peer` from its progress cursor.
    pub fn append_logs_args(&self, peer: NodeId) -> Option<AppendLogsArgs> {
        let progress = self.leader.as_ref()?.progress(peer)?;
        let prev_log_index = progress.next_index - 1;
        Some(AppendLogsArgs {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
            entries: self
                .log
                .entries_from(progress.next_index, self.max_append_entries),
            leader_committed_index: self.commit_index,
        })
    }

    /// One AppendLogs per peer; heartbeats for peers that are caught up.
    /// Empty unless leader.
    pub fn broadcast_append_logs(&self) -> Vec<(NodeId, AppendLogsArgs)> {
        self.peers
            .iter()
            .filter_map(|&peer| self.append_logs_args(peer).map(|args| (peer, args)))
            .collect()
    }

    fn append_reply(&self, args: &AppendLogsArgs, success: bool, entries_len: u64) -> AppendLogsReply {
        AppendLogsReply {
            peer_id: self.id,
            term: self.current_term,
            append_term: args.term,
            prev_log_index: args.prev_log_index,
            prev_log_term: args.prev_log_term,
            entries_len,
            success,
        }
    }

    /// Handles AppendLogs RPC as a follower.
    pub fn handle_append_logs(&mut self, args: &AppendLogsArgs) -> Result<Handled<AppendLogsReply>> {
        // 1. Reject if term is older
        if args.term < self.current_term {
            debug!(
                node = self.id,
                term = self.current_term,
                leader = args.leader_id,
                leader_term = args.term,
                "Rejecting AppendLogs from stale leader"
            );
            return Ok(Handled {
                reply: self.append_reply(args, false, 0),
                reset_election_timer: false,
            });
        }

        // 2. A current leader exists: adopt its term and follow it
        self.observe_term(args.term)?;
        if self.role == NodeRole::Leader {
            error!(
                node = self.id,
                term = self.current_term,
                other = args.leader_id,
                "Two leaders in one term"
            );
            return Ok(Handled {
                reply: self.append_reply(args, false, 0),
                reset_election_timer: false,
            });
        }
        if self.role == NodeRole::Candidate {
            self.become_follower(args.term)?;
        }
        self.leader_id = Some(args.leader_id);

        let contiguous = args
            .entries
            .iter()
            .zip(args.prev_log_index + 1..)
            .all(|(entry, index)| entry.index == index);
        if !contiguous {
            warn!(
                node = self.id,
                leader = args.leader_id,
                "Rejecting AppendLogs with misnumbered entries"
            );
            return Ok(Handled {
                reply: self.append_reply(args, false, 0),
                reset_election_timer: true,
            });
        }

        // 3. Validate previous entry consistency
        if self.log.term_at(args.prev_log_index) != Some(args.prev_log_term) {
            debug!(
                node = self.id,
                term = self.current_term,
                prev_log_index = args.prev_log_index,
                prev_log_term = args.prev_log_term,
                last_log_index = self.log.last_index(),
                "Log inconsistent with leader"
            );
            return Ok(Handled {
                reply: self.append_reply(args, false, 0),
                reset_election_timer: true,
            });
        }

        // 4. Append new entries, overwriting from the first conflict
        for (offset, entry) in args.entries.iter().enumerate() {
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(term) => {
                    info!(
                        node = self.id,
                        index = entry.index,
                        ours = term,
                        theirs = entry.term,
                        "Truncating conflicting log suffix"
                    );
                    self.log.truncate_from(entry.index)?;
                    self.log.append(&args.entries[offset..])?;
                    break;
                }
                None => {
                    self.log.append(&args.entries[offset..])?;
                    break;
                }
            }
        }

        // 5. Update commit index
        let last_new_index = args.prev_log_index + args.entries.len() as u64;
        let commit = args.leader_committed_index.min(last_new_index);
        if commit > self.commit_index {
            debug!(node = self.id, commit_index = commit, "Follower commit index advanced");
            self.commit_index = commit;
        }

        Ok(Handled {
            reply: self.append_reply(args, true, args.entries.len() as u64),
            reset_election_timer: true,
        })
    }

    /// Folds an AppendLogs reply into the progress cursor of `from`, the
    /// peer the request was sent to.
    pub fn handle_append_logs_reply(
        &mut self,
        from: NodeId,
        reply: &AppendLogsReply,
    ) -> Result<ReplyOutcome> {
        if reply.peer_id != from {
            warn!(
                node = self.id,
                peer = from,
                claimed = reply.peer_id,
                "AppendLogs reply names a different sender"
            );
            return Ok(ReplyOutcome::Ignored);
        }
        if self.observe_term(reply.term)? {
            return Ok(ReplyOutcome::SteppedDown);
        }
        if self.role != NodeRole::Leader || reply.append_term != self.current_term {
            return Ok(ReplyOutcome::Ignored);
        }
        let peer = from;

        if reply.success {
            let match_index = reply.match_index();
            if match_index > self.log.last_index() {
                warn!(
                    node = self.id,
                    peer,
                    match_index,
                    "Reply claims entries the leader does not have"
                );
                return Ok(ReplyOutcome::Ignored);
            }
            let advanced = match self.leader.as_mut() {
                Some(leader) => leader.record_success(peer, match_index),
                None => false,
            };
            if !advanced {
                return Ok(ReplyOutcome::Ignored);
            }
            self.advance_commit_index();
            let lagging = self
                .leader
                .as_ref()
                .and_then(|leader| leader.progress(peer))
                .map_or(false, |p| p.next_index <= self.log.last_index());
            if lagging {
                if let Some(args) = self.append_logs_args(peer) {
                    return Ok(ReplyOutcome::Continue(args));
                }
            }
            return Ok(ReplyOutcome::Accepted);
        }

        let hint = self.log.first_index_of_term(reply.prev_log_index);
        let moved = match self.leader.as_mut() {
            Some(leader) => leader.back_off(peer, reply.prev_log_index, hint),
            None => false,
        };
        if !moved {
            return Ok(ReplyOutcome::Ignored);
        }
        match self.append_logs_args(peer) {
            Some(args) => {
                debug!(
                    node = self.id,
                    peer,
                    next_index = args.prev_log_index + 1,
                    "Follower log conflicts, backing off"
                );
                Ok(ReplyOutcome::Retry(args))
            }
            None => Ok(ReplyOutcome::Ignored),
        }
    }
}
