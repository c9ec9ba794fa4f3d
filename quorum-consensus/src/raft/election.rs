//! Leader election: starting campaigns, answering RequestVote, and counting
//! the replies.

use super::log::LogStore;
use super::node::{Handled, NodeRole, RaftNode};
use super::rpc::{RequestVoteArgs, RequestVoteReply};
use super::storage::StableStore;
use quorum_common::error::Result;
use quorum_common::types::{NodeId, Term};
use tracing::{debug, info};

impl<L: LogStore, S: StableStore> RaftNode<L, S> {
    /// The election timer fired. Followers and candidates start a new term
    /// and return the RequestVote to send to every peer; a leader ignores
    /// the timer and gets `None`.
    pub fn start_election(&mut self) -> Result<Option<RequestVoteArgs>> {
        if self.role == NodeRole::Leader {
            return Ok(None);
        }
        self.become_candidate()?;
        let args = RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        if self.votes_received.len() >= self.quorum() {
            self.become_leader();
        }
        Ok(Some(args))
    }

    /// Candidate's log is at least as up to date as ours: compare the last
    /// entries' terms, then the log lengths.
    fn candidate_log_is_current(&self, args: &RequestVoteArgs) -> bool {
        (args.last_log_term, args.last_log_index) >= (self.log.last_term(), self.log.last_index())
    }

    /// Handles a RequestVote RPC as a voter. The vote is persisted before
    /// the reply is returned.
    pub fn handle_request_vote(
        &mut self,
        args: &RequestVoteArgs,
    ) -> Result<Handled<RequestVoteReply>> {
        if args.term < self.current_term {
            debug!(
                node = self.id,
                term = self.current_term,
                candidate = args.candidate_id,
                candidate_term = args.term,
                "Rejecting vote for stale term"
            );
            return Ok(self.vote_reply(false));
        }

        self.observe_term(args.term)?;

        let can_vote = self
            .voted_for
            .map_or(true, |voted| voted == args.candidate_id);
        if !can_vote || !self.candidate_log_is_current(args) {
            debug!(
                node = self.id,
                term = self.current_term,
                candidate = args.candidate_id,
                voted_for = ?self.voted_for,
                "Denying vote"
            );
            return Ok(self.vote_reply(false));
        }

        if self.voted_for != Some(args.candidate_id) {
            self.voted_for = Some(args.candidate_id);
            self.persist_hard_state()?;
        }
        info!(
            node = self.id,
            term = self.current_term,
            candidate = args.candidate_id,
            "Granting vote"
        );
        Ok(self.vote_reply(true))
    }

    fn vote_reply(&self, vote_granted: bool) -> Handled<RequestVoteReply> {
        Handled {
            reply: RequestVoteReply {
                term: self.current_term,
                vote_granted,
            },
            reset_election_timer: vote_granted,
        }
    }

    /// Folds a RequestVote reply into the campaign. `request_term` is the
    /// term the request was sent in; replies to abandoned campaigns are
    /// dropped. Returns true exactly when this reply made us leader.
    pub fn handle_vote_reply(
        &mut self,
        from: NodeId,
        request_term: Term,
        reply: &RequestVoteReply,
    ) -> Result<bool> {
        if self.observe_term(reply.term)? {
            return Ok(false);
        }
        if self.role != NodeRole::Candidate
            || request_term != self.current_term
            || reply.term != self.current_term
        {
            debug!(
                node = self.id,
                term = self.current_term,
                peer = from,
                reply_term = reply.term,
                "Discarding stale vote reply"
            );
            return Ok(false);
        }
        if !reply.vote_granted || !self.peers.contains(&from) {
            return Ok(false);
        }
        if !self.votes_received.insert(from) {
            return Ok(false);
        }
        debug!(
            node = self.id,
            term = self.current_term,
            peer = from,
            votes = self.votes_received.len(),
            quorum = self.quorum(),
            "Vote granted"
        );
        if self.votes_received.len() >= self.quorum() {
            self.become_leader();
            return Ok(true);
        }
        Ok(false)
    }
}
