use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace};
use rand::Rng;

use crate::clock::Instant;
use crate::error::{Error, Result};
use crate::pending_call::PendingCallQueue;
use crate::types::{
    ElectionState, EntryType, GroupId, GroupMembers, LogEntry, LogIndex, MembershipOp, NodeId, Role,
    Term,
};

/// Outcome of evaluating an inbound `RequestVote`. Carries no header/group
/// so `Group` stays free of transport concerns.
#[derive(Debug, Clone, Copy)]
pub struct VoteDecision {
    pub term: Term,
    pub granted: bool,
}

/// Outcome of evaluating an inbound `AppendEntries`.
#[derive(Debug, Clone, Copy)]
pub struct AppendDecision {
    pub term: Term,
    pub success: bool,
    /// Set when `success`, the log index the reply must be held until
    /// persisted. `None` for the stale-term immediate-rejection path.
    pub gate_on_index: Option<LogIndex>,
}

/// Per-candidacy ballot the engine broadcasts to every voting member,
/// including this node (see `Group::become_candidate`).
#[derive(Debug, Clone, Copy)]
pub struct Ballot {
    pub term: Term,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

pub struct Group {
    pub id: GroupId,

    // In-memory / latest.
    pub election_state: ElectionState,
    pub committed_members: GroupMembers,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    pub pending_entries: Vec<LogEntry>,

    // Persisted mirror. `None` means "nothing durable yet".
    pub persisted_election_state: ElectionState,
    pub persisted_last_index: Option<LogIndex>,
    pub persisted_last_term: Option<Term>,

    // Volatile.
    pub role: Role,
    pub leader_commit_index: LogIndex,
    pub commit_index: LogIndex,
    pub election_deadline: Instant,
    pub votes: BTreeSet<NodeId>,
    pub current_members: GroupMembers,
    pub next_index: HashMap<NodeId, LogIndex>,
    pub match_index: HashMap<NodeId, LogIndex>,
    pub pending_calls: PendingCallQueue,

    /// Per-peer FIFO of the last entry index carried by each outstanding
    /// `AppendEntries` we've sent, so the reply (which the wire format
    /// carries no index on) can still be correlated by request identity.
    /// `None` marks a heartbeat with no entries.
    pub outstanding_append: HashMap<NodeId, std::collections::VecDeque<Option<LogIndex>>>,

    /// How far `(0, commit_index]` has actually been streamed from
    /// Storage and applied (events emitted, membership changes merged).
    /// `commit_index` itself may run ahead of this while an apply task for
    /// the previous range is still in flight; `applying` guards against
    /// starting a second, overlapping stream for the same group.
    pub applied_through: LogIndex,
    pub applying: bool,
}

impl Group {
    pub fn new(
        id: GroupId,
        initial_members: GroupMembers,
        now: Instant,
        election_timeout_min: Duration,
        election_timeout_max: Duration,
    ) -> Self {
        Group {
            id,
            election_state: ElectionState::default(),
            committed_members: initial_members.clone(),
            last_log_index: 0,
            last_log_term: 0,
            pending_entries: Vec::new(),
            persisted_election_state: ElectionState::default(),
            persisted_last_index: None,
            persisted_last_term: None,
            role: Role::Follower,
            leader_commit_index: 0,
            commit_index: 0,
            election_deadline: random_deadline(now, election_timeout_min, election_timeout_max),
            votes: BTreeSet::new(),
            current_members: initial_members,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            pending_calls: PendingCallQueue::default(),
            outstanding_append: HashMap::new(),
            applied_through: 0,
            applying: false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.election_state != self.persisted_election_state || !self.pending_entries.is_empty()
    }

    pub fn reset_election_deadline(&mut self, now: Instant, min: Duration, max: Duration) {
        self.election_deadline = random_deadline(now, min, max);
    }

    /// Leader->Candidate is a programming error,
    /// never a legitimate transition.
    pub fn become_candidate(
        &mut self,
        self_id: NodeId,
        now: Instant,
        min: Duration,
        max: Duration,
    ) -> Result<Ballot> {
        if self.role == Role::Leader {
            return Err(Error::Invariant(format!(
                "group {}: attempted Leader->Candidate transition",
                self.id
            )));
        }
        self.role = Role::Candidate;
        self.election_state.current_term += 1;
        self.election_state.voted_for = Some(self_id);
        self.votes.clear();
        // TODO: should scan the uncommitted tail for membership changes too.
        self.current_members = self.committed_members.clone();
        self.reset_election_deadline(now, min, max);
        debug!("group {}: became candidate for term {}", self.id, self.election_state.current_term);
        Ok(Ballot {
            term: self.election_state.current_term,
            last_log_index: self.last_log_index,
            last_log_term: self.last_log_term,
        })
    }

    /// The returned decision is not yet durable; the caller must hold the
    /// reply on a pending call keyed on `term` until it is (see `pending_call`).
    pub fn handle_request_vote(&mut self, term: Term, candidate: NodeId) -> VoteDecision {
        if term < self.election_state.current_term {
            return VoteDecision {
                term: self.election_state.current_term,
                granted: false,
            };
        }
        if term > self.election_state.current_term {
            self.adopt_term(term);
        }
        let granted = match self.election_state.voted_for {
            None => true,
            Some(v) if v == candidate => true,
            _ => false,
        };
        if granted {
            self.election_state.voted_for = Some(candidate);
        }
        VoteDecision {
            term: self.election_state.current_term,
            granted,
        }
    }

    /// Returns `Some(term)` the instant this node wins the election.
    pub fn handle_request_vote_response(&mut self, term: Term, granted: bool, voter: NodeId) -> Option<Term> {
        if term < self.election_state.current_term {
            return None;
        }
        if term > self.election_state.current_term {
            self.adopt_term(term);
            return None;
        }
        if self.role != Role::Candidate {
            return None;
        }
        if granted {
            self.votes.insert(voter);
        }
        if self.votes.len() >= self.current_members.quorum_size() {
            self.become_leader();
            return Some(self.election_state.current_term);
        }
        None
    }

    fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.next_index.clear();
        self.match_index.clear();
        for peer in self.current_members.all_peers() {
            self.next_index.insert(peer, self.last_log_index + 1);
            self.match_index.insert(peer, 0);
        }
        debug!("group {}: became leader for term {}", self.id, self.election_state.current_term);
    }

    /// Adopts a higher term observed from a peer: resets vote and steps
    /// down to Follower unless this node is a non-voting Observer.
    fn adopt_term(&mut self, term: Term) {
        self.election_state.current_term = term;
        self.election_state.voted_for = None;
        self.votes.clear();
        if self.role != Role::Observer {
            self.role = Role::Follower;
        }
    }

    /// Appends a new entry to this group's uncommitted log tail.
    pub fn add_log_entry(&mut self, entry_type: EntryType, payload: Bytes) -> Result<LogIndex> {
        if self.role != Role::Leader {
            return Err(Error::NotLeader(self.id));
        }
        self.last_log_index += 1;
        self.last_log_term = self.election_state.current_term;
        let index = self.last_log_index;
        self.pending_entries.push(LogEntry {
            term: self.last_log_term,
            index,
            entry_type,
            payload,
        });
        Ok(index)
    }

    /// The stale-term branch is answered immediately (`gate_on_index: None`);
    /// the success branch must be held until `persisted_last_index >= gate_on_index`.
    ///
    /// NOTE: does not check `prev_log_index`/`prev_log_term` consistency —
    /// left unimplemented; see DESIGN.md's Open Question decisions.
    pub fn handle_append_entries(
        &mut self,
        term: Term,
        leader_commit: LogIndex,
        entries: &[LogEntry],
    ) -> AppendDecision {
        if term < self.election_state.current_term {
            return AppendDecision {
                term: self.election_state.current_term,
                success: false,
                gate_on_index: None,
            };
        }
        if term > self.election_state.current_term {
            self.adopt_term(term);
        } else if self.role != Role::Observer {
            self.role = Role::Follower;
        }

        if let Some(last) = entries.last() {
            self.last_log_index = last.index;
            self.last_log_term = last.term;
        }
        self.pending_entries.extend_from_slice(entries);
        self.leader_commit_index = self.leader_commit_index.max(leader_commit);

        AppendDecision {
            term: self.election_state.current_term,
            success: true,
            gate_on_index: Some(self.last_log_index),
        }
    }

    /// `last_entry_index` is the index of the final entry in the batch that
    /// produced this reply, if any (heartbeats with no entries never move
    /// `next_index`/`match_index`).
    pub fn handle_append_entries_response(
        &mut self,
        peer: NodeId,
        term: Term,
        success: bool,
        last_entry_index: Option<LogIndex>,
    ) {
        if term > self.election_state.current_term {
            self.adopt_term(term);
            return;
        }
        if self.role != Role::Leader {
            return;
        }
        if success {
            if let Some(index) = last_entry_index {
                self.next_index.insert(peer, index + 1);
                self.match_index.insert(peer, index);
            }
        } else {
            let next = self.next_index.entry(peer).or_insert(1);
            *next = next.saturating_sub(1).max(1);
            trace!("group {}: peer {:?} rejected append, next_index now {}", self.id, peer, next);
        }
    }

    /// The corrected majority-index position: `indices[(len-1)/2]` after
    /// ascending sort (see DESIGN.md for why this departs from the source's
    /// off-by-one `indices[len/2 + 1]`).
    pub fn quorum_index(&self, self_id: NodeId) -> LogIndex {
        let mut indices: Vec<LogIndex> = self
            .current_members
            .voting
            .iter()
            .map(|&member| {
                if member == self_id {
                    self.last_log_index
                } else {
                    *self.match_index.get(&member).unwrap_or(&0)
                }
            })
            .collect();
        if indices.is_empty() {
            return 0;
        }
        indices.sort_unstable();
        indices[(indices.len() - 1) / 2]
    }

    /// Sets `commit_index = min(candidate_target, persisted_last_index)`.
    /// Never regresses; no-ops if `target <= commit_index`. Returns `true`
    /// if `commit_index` moved — the caller still has to trigger (or defer
    /// to an in-flight) apply task via `ready_to_apply`/`begin_apply`.
    pub fn advance_commit(&mut self, candidate_target: LogIndex) -> bool {
        let persisted_ceiling = self.persisted_last_index.unwrap_or(0);
        let target = candidate_target.min(persisted_ceiling);
        if target <= self.commit_index {
            return false;
        }
        self.commit_index = target;
        true
    }

    /// The `(applied_through, commit_index]` range still owed to Storage
    /// and the application, if any and if no apply task is already running.
    pub fn ready_to_apply(&self) -> Option<(LogIndex, LogIndex)> {
        if self.applying || self.applied_through >= self.commit_index {
            return None;
        }
        Some((self.applied_through, self.commit_index))
    }

    pub fn begin_apply(&mut self) {
        self.applying = true;
    }

    pub fn finish_apply(&mut self, applied_to: LogIndex, membership_changes: &[(MembershipOp, NodeId)]) {
        self.applying = false;
        self.applied_through = self.applied_through.max(applied_to);
        for &(op, node) in membership_changes {
            op.apply(&mut self.committed_members, node);
        }
    }

    pub fn record_outstanding_append(&mut self, peer: NodeId, last_entry_index: Option<LogIndex>) {
        self.outstanding_append.entry(peer).or_default().push_back(last_entry_index);
    }

    pub fn take_outstanding_append(&mut self, peer: NodeId) -> Option<LogIndex> {
        self.outstanding_append.get_mut(&peer).and_then(|q| q.pop_front()).flatten()
    }

    /// Packages this group's share of a write batch, draining
    /// `pending_entries` as the write protocol requires.
    pub fn drain_for_write(&mut self) -> (Option<ElectionState>, Vec<LogEntry>) {
        let election_state = if self.election_state != self.persisted_election_state {
            Some(self.election_state)
        } else {
            None
        };
        (election_state, std::mem::take(&mut self.pending_entries))
    }

    /// Restores entries that failed to persist back onto the pending tail,
    /// ahead of anything appended while the write was in flight, so the
    /// next write attempt sees them in the original log order.
    pub fn requeue_failed_write(&mut self, mut entries: Vec<LogEntry>) {
        if entries.is_empty() {
            return;
        }
        entries.extend(std::mem::take(&mut self.pending_entries));
        self.pending_entries = entries;
    }
}

fn random_deadline(now: Instant, min: Duration, max: Duration) -> Instant {
    let jitter_range = max.saturating_sub(min).as_nanos().max(1) as u64;
    let jitter = rand::thread_rng().gen_range(0..jitter_range);
    now + min + Duration::from_nanos(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;

    fn node(n: u32) -> NodeId {
        NonZeroU32::new(n).unwrap()
    }

    fn new_group(members: &[u32]) -> Group {
        let gm = GroupMembers::new(members.iter().map(|&n| node(n)));
        Group::new(1, gm, Instant::now(), Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn become_candidate_increments_term_and_votes_for_self() {
        let mut g = new_group(&[1, 2, 3]);
        let ballot = g.become_candidate(node(1), Instant::now(), Duration::from_millis(1), Duration::from_millis(2)).unwrap();
        assert_eq!(ballot.term, 1);
        assert_eq!(g.role, Role::Candidate);
        assert_eq!(g.election_state.voted_for, Some(node(1)));
        assert!(g.votes.is_empty());
    }

    #[test]
    fn become_candidate_from_leader_is_an_error() {
        let mut g = new_group(&[1, 2, 3]);
        g.role = Role::Leader;
        assert!(g.become_candidate(node(1), Instant::now(), Duration::from_millis(1), Duration::from_millis(2)).is_err());
    }

    #[test]
    fn single_node_cluster_elects_self_on_loopback_vote() {
        let mut g = new_group(&[1]);
        g.become_candidate(node(1), Instant::now(), Duration::from_millis(1), Duration::from_millis(2)).unwrap();
        let term = g.election_state.current_term;
        let won = g.handle_request_vote_response(term, true, node(1));
        assert_eq!(won, Some(term));
        assert_eq!(g.role, Role::Leader);
    }

    #[test]
    fn exact_half_is_not_a_quorum() {
        let mut g = new_group(&[1, 2, 3, 4]);
        g.become_candidate(node(1), Instant::now(), Duration::from_millis(1), Duration::from_millis(2)).unwrap();
        let term = g.election_state.current_term;
        assert_eq!(g.handle_request_vote_response(term, true, node(1)), None);
        assert_eq!(g.handle_request_vote_response(term, true, node(2)), None);
        assert_eq!(g.role, Role::Candidate);
        assert_eq!(g.handle_request_vote_response(term, true, node(3)), Some(term));
        assert_eq!(g.role, Role::Leader);
    }

    #[test]
    fn vote_request_denies_second_candidate_same_term() {
        let mut g = new_group(&[1, 2, 3]);
        let d1 = g.handle_request_vote(1, node(2));
        assert!(d1.granted);
        let d2 = g.handle_request_vote(1, node(3));
        assert!(!d2.granted);
    }

    #[test]
    fn vote_request_with_higher_term_resets_vote() {
        let mut g = new_group(&[1, 2, 3]);
        assert!(g.handle_request_vote(1, node(2)).granted);
        assert!(g.handle_request_vote(2, node(3)).granted);
    }

    #[test]
    fn stale_append_entries_rejected_without_mutation() {
        let mut g = new_group(&[1, 2, 3]);
        g.election_state.current_term = 5;
        let decision = g.handle_append_entries(3, 0, &[]);
        assert_eq!(decision.term, 5);
        assert!(!decision.success);
        assert_eq!(g.last_log_index, 0);
    }

    #[test]
    fn append_entries_extends_log_and_gates_on_new_index() {
        let mut g = new_group(&[1, 2, 3]);
        let entries = vec![LogEntry { term: 1, index: 1, entry_type: EntryType::Command, payload: Bytes::new() }];
        let decision = g.handle_append_entries(1, 0, &entries);
        assert!(decision.success);
        assert_eq!(decision.gate_on_index, Some(1));
        assert_eq!(g.last_log_index, 1);
        assert_eq!(g.pending_entries.len(), 1);
    }

    #[test]
    fn quorum_index_uses_corrected_majority_position() {
        let mut g = new_group(&[1, 2, 3]);
        g.role = Role::Leader;
        g.last_log_index = 10;
        g.match_index.insert(node(2), 7);
        g.match_index.insert(node(3), 4);
        // indices sorted: [4, 7, 10] -> majority position (3-1)/2 = 1 -> 7
        assert_eq!(g.quorum_index(node(1)), 7);
    }

    #[test]
    fn commit_never_regresses_and_caps_at_persisted() {
        let mut g = new_group(&[1, 2, 3]);
        g.persisted_last_index = Some(5);
        assert!(g.advance_commit(10));
        assert_eq!(g.commit_index, 5);
        assert!(!g.advance_commit(5));
        assert!(!g.advance_commit(3));
    }

    #[test]
    fn ready_to_apply_tracks_applied_boundary() {
        let mut g = new_group(&[1, 2, 3]);
        g.persisted_last_index = Some(5);
        assert!(g.advance_commit(5));
        assert_eq!(g.ready_to_apply(), Some((0, 5)));
        g.begin_apply();
        assert_eq!(g.ready_to_apply(), None);
        g.finish_apply(5, &[]);
        assert_eq!(g.ready_to_apply(), None);
        assert_eq!(g.applied_through, 5);
    }

    #[test]
    fn next_index_backs_off_on_failure_but_floors_at_one() {
        let mut g = new_group(&[1, 2, 3]);
        g.role = Role::Leader;
        g.next_index.insert(node(2), 1);
        g.handle_append_entries_response(node(2), 0, false, None);
        assert_eq!(*g.next_index.get(&node(2)).unwrap(), 1);
    }
}
