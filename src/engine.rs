use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::group::Group;
use crate::peer::PeerTable;
use crate::pending_call::PendingCall;
use crate::storage::{GroupWriteRequest, Storage, WriteBatch, WriteBatchResult};
use crate::transport::{
    AppendEntries, AppendEntriesResponse, Header, RequestVote, RequestVoteResponse, RpcHandler, RpcRequest,
    RpcResponse, Transport,
};
use crate::types::{EntryType, GroupId, GroupMembers, LogEntry, LogIndex, MembershipOp, NodeId, Role, Term};
use crate::write_task::{self, WriteOutcome};

/// Scalar engine settings. `transport` and `storage` are passed as separate
/// constructor arguments (see DESIGN.md) since they're collaborators with
/// their own lifetimes, not configuration values.
pub struct Config {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub strict: bool,
    pub events_capacity: usize,
    pub ops_capacity: usize,
    pub clock: Option<Arc<dyn Clock>>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            strict: true,
            events_capacity: 1024,
            ops_capacity: 1024,
            clock: None,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.election_timeout_min.is_zero() || self.election_timeout_max.is_zero() {
            return Err(Error::InvalidElectionTimeout);
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(Error::InvalidElectionTimeout);
        }
        Ok(())
    }
}

/// Closed tagged union of application-side operations, replacing
/// the op-types-as-`interface{}` dynamic dispatch the source used.
enum Op {
    CreateGroup {
        id: GroupId,
        initial_members: GroupMembers,
        reply: oneshot::Sender<Result<()>>,
    },
    SubmitCommand {
        id: GroupId,
        payload: Bytes,
        reply: oneshot::Sender<Result<LogIndex>>,
    },
    ChangeMembership {
        id: GroupId,
        op: MembershipOp,
        node: NodeId,
        reply: oneshot::Sender<Result<LogIndex>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone)]
pub enum Event {
    LeaderElection { group: GroupId, leader: NodeId },
    CommandCommitted { group: GroupId, payload: Bytes },
}

struct InboundRequest {
    request: RpcRequest,
    reply: oneshot::Sender<RpcResponse>,
}

struct EngineRpcHandler {
    requests_tx: mpsc::Sender<InboundRequest>,
}

#[async_trait]
impl RpcHandler for EngineRpcHandler {
    async fn handle_request_vote(&self, req: RequestVote) -> RequestVoteResponse {
        let fallback = RequestVoteResponse {
            header: reverse(req.header),
            group: req.group,
            term: req.term,
            vote_granted: false,
        };
        let (tx, rx) = oneshot::channel();
        if self
            .requests_tx
            .send(InboundRequest { request: RpcRequest::RequestVote(req), reply: tx })
            .await
            .is_err()
        {
            return fallback;
        }
        match rx.await {
            Ok(RpcResponse::RequestVote(resp)) => resp,
            _ => fallback,
        }
    }

    async fn handle_append_entries(&self, req: AppendEntries) -> AppendEntriesResponse {
        let fallback = AppendEntriesResponse {
            header: reverse(req.header),
            group: req.group,
            term: req.term,
            success: false,
        };
        let (tx, rx) = oneshot::channel();
        if self
            .requests_tx
            .send(InboundRequest { request: RpcRequest::AppendEntries(req), reply: tx })
            .await
            .is_err()
        {
            return fallback;
        }
        match rx.await {
            Ok(RpcResponse::AppendEntries(resp)) => resp,
            _ => fallback,
        }
    }
}

fn reverse(h: Header) -> Header {
    Header { src: h.dst, dst: h.src }
}

/// Handle to a running (or not-yet-started) engine. Cheap to clone-share
/// via `Arc` if callers need it from multiple tasks; internally it's just
/// a sender plus the one-time-takeable loop state.
pub struct Engine {
    ops_tx: mpsc::Sender<Op>,
    loop_state: Mutex<Option<LoopState>>,
    join: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct LoopState {
    node_id: NodeId,
    config: Config,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    ops_rx: mpsc::Receiver<Op>,
    events_tx: mpsc::Sender<Event>,
    requests_tx: mpsc::Sender<InboundRequest>,
    requests_rx: mpsc::Receiver<InboundRequest>,
    responses_tx: mpsc::UnboundedSender<RpcResponse>,
    responses_rx: mpsc::UnboundedReceiver<RpcResponse>,
}

/// Constructs the engine. Validation (`config`, `node_id`) is synchronous
/// and returns immediately — nothing about this call touches
/// Transport or Storage yet. Call `start()` to actually launch the loop
/// and the write task.
pub fn new_engine(
    node_id: NodeId,
    config: Config,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn Storage>,
) -> Result<(Arc<Engine>, mpsc::Receiver<Event>)> {
    config.validate()?;
    let clock: Arc<dyn Clock> = config.clock.clone().unwrap_or_else(|| Arc::new(SystemClock));

    let (ops_tx, ops_rx) = mpsc::channel(config.ops_capacity.max(1));
    let (events_tx, events_rx) = mpsc::channel(config.events_capacity.max(1));
    let (requests_tx, requests_rx) = mpsc::channel(config.ops_capacity.max(1));
    let (responses_tx, responses_rx) = mpsc::unbounded_channel();

    let loop_state = LoopState {
        node_id,
        config,
        transport,
        storage,
        clock,
        ops_rx,
        events_tx,
        requests_tx,
        requests_rx,
        responses_tx,
        responses_rx,
    };

    let engine = Engine {
        ops_tx,
        loop_state: Mutex::new(Some(loop_state)),
        join: Mutex::new(None),
    };
    Ok((Arc::new(engine), events_rx))
}

impl Engine {
    /// Launches the event loop and the write task. Idempotent: a second
    /// call is a no-op once the loop state has been taken.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let Some(state) = self.loop_state.lock().await.take() else {
            return Ok(());
        };
        state
            .transport
            .listen(state.node_id, Arc::new(EngineRpcHandler { requests_tx: state.requests_tx.clone() }))
            .await?;
        let handle = tokio::spawn(run(state));
        *self.join.lock().await = Some(handle);
        Ok(())
    }

    pub async fn create_group(&self, id: GroupId, initial_members: GroupMembers) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_op(Op::CreateGroup { id, initial_members, reply }).await?;
        rx.await.map_err(|_| Error::EngineStopped)?
    }

    pub async fn submit_command(&self, id: GroupId, payload: Bytes) -> Result<LogIndex> {
        let (reply, rx) = oneshot::channel();
        self.send_op(Op::SubmitCommand { id, payload, reply }).await?;
        rx.await.map_err(|_| Error::EngineStopped)?
    }

    pub async fn change_group_membership(&self, id: GroupId, op: MembershipOp, node: NodeId) -> Result<LogIndex> {
        let (reply, rx) = oneshot::channel();
        self.send_op(Op::ChangeMembership { id, op, node, reply }).await?;
        rx.await.map_err(|_| Error::EngineStopped)?
    }

    /// Idempotent; blocks until the loop exits.
    pub async fn stop(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.send_op(Op::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
        if let Some(handle) = self.join.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn send_op(&self, op: Op) -> Result<()> {
        self.ops_tx.send(op).await.map_err(|_| Error::EngineStopped)
    }
}

/// Result of a spawned commit-apply task streaming `(from, to]` from
/// Storage (see `Group::ready_to_apply`).
struct ApplyResult {
    group: GroupId,
    to: LogIndex,
    membership_changes: Vec<(MembershipOp, NodeId)>,
}

async fn run(mut s: LoopState) {
    let mut groups: HashMap<GroupId, Group> = HashMap::new();
    let mut peers = PeerTable::new(s.node_id, s.transport.clone(), s.responses_tx.clone());
    let (write_req_tx, mut write_resp_rx) = write_task::spawn(s.storage.clone());
    let (apply_tx, mut apply_rx) = mpsc::unbounded_channel::<ApplyResult>();

    loop {
        let deadline = groups
            .values()
            .filter(|g| g.role != Role::Leader)
            .map(|g| g.election_deadline)
            .min();
        let election_timer = async {
            match deadline {
                Some(d) => s.clock.sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        let any_dirty = groups.values().any(Group::is_dirty);

        tokio::select! {
            biased;

            maybe_op = s.ops_rx.recv() => {
                match maybe_op {
                    Some(Op::Stop { reply }) => {
                        peers.stop().await;
                        let _ = reply.send(());
                        info!("engine stopped");
                        return;
                    }
                    Some(op) => handle_op(&s, &mut groups, &mut peers, op).await,
                    None => {
                        peers.stop().await;
                        return;
                    }
                }
            }

            Some(req) = s.requests_rx.recv() => {
                handle_inbound_request(&s, &mut groups, req, &apply_tx).await;
            }

            Some(resp) = s.responses_rx.recv() => {
                handle_inbound_response(&s, &mut groups, &apply_tx, resp).await;
            }

            Some(outcome) = write_resp_rx.recv() => {
                match outcome {
                    WriteOutcome::Written(result) => {
                        handle_write_completion(&s, &mut groups, &mut peers, &apply_tx, result).await;
                    }
                    WriteOutcome::Failed(batch) => requeue_failed_write(&mut groups, batch),
                }
            }

            Some(applied) = apply_rx.recv() => {
                if let Some(group) = groups.get_mut(&applied.group) {
                    group.finish_apply(applied.to, &applied.membership_changes);
                    trigger_apply_if_ready(&s, group, &apply_tx);
                }
            }

            permit = write_req_tx.reserve(), if any_dirty => {
                if let Ok(permit) = permit {
                    let mut batch: WriteBatch = HashMap::new();
                    for (id, group) in groups.iter_mut() {
                        if group.is_dirty() {
                            let (election_state, entries) = group.drain_for_write();
                            batch.insert(*id, GroupWriteRequest { election_state, entries });
                        }
                    }
                    permit.send(batch);
                }
            }

            _ = election_timer => {
                if let Some(deadline) = deadline {
                    for (id, group) in groups.iter_mut() {
                        if group.election_deadline <= deadline && group.role != Role::Leader {
                            fire_election(&s, *id, group, &mut peers).await;
                        }
                    }
                }
            }
        }
    }
}

/// Restores a batch's entries into the owning groups' pending tails after a
/// failed write, so `Group::is_dirty` picks them back up for the next
/// write attempt instead of them being silently lost.
fn requeue_failed_write(groups: &mut HashMap<GroupId, Group>, batch: WriteBatch) {
    for (id, req) in batch {
        if let Some(group) = groups.get_mut(&id) {
            group.requeue_failed_write(req.entries);
        }
    }
}

async fn handle_op(s: &LoopState, groups: &mut HashMap<GroupId, Group>, peers: &mut PeerTable, op: Op) {
    match op {
        Op::CreateGroup { id, initial_members, reply } => {
            let result = create_group(s, groups, peers, id, initial_members).await;
            let _ = reply.send(result);
        }
        Op::SubmitCommand { id, payload, reply } => {
            let result = groups
                .get_mut(&id)
                .ok_or(Error::NoSuchGroup(id))
                .and_then(|g| g.add_log_entry(EntryType::Command, payload));
            let _ = reply.send(result);
        }
        Op::ChangeMembership { id, op, node, reply } => {
            let payload = op.encode(node);
            let result = groups
                .get_mut(&id)
                .ok_or(Error::NoSuchGroup(id))
                .and_then(|g| g.add_log_entry(EntryType::ChangeMembership, payload));
            let _ = reply.send(result);
        }
        Op::Stop { .. } => unreachable!("handled in the select loop directly"),
    }
}

async fn create_group(
    s: &LoopState,
    groups: &mut HashMap<GroupId, Group>,
    peers: &mut PeerTable,
    id: GroupId,
    initial_members: GroupMembers,
) -> Result<()> {
    if groups.contains_key(&id) {
        return Err(Error::GroupExists(id));
    }
    for peer in initial_members.all_peers() {
        if peer == s.node_id {
            continue;
        }
        peers.acquire(peer).await?;
    }
    let now = s.clock.now();
    let group = Group::new(
        id,
        initial_members,
        now,
        s.config.election_timeout_min,
        s.config.election_timeout_max,
    );
    groups.insert(id, group);
    debug!("group {id}: created");
    Ok(())
}

async fn handle_inbound_request(
    s: &LoopState,
    groups: &mut HashMap<GroupId, Group>,
    req: InboundRequest,
    apply_tx: &mpsc::UnboundedSender<ApplyResult>,
) {
    match req.request {
        RpcRequest::RequestVote(vote) => {
            let Some(group) = groups.get_mut(&vote.group) else {
                warn!("vote request for unknown group {}", vote.group);
                let _ = req.reply.send(RpcResponse::RequestVote(RequestVoteResponse {
                    header: reverse(vote.header),
                    group: vote.group,
                    term: vote.term,
                    vote_granted: false,
                }));
                return;
            };
            let decision = group.handle_request_vote(vote.term, vote.candidate);
            let response = RpcResponse::RequestVote(RequestVoteResponse {
                header: reverse(vote.header),
                group: vote.group,
                term: decision.term,
                vote_granted: decision.granted,
            });
            group.pending_calls.push(PendingCall::new(req.reply, response, Some(decision.term), None));
            resolve_pending(group);
        }
        RpcRequest::AppendEntries(append) => {
            let Some(group) = groups.get_mut(&append.group) else {
                warn!("append entries for unknown group {}", append.group);
                let _ = req.reply.send(RpcResponse::AppendEntries(AppendEntriesResponse {
                    header: reverse(append.header),
                    group: append.group,
                    term: append.term,
                    success: false,
                }));
                return;
            };
            let decision = group.handle_append_entries(append.term, append.leader_commit, &append.entries);
            if decision.success {
                if group.advance_commit(group.leader_commit_index) {
                    trigger_apply_if_ready(s, group, apply_tx);
                }
                let response = RpcResponse::AppendEntries(AppendEntriesResponse {
                    header: reverse(append.header),
                    group: append.group,
                    term: decision.term,
                    success: true,
                });
                group.pending_calls.push(PendingCall::new(req.reply, response, None, decision.gate_on_index));
                resolve_pending(group);
            } else {
                let _ = req.reply.send(RpcResponse::AppendEntries(AppendEntriesResponse {
                    header: reverse(append.header),
                    group: append.group,
                    term: decision.term,
                    success: false,
                }));
            }
        }
    }
}

async fn handle_inbound_response(
    s: &LoopState,
    groups: &mut HashMap<GroupId, Group>,
    apply_tx: &mpsc::UnboundedSender<ApplyResult>,
    resp: RpcResponse,
) {
    match resp {
        RpcResponse::RequestVote(r) => {
            let Some(group) = groups.get_mut(&r.group) else { return };
            if let Some(term) = group.handle_request_vote_response(r.term, r.vote_granted, r.header.src) {
                info!("group {}: elected leader for term {}", r.group, term);
                if s.events_tx.try_send(Event::LeaderElection { group: r.group, leader: s.node_id }).is_err() {
                    fatal_events_overflow();
                }
            }
        }
        RpcResponse::AppendEntries(r) => {
            let Some(group) = groups.get_mut(&r.group) else { return };
            let voter = r.header.src;
            let last_entry_index = group.take_outstanding_append(voter);
            group.handle_append_entries_response(voter, r.term, r.success, last_entry_index);
            if group.role == Role::Leader {
                let target = group.quorum_index(s.node_id);
                if group.advance_commit(target) {
                    trigger_apply_if_ready(s, group, apply_tx);
                }
            }
        }
    }
}

async fn handle_write_completion(
    s: &LoopState,
    groups: &mut HashMap<GroupId, Group>,
    peers: &mut PeerTable,
    apply_tx: &mpsc::UnboundedSender<ApplyResult>,
    result: WriteBatchResult,
) {
    for (id, group_result) in result {
        let Some(group) = groups.get_mut(&id) else { continue };
        let prev_persisted_last_index = group.persisted_last_index;
        let prev_persisted_last_term = group.persisted_last_term;
        if let Some(election_state) = group_result.election_state {
            group.persisted_election_state = election_state;
        }
        if let Some(last_index) = group_result.last_index {
            group.persisted_last_index = Some(last_index);
            group.persisted_last_term = group_result.last_term;
        }

        if group.role == Role::Leader && !group_result.entries.is_empty() {
            broadcast_append_entries(
                s,
                group,
                peers,
                prev_persisted_last_index,
                prev_persisted_last_term,
                &group_result.entries,
            );
        }

        let leader_commit = group.leader_commit_index;
        if group.advance_commit(leader_commit) {
            trigger_apply_if_ready(s, group, apply_tx);
        }
        if group.role == Role::Leader {
            let target = group.quorum_index(s.node_id);
            if group.advance_commit(target) {
                trigger_apply_if_ready(s, group, apply_tx);
            }
        }

        group.pending_calls.resolve(group.persisted_election_state.current_term, group.persisted_last_index);
    }
}

fn resolve_pending(group: &mut Group) {
    group.pending_calls.resolve(group.persisted_election_state.current_term, group.persisted_last_index);
}

fn trigger_apply_if_ready(s: &LoopState, group: &mut Group, apply_tx: &mpsc::UnboundedSender<ApplyResult>) {
    let Some((from, to)) = group.ready_to_apply() else { return };
    group.begin_apply();
    let storage = s.storage.clone();
    let events_tx = s.events_tx.clone();
    let apply_tx = apply_tx.clone();
    let group_id = group.id;
    let strict = s.config.strict;
    tokio::spawn(async move {
        let mut stream = storage.get_log_entries(group_id, from + 1, to);
        let mut membership_changes = Vec::new();
        while let Some(entry) = stream.next().await {
            match entry.entry_type {
                EntryType::Command => {
                    if events_tx.try_send(Event::CommandCommitted { group: group_id, payload: entry.payload }).is_err() {
                        fatal_events_overflow();
                    }
                }
                EntryType::ChangeMembership => match MembershipOp::decode(&entry.payload) {
                    Some((op, node)) => membership_changes.push((op, node)),
                    None if strict => panic!("group {group_id}: malformed ChangeMembership payload"),
                    None => error!("group {group_id}: malformed ChangeMembership payload, dropping"),
                },
            }
        }
        let _ = apply_tx.send(ApplyResult { group: group_id, to, membership_changes });
    });
}

fn fatal_events_overflow() {
    error!("events channel overflow: application is not draining the event stream");
    std::process::abort();
}

async fn fire_election(s: &LoopState, id: GroupId, group: &mut Group, peers: &mut PeerTable) {
    let now = s.clock.now();
    let ballot = match group.become_candidate(s.node_id, now, s.config.election_timeout_min, s.config.election_timeout_max) {
        Ok(b) => b,
        Err(e) => {
            handle_invariant_violation(s, e);
            return;
        }
    };

    for member in group.current_members.voting.clone() {
        let req = RequestVote {
            header: Header { src: s.node_id, dst: member },
            group: id,
            term: ballot.term,
            candidate: s.node_id,
            last_log_index: ballot.last_log_index,
            last_log_term: ballot.last_log_term,
        };
        if member == s.node_id {
            loopback_vote_request(s, group, req);
        } else {
            peers.send_request_vote(member, req);
        }
    }
}

/// Routes a self-addressed `RequestVote` through the same persistence-gated
/// path a remote peer's reply would take, via a tiny forwarding task into
/// the engine's own response channel. This is why `become_candidate` sends
/// a ballot to self instead of special-casing the self-vote.
fn loopback_vote_request(s: &LoopState, group: &mut Group, req: RequestVote) {
    let decision = group.handle_request_vote(req.term, req.candidate);
    let response = RpcResponse::RequestVote(RequestVoteResponse {
        header: reverse(req.header),
        group: req.group,
        term: decision.term,
        vote_granted: decision.granted,
    });
    let (tx, rx) = oneshot::channel();
    let responses_tx = s.responses_tx.clone();
    tokio::spawn(async move {
        if let Ok(resp) = rx.await {
            let _ = responses_tx.send(resp);
        }
    });
    group.pending_calls.push(PendingCall::new(tx, response, Some(decision.term), None));
    resolve_pending(group);
}

fn broadcast_append_entries(
    s: &LoopState,
    group: &mut Group,
    peers: &mut PeerTable,
    prev_persisted_last_index: Option<LogIndex>,
    prev_persisted_last_term: Option<Term>,
    entries: &[LogEntry],
) {
    let prev_log_index = prev_persisted_last_index.unwrap_or(0);
    let prev_log_term = prev_persisted_last_term.unwrap_or(0);
    for peer in group.current_members.all_peers().collect::<Vec<_>>() {
        if peer == s.node_id {
            continue;
        }
        let req = AppendEntries {
            header: Header { src: s.node_id, dst: peer },
            group: group.id,
            term: group.election_state.current_term,
            leader: s.node_id,
            prev_log_index,
            prev_log_term,
            leader_commit: group.commit_index,
            entries: entries.to_vec(),
        };
        group.record_outstanding_append(peer, entries.last().map(|e| e.index));
        peers.send_append_entries(peer, req);
    }
}

fn handle_invariant_violation(s: &LoopState, err: Error) {
    error!("invariant violation: {err}");
    if s.config.strict {
        panic!("invariant violation: {err}");
    }
    trace!("lax mode: continuing after invariant violation");
}
