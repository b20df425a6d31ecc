use std::collections::BTreeSet;

use bytes::Bytes;

/// Non-zero 32-bit identifier, unique in the cluster. Zero is reserved as "unset".
pub type NodeId = std::num::NonZeroU32;

/// 64-bit identifier, unique within the node.
pub type GroupId = u64;

/// Monotonically non-decreasing per-group election epoch.
pub type Term = u64;

/// 1-based, monotonically increasing per-group log position.
pub type LogIndex = u64;

/// A group's role. Initial role on creation is `Follower`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Observer,
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Command,
    ChangeMembership,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub entry_type: EntryType,
    pub payload: Bytes,
}

/// Persistent per-group election state. `voted_for` is set only within the
/// term recorded by `current_term`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ElectionState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// Ordered set of voting members plus an ordered set of observers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupMembers {
    pub voting: BTreeSet<NodeId>,
    pub observers: BTreeSet<NodeId>,
}

impl GroupMembers {
    pub fn new(voting: impl IntoIterator<Item = NodeId>) -> Self {
        GroupMembers {
            voting: voting.into_iter().collect(),
            observers: BTreeSet::new(),
        }
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.voting.contains(&node) || self.observers.contains(&node)
    }

    pub fn all_peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.voting.iter().copied().chain(self.observers.iter().copied())
    }

    /// Strict-majority threshold: more than half of the voting members.
    pub fn quorum_size(&self) -> usize {
        self.voting.len() / 2 + 1
    }
}

/// The kind of membership change carried in a `ChangeMembership` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipOp {
    AddMember,
    RemoveMember,
    AddObserver,
    RemoveObserver,
}

impl MembershipOp {
    pub fn apply(self, members: &mut GroupMembers, node: NodeId) {
        match self {
            MembershipOp::AddMember => {
                members.observers.remove(&node);
                members.voting.insert(node);
            }
            MembershipOp::RemoveMember => {
                members.voting.remove(&node);
            }
            MembershipOp::AddObserver => {
                members.voting.remove(&node);
                members.observers.insert(node);
            }
            MembershipOp::RemoveObserver => {
                members.observers.remove(&node);
            }
        }
    }

    pub fn encode(self, node: NodeId) -> Bytes {
        let tag: u8 = match self {
            MembershipOp::AddMember => 0,
            MembershipOp::RemoveMember => 1,
            MembershipOp::AddObserver => 2,
            MembershipOp::RemoveObserver => 3,
        };
        let mut buf = Vec::with_capacity(5);
        buf.push(tag);
        buf.extend_from_slice(&node.get().to_be_bytes());
        Bytes::from(buf)
    }

    pub fn decode(payload: &[u8]) -> Option<(Self, NodeId)> {
        if payload.len() != 5 {
            return None;
        }
        let op = match payload[0] {
            0 => MembershipOp::AddMember,
            1 => MembershipOp::RemoveMember,
            2 => MembershipOp::AddObserver,
            3 => MembershipOp::RemoveObserver,
            _ => return None,
        };
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&payload[1..5]);
        let node = NodeId::new(u32::from_be_bytes(raw))?;
        Some((op, node))
    }
}
