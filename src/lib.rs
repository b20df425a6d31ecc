//! A process-local engine hosting many independent Raft consensus groups
//! over one event loop, one write pipeline, and one connection per peer.
//!
//! Callers provide [`storage::Storage`], [`transport::Transport`] and
//! optionally [`clock::Clock`] implementations; the engine owns nothing
//! about how entries reach disk or bytes reach the wire.

pub mod clock;
pub mod error;
pub mod storage;
pub mod transport;
pub mod types;

mod engine;
mod group;
mod peer;
mod pending_call;
mod write_task;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use engine::{new_engine, Config, Engine, Event};
pub use error::{Error, Result};
pub use types::{EntryType, GroupId, GroupMembers, LogEntry, LogIndex, MembershipOp, NodeId, Role, Term};
