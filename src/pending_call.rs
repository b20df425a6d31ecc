use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::transport::RpcResponse;
use crate::types::{LogIndex, Term};

/// An inbound RPC whose response must not be sent until specific
/// persistence thresholds are met. `None` on either axis means "don't gate
/// on this axis" rather than a magic sentinel value.
pub struct PendingCall {
    reply: oneshot::Sender<RpcResponse>,
    response: RpcResponse,
    min_term: Option<Term>,
    min_index: Option<LogIndex>,
}

impl PendingCall {
    pub fn new(
        reply: oneshot::Sender<RpcResponse>,
        response: RpcResponse,
        min_term: Option<Term>,
        min_index: Option<LogIndex>,
    ) -> Self {
        PendingCall {
            reply,
            response,
            min_term,
            min_index,
        }
    }

    fn is_ready(&self, persisted_term: Term, persisted_last_index: Option<LogIndex>) -> bool {
        if let Some(min_index) = self.min_index {
            match persisted_last_index {
                None => return false,
                Some(idx) if idx < min_index => return false,
                _ => {}
            }
        }
        if let Some(min_term) = self.min_term {
            if persisted_term < min_term {
                return false;
            }
        }
        true
    }

    fn deliver(self) {
        // The caller may have given up waiting (e.g. connection dropped);
        // that's not this engine's problem to report.
        let _ = self.reply.send(self.response);
    }
}

/// Per-group queue of pending calls, held in insertion order. Scanned once
/// per write completion (and once immediately on registration) releasing
/// every newly-resolvable entry.
#[derive(Default)]
pub struct PendingCallQueue {
    calls: VecDeque<PendingCall>,
}

impl PendingCallQueue {
    pub fn push(&mut self, call: PendingCall) {
        self.calls.push_back(call);
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Delivers every call that `is_ready` against the current persisted
    /// state, preserving insertion order among the ones that resolve.
    pub fn resolve(&mut self, persisted_term: Term, persisted_last_index: Option<LogIndex>) {
        let mut still_pending = VecDeque::with_capacity(self.calls.len());
        while let Some(call) = self.calls.pop_front() {
            if call.is_ready(persisted_term, persisted_last_index) {
                call.deliver();
            } else {
                still_pending.push_back(call);
            }
        }
        self.calls = still_pending;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AppendEntriesResponse, Header};
    use matches::matches;
    use pretty_assertions::assert_eq;
    use std::num::NonZeroU32;

    fn header() -> Header {
        Header {
            src: NonZeroU32::new(1).unwrap(),
            dst: NonZeroU32::new(2).unwrap(),
        }
    }

    fn response(term: Term) -> RpcResponse {
        RpcResponse::AppendEntries(AppendEntriesResponse {
            header: header(),
            group: 1,
            term,
            success: true,
        })
    }

    #[tokio::test]
    async fn call_gated_on_log_index_waits_for_persistence() {
        let mut queue = PendingCallQueue::default();
        let (tx, rx) = oneshot::channel();
        queue.push(PendingCall::new(tx, response(5), None, Some(10)));

        queue.resolve(5, Some(9));
        assert!(rx.try_recv().is_err());

        queue.resolve(5, Some(10));
        let RpcResponse::AppendEntries(delivered) = rx.await.unwrap() else {
            panic!("expected an AppendEntries response");
        };
        let RpcResponse::AppendEntries(expected) = response(5) else { unreachable!() };
        assert_eq!(delivered, expected);
    }

    #[tokio::test]
    async fn call_gated_on_term_ignores_log_index() {
        let mut queue = PendingCallQueue::default();
        let (tx, rx) = oneshot::channel();
        queue.push(PendingCall::new(tx, response(7), Some(7), None));

        queue.resolve(6, None);
        assert!(rx.try_recv().is_err());

        queue.resolve(7, None);
        assert!(matches!(rx.await, Ok(RpcResponse::AppendEntries(_))));
    }

    #[tokio::test]
    async fn unset_persisted_index_never_resolves_index_gated_call() {
        let mut queue = PendingCallQueue::default();
        let (tx, rx) = oneshot::channel();
        queue.push(PendingCall::new(tx, response(1), None, Some(1)));

        queue.resolve(1, None);
        assert!(rx.try_recv().is_err());
        assert!(!queue.is_empty());
    }

    #[tokio::test]
    async fn calls_resolve_in_insertion_order() {
        let mut queue = PendingCallQueue::default();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        queue.push(PendingCall::new(tx1, response(1), None, Some(1)));
        queue.push(PendingCall::new(tx2, response(2), None, Some(2)));

        queue.resolve(2, Some(2));
        assert!(rx1.await.is_ok());
        assert!(rx2.await.is_ok());
    }
}
