//! Pending request table.
//!
//! Maps the sequence number of every outstanding request to the one-shot
//! channel its caller is waiting on. `register` runs on the caller's task and
//! `resolve` on the connection's reader task, hence the concurrent map.
//! A correlator lives and dies with one connection.

use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

/// A reply delivered to the caller that issued the matching request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub command: String,
    pub payload: Value,
}

pub type Continuation = oneshot::Sender<Response>;

#[derive(Debug, Default)]
pub struct Correlator {
    pending: DashMap<u64, Continuation>,
    closed: AtomicBool,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the continuation for `seq`.
    ///
    /// After [`close`](Self::close) the continuation is dropped immediately,
    /// so its caller observes a closed channel instead of waiting forever.
    pub fn register(&self, seq: u64, continuation: Continuation) {
        if self.pending.insert(seq, continuation).is_some() {
            tracing::warn!(seq, "Sequence collision, replaced pending request");
        }
        // Checked after inserting: either close() sees the entry or we see the flag.
        if self.closed.load(Ordering::SeqCst) {
            self.pending.remove(&seq);
        }
    }

    /// Deliver a reply to the caller waiting on `seq`.
    ///
    /// The entry is removed before the continuation fires, so a second reply
    /// with the same sequence is reported as unknown. Returns whether a
    /// pending request matched.
    pub fn resolve(&self, seq: u64, command: String, payload: Value) -> bool {
        let Some((_, continuation)) = self.pending.remove(&seq) else {
            tracing::warn!(seq, %command, "No pending request for seq (UnknownSequence), ignoring");
            return false;
        };

        if continuation.send(Response { command, payload }).is_err() {
            tracing::debug!(seq, "Caller stopped waiting before the reply arrived");
        }
        true
    }

    /// Drop the entry for `seq` without resolving it.
    pub fn forget(&self, seq: u64) -> bool {
        self.pending.remove(&seq).is_some()
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.pending.contains_key(&seq)
    }

    /// Drop every pending continuation and refuse new ones. Waiting callers
    /// observe a closed channel.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let abandoned = self.pending.len();
        if abandoned > 0 {
            tracing::debug!(abandoned, "Dropping unresolved requests");
        }
        self.pending.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_delivers_to_registered_caller() {
        let correlator = Correlator::new();
        let (tx, mut rx) = oneshot::channel();
        correlator.register(0, tx);

        assert!(correlator.resolve(0, "answer".into(), json!({"text": "the first"})));

        let response = rx.try_recv().unwrap();
        assert_eq!(response.command, "answer");
        assert_eq!(response.payload, json!({"text": "the first"}));
        assert!(correlator.is_empty());
    }

    #[test]
    fn second_reply_with_same_seq_is_unknown() {
        let correlator = Correlator::new();
        let (tx, mut rx) = oneshot::channel();
        correlator.register(4, tx);

        assert!(correlator.resolve(4, "response".into(), json!(1)));
        assert!(!correlator.resolve(4, "response".into(), json!(2)));

        assert_eq!(rx.try_recv().unwrap().payload, json!(1));
    }

    #[test]
    fn unknown_seq_is_dropped() {
        let correlator = Correlator::new();

        assert!(!correlator.resolve(42, "response".into(), Value::Null));
        assert!(correlator.is_empty());
    }

    #[test]
    fn out_of_order_resolution() {
        let correlator = Correlator::new();
        let (say_tx, mut say_rx) = oneshot::channel();
        let (ask_tx, mut ask_rx) = oneshot::channel();
        correlator.register(0, say_tx);
        correlator.register(1, ask_tx);
        assert_eq!(correlator.len(), 2);

        assert!(correlator.resolve(1, "answer".into(), json!("ask")));
        assert!(say_rx.try_recv().is_err());
        assert!(correlator.resolve(0, "response".into(), json!("say")));

        assert_eq!(ask_rx.try_recv().unwrap().payload, json!("ask"));
        assert_eq!(say_rx.try_recv().unwrap().payload, json!("say"));
    }

    #[test]
    fn resolve_after_caller_gave_up_still_consumes_entry() {
        let correlator = Correlator::new();
        let (tx, rx) = oneshot::channel();
        correlator.register(9, tx);
        drop(rx);

        assert!(correlator.resolve(9, "response".into(), Value::Null));
        assert!(!correlator.contains(9));
    }

    #[test]
    fn forget_removes_entry() {
        let correlator = Correlator::new();
        let (tx, mut rx) = oneshot::channel();
        correlator.register(2, tx);

        assert!(correlator.forget(2));
        assert!(!correlator.forget(2));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn close_wakes_waiting_callers() {
        let correlator = Correlator::new();
        let (tx, mut rx) = oneshot::channel();
        correlator.register(0, tx);

        correlator.close();

        assert!(correlator.is_closed());
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn register_after_close_is_dropped() {
        let correlator = Correlator::new();
        correlator.close();
        let (tx, mut rx) = oneshot::channel();

        correlator.register(0, tx);

        assert!(correlator.is_empty());
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }
}
