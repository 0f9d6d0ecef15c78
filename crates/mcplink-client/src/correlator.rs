//! Request correlation.
//!
//! [`PendingRequests`] maps in-flight request ids to their completion
//! slots. It is owned exclusively by the dispatcher task; callers never
//! touch it directly. Every mutation arrives through the connection's
//! command channel, so no lock is needed.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::protocol::RequestId;

/// Outcome delivered to a waiting caller: the raw result value, or the
/// error the dispatcher mapped for it.
pub type Outcome = Result<Value, ClientError>;

/// One outstanding call, waiting for its response.
struct Pending {
    method: String,
    created_at: Instant,
    slot: oneshot::Sender<Outcome>,
}

/// The set of requests awaiting responses on one connection.
#[derive(Default)]
pub struct PendingRequests {
    entries: HashMap<RequestId, Pending>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new in-flight request. The id is unique for the
    /// connection's lifetime (allocated from a monotonic counter), so a
    /// collision here is a caller bug.
    pub fn register(&mut self, id: RequestId, method: &str, slot: oneshot::Sender<Outcome>) {
        let prior = self.entries.insert(
            id.clone(),
            Pending {
                method: method.to_string(),
                created_at: Instant::now(),
                slot,
            },
        );
        debug_assert!(prior.is_none(), "request id {id} reused while pending");
    }

    /// Deliver an outcome to the caller waiting on `id`.
    ///
    /// Unknown ids are a protocol anomaly, not a crash: the response may be
    /// late for a timed-out call, duplicated, or never solicited. Returns
    /// the method name on delivery, `None` for the no-op case.
    pub fn complete(&mut self, id: &RequestId, outcome: Outcome) -> Option<String> {
        match self.entries.remove(id) {
            Some(pending) => {
                debug!(
                    %id,
                    method = %pending.method,
                    elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
                    "request completed"
                );
                // Receiver side may already be gone (caller dropped).
                let _ = pending.slot.send(outcome);
                Some(pending.method)
            }
            None => {
                warn!(%id, "response for unknown request id, discarding");
                None
            }
        }
    }

    /// Drop the pending entry for `id` without completing it. The caller
    /// has already given up (timeout or explicit cancellation).
    pub fn cancel(&mut self, id: &RequestId) -> bool {
        match self.entries.remove(id) {
            Some(pending) => {
                debug!(%id, method = %pending.method, "request cancelled");
                true
            }
            None => false,
        }
    }

    /// Fail every in-flight request. Used when the connection dies: each
    /// waiter gets its own error built by `err`.
    pub fn fail_all(&mut self, err: impl Fn() -> ClientError) {
        let count = self.entries.len();
        for (id, pending) in self.entries.drain() {
            debug!(%id, method = %pending.method, "failing pending request");
            let _ = pending.slot.send(Err(err()));
        }
        if count > 0 {
            debug!(count, "failed all pending requests");
        }
    }

    /// Number of requests currently in flight.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_complete_delivers_to_waiter() {
        let mut pending = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();

        pending.register(RequestId::Number(1), "tools/call", tx);
        assert_eq!(pending.len(), 1);

        let delivered = pending.complete(&RequestId::Number(1), Ok(json!({"ok": true})));
        assert_eq!(delivered.as_deref(), Some("tools/call"));
        assert!(pending.is_empty());

        let outcome = rx.try_recv().unwrap();
        assert_eq!(outcome.unwrap(), json!({"ok": true}));
    }

    #[test]
    fn test_complete_unknown_id_is_noop() {
        let mut pending = PendingRequests::new();
        assert!(pending
            .complete(&RequestId::Number(99), Ok(json!(null)))
            .is_none());
    }

    #[test]
    fn test_cancel_removes_entry() {
        let mut pending = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();

        pending.register(RequestId::Number(2), "tools/call", tx);
        assert!(pending.cancel(&RequestId::Number(2)));
        assert!(pending.is_empty());
        assert!(!pending.cancel(&RequestId::Number(2)));

        // The waiter sees a dropped slot, never a value.
        assert!(rx.try_recv().is_err());

        // A late response for the cancelled id is discarded.
        assert!(pending
            .complete(&RequestId::Number(2), Ok(json!({})))
            .is_none());
    }

    #[test]
    fn test_fail_all_drains_everything() {
        let mut pending = PendingRequests::new();
        let mut receivers = Vec::new();

        for i in 0..3 {
            let (tx, rx) = oneshot::channel();
            pending.register(RequestId::Number(i), "tools/call", tx);
            receivers.push(rx);
        }

        pending.fail_all(|| ClientError::ConnectionClosed);
        assert!(pending.is_empty());

        for mut rx in receivers {
            let outcome = rx.try_recv().unwrap();
            assert!(matches!(outcome, Err(ClientError::ConnectionClosed)));
        }
    }

    #[test]
    fn test_complete_with_dropped_receiver() {
        let mut pending = PendingRequests::new();
        let (tx, rx) = oneshot::channel();
        pending.register(RequestId::Number(5), "tools/list", tx);
        drop(rx);

        // Delivery to a gone caller must not panic.
        assert!(pending
            .complete(&RequestId::Number(5), Ok(json!({})))
            .is_some());
    }
}
