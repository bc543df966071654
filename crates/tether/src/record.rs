//! Per-call recording of pending user references.
//!
//! A handler that deserializes incoming call arguments can open a
//! [`RecordSession`] and pass it to each
//! [`materialize_fork`](crate::RefContext::materialize_fork); draining the
//! session then blocks until every reference received as an argument has
//! been confirmed by its owner. Fork creation as a *return* value stays
//! non-blocking by simply not using a session, so bulk-creating many
//! references in a loop never stalls on confirmations.
//!
//! The session is an explicit token owned by one call context; there is no
//! thread-local state, and independent sessions never observe each other's
//! entries.

use crate::promise::Promise;
use parking_lot::Mutex;

/// Accumulates the pending futures of references materialized during one
/// call.
pub struct RecordSession {
    entries: Mutex<Vec<Promise<()>>>,
}

impl RecordSession {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn record(&self, ready: Promise<()>) {
        self.entries.lock().push(ready);
    }

    /// Number of references recorded so far.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Stops recording and returns a promise that completes once every
    /// recorded reference has been confirmed.
    ///
    /// Already-completed if the session recorded nothing. The per-entry
    /// futures are consumed here and not retained past their completion.
    pub fn drain(self) -> Promise<()> {
        let entries = self.entries.into_inner();
        tracing::trace!(count = entries.len(), "draining recorded pending users");
        Promise::join(entries)
    }

    /// Discards the recorded entries without waiting.
    ///
    /// For use only when the surrounding call is failing and will not
    /// drain; the references themselves stay tracked by the context and
    /// confirm as usual.
    pub fn abort(self) {
        let entries = self.entries.into_inner();
        if !entries.is_empty() {
            tracing::debug!(count = entries.len(), "aborted recording session");
        }
    }
}
