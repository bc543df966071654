//! Outbound transport seam and the in-memory hub.
//!
//! The reference context never talks to the network directly; it emits
//! protocol messages through a [`Transport`] and receives inbound messages
//! through [`RefContext::handle_message`](crate::RefContext::handle_message).
//! Delivery between two workers may be reordered or delayed arbitrarily;
//! the protocol's handshakes assume nothing about ordering.
//!
//! [`InMemoryHub`] is a complete in-process transport: every worker's
//! outbound messages land in a per-worker queue, and the embedding code (or
//! a test) pumps them in whatever order it likes. That makes adverse
//! delivery orders reproducible instead of a matter of luck.

use crate::error::RefError;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tether_core::{RefMessage, WorkerId};

/// Outbound message sink wired into a [`RefContext`](crate::RefContext).
pub trait Transport: Send + Sync + 'static {
    /// Queues `msg` for delivery to worker `to`.
    fn send(&self, to: WorkerId, msg: RefMessage) -> Result<(), RefError>;
}

/// A transport that discards everything.
///
/// Useful for single-worker deployments and unit tests that only exercise
/// local bookkeeping.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTransport;

impl Transport for NoopTransport {
    fn send(&self, _to: WorkerId, _msg: RefMessage) -> Result<(), RefError> {
        Ok(())
    }
}

/// One queued protocol message.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Sending worker.
    pub from: WorkerId,
    /// Receiving worker.
    pub to: WorkerId,
    /// The message itself.
    pub msg: RefMessage,
}

/// In-process message exchange between simulated workers.
pub struct InMemoryHub {
    queues: DashMap<WorkerId, VecDeque<Envelope>>,
}

impl InMemoryHub {
    /// Creates an empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: DashMap::new(),
        })
    }

    /// Returns the outbound port for `local`, to be wired into that
    /// worker's context.
    pub fn port(self: &Arc<Self>, local: WorkerId) -> HubPort {
        HubPort {
            hub: Arc::clone(self),
            local,
        }
    }

    /// Removes and returns everything queued for `worker`, in send order.
    ///
    /// The caller decides delivery order from here; re-queuing or
    /// reordering before handling is exactly how out-of-order transports
    /// are simulated.
    pub fn take_all(&self, worker: WorkerId) -> Vec<Envelope> {
        self.queues
            .get_mut(&worker)
            .map(|mut queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// Number of messages queued for `worker`.
    pub fn pending(&self, worker: WorkerId) -> usize {
        self.queues.get(&worker).map(|queue| queue.len()).unwrap_or(0)
    }

    /// Number of messages queued across all workers.
    pub fn total_pending(&self) -> usize {
        self.queues.iter().map(|entry| entry.value().len()).sum()
    }
}

/// A worker's outbound connection to an [`InMemoryHub`].
pub struct HubPort {
    hub: Arc<InMemoryHub>,
    local: WorkerId,
}

impl Transport for HubPort {
    fn send(&self, to: WorkerId, msg: RefMessage) -> Result<(), RefError> {
        tracing::trace!(from = %self.local, %to, kind = msg.kind(), "hub send");
        self.hub.queues.entry(to).or_default().push_back(Envelope {
            from: self.local,
            to,
            msg,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::GlobalId;

    #[test]
    fn test_hub_queues_per_worker() {
        let hub = InMemoryHub::new();
        let a = WorkerId::new(0);
        let b = WorkerId::new(1);
        let port = hub.port(a);

        let ref_id = GlobalId::new(a, 1);
        port.send(b, RefMessage::ValueRequest { ref_id }).unwrap();
        port.send(b, RefMessage::ValueRequest { ref_id }).unwrap();

        assert_eq!(hub.pending(b), 2);
        assert_eq!(hub.pending(a), 0);

        let taken = hub.take_all(b);
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].from, a);
        assert_eq!(hub.total_pending(), 0);
    }
}
