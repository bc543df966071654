//! Worker and reference identity types.
//!
//! A [`GlobalId`] pairs the minting worker's [`WorkerId`] with a local
//! sequence number. Each worker owns a disjoint id namespace, so ids are
//! unique across the whole run without coordination.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one worker process in the group.
///
/// Worker ids are assigned at bootstrap and stable for a run's lifetime.
///
/// # Examples
///
/// ```
/// use tether_core::WorkerId;
///
/// let a = WorkerId::new(0);
/// let b = WorkerId::new(1);
/// assert_ne!(a, b);
/// assert_eq!(a.as_u16(), 0);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(u16);

impl WorkerId {
    /// Creates a worker id from its raw value.
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Returns the raw worker id.
    #[inline]
    pub const fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerId({})", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A globally unique identifier: the minting worker plus a local sequence.
///
/// Used both as a value identity ([`RefId`]) and as a fork identity
/// ([`ForkId`]). Uniqueness within a worker comes from a monotonically
/// increasing counter; uniqueness across workers from the disjoint
/// [`WorkerId`] namespaces.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalId {
    /// The worker that minted this id.
    worker: WorkerId,
    /// Sequence number within the minting worker.
    local: u64,
}

impl GlobalId {
    /// Creates an id from its parts.
    pub const fn new(worker: WorkerId, local: u64) -> Self {
        Self { worker, local }
    }

    /// Returns the worker that minted this id.
    #[inline]
    pub const fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Returns the sequence number within the minting worker.
    #[inline]
    pub const fn local(&self) -> u64 {
        self.local
    }
}

impl fmt::Debug for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalId<{}.{}>", self.worker, self.local)
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}.{}>", self.worker, self.local)
    }
}

/// The identity of a value: the [`GlobalId`] minted for the original value.
///
/// Note the minting worker is the worker that *named* the value, which is
/// not necessarily its owner; the owner travels separately in
/// [`ForkPayload`](crate::ForkPayload).
pub type RefId = GlobalId;

/// The identity of one reference instance (fork) of a value.
pub type ForkId = GlobalId;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_display() {
        let id = GlobalId::new(WorkerId::new(3), 17);
        assert_eq!(format!("{}", id), "<3.17>");
        assert_eq!(format!("{:?}", id), "GlobalId<3.17>");
    }

    #[test]
    fn test_hash_distinct() {
        let mut set = HashSet::new();
        set.insert(GlobalId::new(WorkerId::new(0), 1));
        set.insert(GlobalId::new(WorkerId::new(1), 1));
        set.insert(GlobalId::new(WorkerId::new(0), 1));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_serialization() {
        let id = GlobalId::new(WorkerId::new(7), 42);
        let bytes = postcard::to_allocvec(&id).unwrap();
        let decoded: GlobalId = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(id, decoded);
    }

    proptest! {
        /// Ids from different workers never collide, whatever the sequence.
        #[test]
        fn prop_disjoint_namespaces(
            w1 in 0u16..100,
            w2 in 0u16..100,
            l1 in 0u64..10_000,
            l2 in 0u64..10_000,
        ) {
            let a = GlobalId::new(WorkerId::new(w1), l1);
            let b = GlobalId::new(WorkerId::new(w2), l2);
            prop_assert_eq!(a == b, w1 == w2 && l1 == l2);
        }

        /// Postcard round-trip preserves identity.
        #[test]
        fn prop_roundtrip(w in any::<u16>(), l in any::<u64>()) {
            let id = GlobalId::new(WorkerId::new(w), l);
            let bytes = postcard::to_allocvec(&id).unwrap();
            prop_assert_eq!(id, postcard::from_bytes::<GlobalId>(&bytes).unwrap());
        }
    }
}
