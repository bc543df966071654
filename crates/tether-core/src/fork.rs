//! The fork transfer descriptor.
//!
//! A [`ForkPayload`] is the wire-level record exchanged whenever a
//! reference is copied to another worker, both outbound (serializing a
//! reference into a call) and inbound (materializing one on receipt).

use crate::id::{ForkId, RefId, WorkerId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque type descriptor carried with a value and on the wire.
///
/// Tether does not interpret the tag; it exists so that the owner slot can
/// be created before the value itself arrives, and so receivers can route
/// the eventual payload. Payload typing belongs to the embedding system.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeTag(String);

impl TypeTag {
    /// Creates a tag from any string-like value.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Returns the tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TypeTag {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag({:?})", self.0)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wire descriptor for one fork of a reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkPayload {
    /// The worker that owns the value.
    pub owner: WorkerId,
    /// The identity of the value being referenced.
    pub ref_id: RefId,
    /// The fork id this transfer is made under.
    pub fork_id: ForkId,
    /// The worker the reference is being copied from.
    pub parent: WorkerId,
    /// Type descriptor of the referenced value.
    pub type_tag: TypeTag,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::GlobalId;

    #[test]
    fn test_payload_roundtrip() {
        let payload = ForkPayload {
            owner: WorkerId::new(1),
            ref_id: GlobalId::new(WorkerId::new(0), 5),
            fork_id: GlobalId::new(WorkerId::new(0), 6),
            parent: WorkerId::new(0),
            type_tag: TypeTag::new("tensor"),
        };
        let bytes = postcard::to_allocvec(&payload).unwrap();
        let decoded: ForkPayload = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(payload, decoded);
    }

    #[test]
    fn test_tag_display() {
        let tag = TypeTag::from("blob");
        assert_eq!(tag.as_str(), "blob");
        assert_eq!(format!("{}", tag), "blob");
    }
}
