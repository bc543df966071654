//! Control protocol for reference counting.
//!
//! Defines the message types exchanged between workers to keep fork sets
//! consistent. Messages are serialized with postcard; [`frame_message`] and
//! [`parse_frame`] add a 4-byte big-endian length prefix for stream
//! transports.
//!
//! Delivery between any two workers may be reordered or delayed, never
//! lost. Only [`RefMessage::ForkRequest`] may be redelivered by a retrying
//! transport; every other kind is expected exactly once.

use crate::fork::ForkPayload;
use crate::id::{ForkId, RefId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reference-counting protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RefMessage {
    /// Register a new fork with the value's owner.
    ///
    /// Sent by a worker that materialized a fork, naming its own fork id.
    /// The owner answers with [`RefMessage::ForkAccept`]. This is the one
    /// message kind a transport may legitimately retry; the owner-side
    /// handler is idempotent.
    ForkRequest {
        /// Descriptor of the fork being registered.
        payload: ForkPayload,
    },

    /// Owner acknowledgment of a registered fork.
    ///
    /// Confirms the pending user holding `fork_id` on the receiving worker.
    ForkAccept {
        /// The fork id being acknowledged.
        fork_id: ForkId,
    },

    /// Child acknowledgment of a received fork, sent to the forwarding
    /// parent.
    ///
    /// Releases the parent's pending-child entry for `fork_id`. Only sent
    /// once the child's own fork is known to the owner, so the parent can
    /// never trigger reclamation of a value the child still needs.
    ChildAccept {
        /// The fork id minted by the parent for this transfer.
        fork_id: ForkId,
    },

    /// A holder released its last local reference to a confirmed fork.
    UserDelete {
        /// The value the fork belongs to.
        ref_id: RefId,
        /// The fork being released.
        fork_id: ForkId,
    },

    /// Request the value's contents from its owner.
    ///
    /// May arrive before the owner slot has been created; the owner
    /// resolves it lazily through its pending-owner table.
    ValueRequest {
        /// The value being fetched.
        ref_id: RefId,
    },

    /// Owner reply carrying the value's serialized contents.
    ValueResponse {
        /// The value being fetched.
        ref_id: RefId,
        /// Serialized value payload.
        value: Vec<u8>,
    },
}

impl RefMessage {
    /// Serialize this message to bytes.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        postcard::to_allocvec(self).map_err(|e| WireError::Encode(e.to_string()))
    }

    /// Deserialize a message from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        postcard::from_bytes(bytes).map_err(|e| WireError::Decode(e.to_string()))
    }

    /// Short name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            RefMessage::ForkRequest { .. } => "fork_request",
            RefMessage::ForkAccept { .. } => "fork_accept",
            RefMessage::ChildAccept { .. } => "child_accept",
            RefMessage::UserDelete { .. } => "user_delete",
            RefMessage::ValueRequest { .. } => "value_request",
            RefMessage::ValueResponse { .. } => "value_response",
        }
    }
}

/// Errors from encoding or decoding protocol messages.
#[derive(Debug, Clone, Error)]
pub enum WireError {
    /// Message encoding failed.
    #[error("encode error: {0}")]
    Encode(String),
    /// Message decoding failed.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Frame a message with a length prefix.
///
/// Format: 4-byte big-endian length + payload.
pub fn frame_message(msg: &RefMessage) -> Result<Vec<u8>, WireError> {
    let payload = msg.encode()?;
    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Try to parse a framed message from a buffer.
///
/// Returns `Some((message, bytes_consumed))` if a complete message is
/// available, or `None` if more data is needed.
pub fn parse_frame(buf: &[u8]) -> Result<Option<(RefMessage, usize)>, WireError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if buf.len() < 4 + len {
        return Ok(None);
    }

    let msg = RefMessage::decode(&buf[4..4 + len])?;
    Ok(Some((msg, 4 + len)))
}
