//! # tether-core
//!
//! Core types for Tether, a distributed reference-counting protocol for
//! values shared across cooperating worker processes.
//!
//! This crate provides the foundational types used throughout the Tether
//! ecosystem:
//!
//! - [`WorkerId`] - Worker process identity
//! - [`GlobalId`] - Globally unique identifier ([`RefId`] / [`ForkId`])
//! - [`TypeTag`] - Opaque type descriptor carried with a value
//! - [`ForkPayload`] - Wire descriptor exchanged when a reference is copied
//! - [`RefMessage`] - Control protocol messages and their framing

#![deny(warnings)]
#![deny(missing_docs)]

mod fork;
mod id;
mod message;

pub use fork::{ForkPayload, TypeTag};
pub use id::{ForkId, GlobalId, RefId, WorkerId};
pub use message::{frame_message, parse_frame, RefMessage, WireError};
