//! # tether
//!
//! Distributed reference counting for remote object references shared
//! across a fixed set of cooperating worker processes connected by an
//! unreliable, non-FIFO message transport.
//!
//! A value lives on exactly one worker (its *owner*); other workers hold
//! *forks* of it. The owner must never free the value while any fork is
//! reachable, even though acceptance and deletion notifications can arrive
//! out of order or be delayed indefinitely. Correctness comes entirely
//! from explicit fork/accept/delete handshakes — never from assumed
//! delivery order.
//!
//! One [`RefContext`] per worker coordinates all of that worker's
//! remote-reference state. The transport is a collaborator: outbound
//! messages go through a [`Transport`], inbound messages come back via
//! [`RefContext::handle_message`].
//!
//! ```
//! use std::sync::Arc;
//! use tether::{NoopTransport, RefContext, TypeTag, WorkerId};
//!
//! let ctx = RefContext::new(WorkerId::new(0), Arc::new(NoopTransport));
//! let owner = ctx.create_owner(TypeTag::new("bytes"));
//! let self_fork = ctx.add_self_fork(&owner);
//! owner.set_value(vec![1, 2, 3]).unwrap();
//!
//! assert_eq!(ctx.debug_info().owners, 1);
//! let freed = ctx.release_fork_of_owner(owner.ref_id(), self_fork).unwrap();
//! assert!(freed.is_some());
//! ```

mod context;
mod error;
mod promise;
mod record;
mod reference;
mod transport;

pub use context::{DebugInfo, RefContext, DESTROY_DRAIN_TIMEOUT};
pub use error::{LeakReport, RefError};
pub use promise::Promise;
pub use record::RecordSession;
pub use reference::{OwnerRef, RemoteRef, UserRef};
pub use transport::{Envelope, HubPort, InMemoryHub, NoopTransport, Transport};

pub use tether_core::{ForkId, ForkPayload, GlobalId, RefId, RefMessage, TypeTag, WorkerId};
