//! Error types for the reference context.

use std::fmt;
use tether_core::{ForkId, RefId};
use thiserror::Error;

/// Errors surfaced by the reference context.
///
/// Protocol violations (`DuplicateFork`, `UnknownFork`, `UnknownRef`) are
/// fatal to the triggering call: they indicate a transport bug or a logic
/// error, and a local retry cannot repair the inconsistent state. They are
/// never swallowed; every handler returns them to its caller.
///
/// The type is `Clone` so a failed future can hand the same error to every
/// waiter.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RefError {
    /// A fork id was registered twice through the non-idempotent path.
    #[error("duplicate fork {fork_id} registered for reference {ref_id}")]
    DuplicateFork {
        /// The value the fork belongs to.
        ref_id: RefId,
        /// The fork that was already registered.
        fork_id: ForkId,
    },

    /// A fork id is not present in any tracked state.
    #[error("fork {0} is not tracked by this context")]
    UnknownFork(ForkId),

    /// A reference has no live fork set on this owner.
    #[error("no live fork set for reference {0}")]
    UnknownRef(RefId),

    /// A single-assignment future was completed twice.
    #[error("future already completed")]
    AlreadyCompleted,

    /// The context was torn down while the operation was outstanding.
    #[error("reference context has been destroyed")]
    Destroyed,

    /// Residual entries survived a bounded drain at teardown.
    #[error("reference leak on shutdown: {0}")]
    Leak(LeakReport),

    /// Outbound send failed.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Aggregated listing of entries still alive at teardown.
///
/// A leak is a diagnostic, not a safety violation: the process may still
/// shut down, and the ids listed here are what an operator needs to chase
/// the holder that never released.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeakReport {
    /// Owner slots still installed.
    pub owners: Vec<RefId>,
    /// Live forks per owner slot.
    pub forks: Vec<(RefId, ForkId)>,
    /// Users never confirmed by their owner.
    pub pending_users: Vec<ForkId>,
    /// Confirmed users never deleted by their holder.
    pub confirmed_users: Vec<ForkId>,
    /// Forwarded references never acknowledged by the receiving worker.
    pub pending_children: Vec<ForkId>,
}

impl LeakReport {
    /// True if nothing leaked.
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
            && self.forks.is_empty()
            && self.pending_users.is_empty()
            && self.confirmed_users.is_empty()
            && self.pending_children.is_empty()
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sections = Vec::new();
        if !self.owners.is_empty() {
            sections.push(format!("owners {:?}", self.owners));
        }
        if !self.forks.is_empty() {
            sections.push(format!("forks {:?}", self.forks));
        }
        if !self.pending_users.is_empty() {
            sections.push(format!("pending users {:?}", self.pending_users));
        }
        if !self.confirmed_users.is_empty() {
            sections.push(format!("confirmed users {:?}", self.confirmed_users));
        }
        if !self.pending_children.is_empty() {
            sections.push(format!("pending children {:?}", self.pending_children));
        }
        if sections.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&sections.join("; "))
        }
    }
}
