//! Owner and user references.
//!
//! An [`OwnerRef`] is the authoritative slot for a value; it exists on
//! exactly one worker. A [`UserRef`] is a lightweight handle into a remote
//! owner. Both sides of the protocol pass a [`RemoteRef`], which is
//! polymorphic over the two.

use crate::context::Shared;
use crate::error::RefError;
use crate::promise::Promise;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tether_core::{ForkId, RefId, TypeTag, WorkerId};

/// The authoritative reference to a locally owned value.
///
/// The stored value is an opaque byte payload behind a single-assignment
/// future: the slot can be created (and forked) before the value itself
/// has been produced, and readers suspend on [`OwnerRef::value_future`]
/// until [`OwnerRef::set_value`] runs.
pub struct OwnerRef {
    worker: WorkerId,
    ref_id: RefId,
    type_tag: TypeTag,
    value: Promise<Vec<u8>>,
}

impl OwnerRef {
    pub(crate) fn new(worker: WorkerId, ref_id: RefId, type_tag: TypeTag) -> Self {
        Self {
            worker,
            ref_id,
            type_tag,
            value: Promise::new(),
        }
    }

    /// The worker this value lives on.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Identity of the owned value.
    pub fn ref_id(&self) -> RefId {
        self.ref_id
    }

    /// Type descriptor of the owned value.
    pub fn type_tag(&self) -> &TypeTag {
        &self.type_tag
    }

    /// Stores the value, waking every reader.
    ///
    /// A value can be set once; a second call returns
    /// [`RefError::AlreadyCompleted`].
    pub fn set_value(&self, value: Vec<u8>) -> Result<(), RefError> {
        self.value.complete(value)
    }

    /// Future of the stored value. May be read concurrently by any number
    /// of local accessors once set.
    pub fn value_future(&self) -> Promise<Vec<u8>> {
        self.value.clone()
    }

    /// The value, if already set.
    pub fn try_value(&self) -> Option<Vec<u8>> {
        if self.value.is_complete() {
            self.value.wait().ok()
        } else {
            None
        }
    }
}

impl PartialEq for OwnerRef {
    fn eq(&self, other: &Self) -> bool {
        self.worker == other.worker
            && self.ref_id == other.ref_id
            && self.type_tag == other.type_tag
    }
}

impl fmt::Debug for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerRef")
            .field("worker", &self.worker)
            .field("ref_id", &self.ref_id)
            .field("type_tag", &self.type_tag)
            .field("has_value", &self.value.is_complete())
            .finish()
    }
}

/// A handle to a value owned by another worker.
///
/// The `Arc` strong count is the local reference count: all local holders
/// of the same value share one `UserRef` (fork merging), and dropping the
/// last holder starts the delete handshake with the owner. The context's
/// own tables hold strong references while the fork is pending or
/// forwarded, which is what defers deletion until it is safe.
pub struct UserRef {
    owner: WorkerId,
    ref_id: RefId,
    fork_id: ForkId,
    type_tag: TypeTag,
    confirmed: AtomicBool,
    ctx: Weak<Shared>,
}

impl UserRef {
    pub(crate) fn new(
        ctx: Weak<Shared>,
        owner: WorkerId,
        ref_id: RefId,
        fork_id: ForkId,
        type_tag: TypeTag,
    ) -> Self {
        Self {
            owner,
            ref_id,
            fork_id,
            type_tag,
            confirmed: AtomicBool::new(false),
            ctx,
        }
    }

    /// The worker that owns the referenced value.
    pub fn owner(&self) -> WorkerId {
        self.owner
    }

    /// Identity of the referenced value.
    pub fn ref_id(&self) -> RefId {
        self.ref_id
    }

    /// This worker's own fork id for the value.
    pub fn fork_id(&self) -> ForkId {
        self.fork_id
    }

    /// Type descriptor of the referenced value.
    pub fn type_tag(&self) -> &TypeTag {
        &self.type_tag
    }

    /// True once the owner has acknowledged this fork.
    pub fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_confirmed(&self) {
        self.confirmed.store(true, Ordering::SeqCst);
    }
}

impl Drop for UserRef {
    fn drop(&mut self) {
        if let Some(shared) = self.ctx.upgrade() {
            shared.release_user(self);
        }
    }
}

impl fmt::Debug for UserRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserRef")
            .field("owner", &self.owner)
            .field("ref_id", &self.ref_id)
            .field("fork_id", &self.fork_id)
            .field("confirmed", &self.is_confirmed())
            .finish()
    }
}

/// Either side of a reference.
#[derive(Clone)]
pub enum RemoteRef {
    /// The authoritative reference, on the value's owner.
    Owner(Arc<OwnerRef>),
    /// A remote handle, on any other worker.
    User(Arc<UserRef>),
}

impl RemoteRef {
    /// Identity of the referenced value.
    pub fn ref_id(&self) -> RefId {
        match self {
            RemoteRef::Owner(owner) => owner.ref_id(),
            RemoteRef::User(user) => user.ref_id(),
        }
    }

    /// The worker the value lives on.
    pub fn owner_worker(&self) -> WorkerId {
        match self {
            RemoteRef::Owner(owner) => owner.worker(),
            RemoteRef::User(user) => user.owner(),
        }
    }

    /// Type descriptor of the referenced value.
    pub fn type_tag(&self) -> &TypeTag {
        match self {
            RemoteRef::Owner(owner) => owner.type_tag(),
            RemoteRef::User(user) => user.type_tag(),
        }
    }

    /// True on the owning worker.
    pub fn is_owner(&self) -> bool {
        matches!(self, RemoteRef::Owner(_))
    }

    /// The owner side, if this is one.
    pub fn as_owner(&self) -> Option<&Arc<OwnerRef>> {
        match self {
            RemoteRef::Owner(owner) => Some(owner),
            RemoteRef::User(_) => None,
        }
    }

    /// The user side, if this is one.
    pub fn as_user(&self) -> Option<&Arc<UserRef>> {
        match self {
            RemoteRef::User(user) => Some(user),
            RemoteRef::Owner(_) => None,
        }
    }
}

impl fmt::Debug for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteRef::Owner(owner) => write!(f, "RemoteRef::Owner({:?})", owner),
            RemoteRef::User(user) => write!(f, "RemoteRef::User({:?})", user),
        }
    }
}
