//! The per-worker reference context.
//!
//! One [`RefContext`] per worker coordinates all remote-reference state:
//! the owner registry and pending-owner table, the user-side tables, and
//! the drain coordinator. All tables live behind a single mutex; critical
//! sections are O(1) map operations, and every transport send, promise
//! completion, and reference drop happens strictly after the lock is
//! released. That last rule is what makes the RAII delete path in
//! [`UserRef`] safe to run from anywhere.
//!
//! The context is a cheap cloneable handle: construct one per worker and
//! clone it into transport callbacks freely.

use crate::error::{LeakReport, RefError};
use crate::promise::Promise;
use crate::record::RecordSession;
use crate::reference::{OwnerRef, RemoteRef, UserRef};
use crate::transport::Transport;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tether_core::{ForkId, ForkPayload, GlobalId, RefId, RefMessage, TypeTag, WorkerId};

/// Drain bound applied by [`RefContext::destroy`].
pub const DESTROY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A user reference awaiting owner acknowledgment.
struct PendingUser {
    user: Arc<UserRef>,
    ready: Promise<()>,
    /// `(parent worker, fork id minted by that parent)` pairs, acknowledged
    /// only once the owner has confirmed this worker's own fork. Until
    /// then the parent must keep its copy alive, because nothing else
    /// guarantees the owner already knows about this worker's handle.
    deferred_accepts: Vec<(WorkerId, ForkId)>,
}

#[derive(Default)]
struct Tables {
    /// Values owned by this worker, kept alive while any fork is tracked.
    owners: HashMap<RefId, Arc<OwnerRef>>,
    /// Futures for owned values requested before their creation arrived.
    pending_owners: HashMap<RefId, Promise<Arc<OwnerRef>>>,
    /// Live fork set per owned value.
    forks: HashMap<RefId, HashSet<ForkId>>,
    /// Users not yet acknowledged by their owner. Holds a strong reference,
    /// which is what defers deletion of a still-pending user.
    pending_users: HashMap<ForkId, PendingUser>,
    /// Users acknowledged by their owner; weak because the holder's own
    /// ownership keeps them alive from here on.
    confirmed_users: HashMap<ForkId, Weak<UserRef>>,
    /// The one live local handle per referenced value (fork merging).
    local_users: HashMap<RefId, (ForkId, Weak<UserRef>)>,
    /// References forwarded to another worker, held until that worker
    /// acknowledges receipt.
    pending_children: HashMap<ForkId, RemoteRef>,
    /// Outstanding value fetches, merged per value.
    pending_fetches: HashMap<RefId, Promise<Vec<u8>>>,
}

/// State shared between context handles and the references they minted.
pub(crate) struct Shared {
    worker_id: WorkerId,
    transport: Arc<dyn Transport>,
    next_local: AtomicU64,
    destroyed: AtomicBool,
    tables: Mutex<Tables>,
    users_cv: Condvar,
}

impl Shared {
    /// Final release of a user reference, run from [`UserRef`]'s `Drop`.
    ///
    /// Cannot race its own table entries: the pending tables hold strong
    /// references, so by the time this runs the fork is either confirmed
    /// or being discarded by teardown.
    pub(crate) fn release_user(&self, user: &UserRef) {
        let ref_id = user.ref_id();
        let fork_id = user.fork_id();
        {
            let mut tables = self.tables.lock();
            tables.confirmed_users.remove(&fork_id);
            let is_current = tables
                .local_users
                .get(&ref_id)
                .map_or(false, |(fid, _)| *fid == fork_id);
            if is_current {
                tables.local_users.remove(&ref_id);
            }
            self.users_cv.notify_all();
        }
        if user.is_confirmed() && !self.destroyed.load(Ordering::SeqCst) {
            tracing::debug!(%ref_id, %fork_id, owner = %user.owner(), "releasing user reference");
            if let Err(error) = self
                .transport
                .send(user.owner(), RefMessage::UserDelete { ref_id, fork_id })
            {
                tracing::warn!(%ref_id, %fork_id, %error, "failed to send delete notification");
            }
        }
    }
}

/// Handle to a worker's reference-counting state.
#[derive(Clone)]
pub struct RefContext {
    shared: Arc<Shared>,
}

impl RefContext {
    /// Creates the context for one worker, wired to its outbound transport.
    pub fn new(worker_id: WorkerId, transport: Arc<dyn Transport>) -> Self {
        Self {
            shared: Arc::new(Shared {
                worker_id,
                transport,
                next_local: AtomicU64::new(0),
                destroyed: AtomicBool::new(false),
                tables: Mutex::new(Tables::default()),
                users_cv: Condvar::new(),
            }),
        }
    }

    /// This worker's id.
    pub fn worker_id(&self) -> WorkerId {
        self.shared.worker_id
    }

    /// Mints a globally unique id.
    ///
    /// No two calls on the same context return the same value; uniqueness
    /// across workers follows from the disjoint worker-id namespaces.
    pub fn next_id(&self) -> GlobalId {
        GlobalId::new(
            self.shared.worker_id,
            self.shared.next_local.fetch_add(1, Ordering::Relaxed),
        )
    }

    // === Owner registry ===

    /// Installs a fresh owner slot for a value originating on this worker.
    ///
    /// The slot starts with an empty fork set; pair it with
    /// [`RefContext::add_self_fork`] (or an immediate
    /// [`RefContext::prepare_fork`]) so the registry's liveness rule has a
    /// fork to track.
    pub fn create_owner(&self, type_tag: TypeTag) -> Arc<OwnerRef> {
        let ref_id = self.next_id();
        self.get_or_create_owner(ref_id, type_tag)
    }

    /// Returns the owner slot for `ref_id`, installing it if absent.
    ///
    /// Exactly one instance is ever installed per id, however many callers
    /// race here. Installing fulfills any future handed out by
    /// [`RefContext::owner_future`] while the value was still unknown.
    pub fn get_or_create_owner(&self, ref_id: RefId, type_tag: TypeTag) -> Arc<OwnerRef> {
        let (owner, waiter) = {
            let mut tables = self.shared.tables.lock();
            if let Some(existing) = tables.owners.get(&ref_id) {
                (existing.clone(), None)
            } else {
                let owner = Arc::new(OwnerRef::new(self.shared.worker_id, ref_id, type_tag));
                tables.owners.insert(ref_id, owner.clone());
                (owner, tables.pending_owners.remove(&ref_id))
            }
        };
        if let Some(waiter) = waiter {
            tracing::debug!(%ref_id, "owner slot created after being requested");
            let _ = waiter.complete(owner.clone());
        }
        owner
    }

    /// Future of the owner slot for `ref_id`.
    ///
    /// Already-completed if the slot exists. Otherwise the request parks in
    /// the pending-owner table, so a fetch arriving before the creation
    /// message never blocks a handler thread.
    pub fn owner_future(&self, ref_id: RefId) -> Promise<Arc<OwnerRef>> {
        let mut tables = self.shared.tables.lock();
        if let Some(owner) = tables.owners.get(&ref_id) {
            return Promise::ready(owner.clone());
        }
        tables
            .pending_owners
            .entry(ref_id)
            .or_insert_with(Promise::new)
            .clone()
    }

    /// Registers a fork held by the owner's own worker.
    ///
    /// Keeps the slot alive across a self-directed remote call; release it
    /// like any other fork once the call completes.
    pub fn add_self_fork(&self, owner: &Arc<OwnerRef>) -> ForkId {
        let fork_id = self.next_id();
        {
            let mut tables = self.shared.tables.lock();
            tables
                .forks
                .entry(owner.ref_id())
                .or_default()
                .insert(fork_id);
        }
        tracing::debug!(ref_id = %owner.ref_id(), %fork_id, "registered self fork");
        fork_id
    }

    /// Adds `fork_id` to the live-fork set of `ref_id`.
    ///
    /// Strict variant: a duplicate indicates a protocol bug and fails with
    /// [`RefError::DuplicateFork`]. Used for every message kind the
    /// transport delivers exactly once.
    pub fn register_fork_of_owner(&self, ref_id: RefId, fork_id: ForkId) -> Result<(), RefError> {
        {
            let mut tables = self.shared.tables.lock();
            if !tables.forks.entry(ref_id).or_default().insert(fork_id) {
                return Err(RefError::DuplicateFork { ref_id, fork_id });
            }
        }
        tracing::debug!(%ref_id, %fork_id, "registered fork");
        Ok(())
    }

    /// Idempotent fork registration, for the one message kind
    /// ([`RefMessage::ForkRequest`]) the transport may legitimately retry.
    ///
    /// Returns `false` if the fork was already present; the live-fork set
    /// is unchanged in that case.
    pub fn register_fork_if_absent(&self, ref_id: RefId, fork_id: ForkId) -> bool {
        let inserted = {
            let mut tables = self.shared.tables.lock();
            tables.forks.entry(ref_id).or_default().insert(fork_id)
        };
        if inserted {
            tracing::debug!(%ref_id, %fork_id, "registered fork");
        } else {
            tracing::trace!(%ref_id, %fork_id, "duplicate fork registration ignored");
        }
        inserted
    }

    /// Removes `fork_id` from the live-fork set of `ref_id`.
    ///
    /// When the set empties, the owner slot is removed and returned; the
    /// caller performs any destruction that needs host-runtime
    /// coordination, then drops it. Releasing a fork not present in any
    /// tracked state is a protocol violation.
    pub fn release_fork_of_owner(
        &self,
        ref_id: RefId,
        fork_id: ForkId,
    ) -> Result<Option<Arc<OwnerRef>>, RefError> {
        let freed = {
            let mut tables = self.shared.tables.lock();
            let set = tables
                .forks
                .get_mut(&ref_id)
                .ok_or(RefError::UnknownRef(ref_id))?;
            if !set.remove(&fork_id) {
                return Err(RefError::UnknownFork(fork_id));
            }
            let freed = if set.is_empty() {
                tables.forks.remove(&ref_id);
                tables.owners.remove(&ref_id)
            } else {
                None
            };
            self.shared.users_cv.notify_all();
            freed
        };
        if freed.is_some() {
            tracing::debug!(%ref_id, %fork_id, "last fork released, owner slot freed");
        } else {
            tracing::debug!(%ref_id, %fork_id, "fork released");
        }
        Ok(freed)
    }

    // === Fork protocol ===

    /// Prepares `reference` for transmission to another worker.
    ///
    /// Mints the transfer's fork id and retains the reference in the
    /// pending-children table until the receiver acknowledges it — message
    /// delivery is not ordered, so releasing earlier could let a delete
    /// notification overtake the transfer. An owner-side source also
    /// registers the fork in its own live set directly.
    pub fn prepare_fork(&self, reference: &RemoteRef) -> Result<ForkPayload, RefError> {
        let fork_id = self.next_id();
        let ref_id = reference.ref_id();
        if reference.is_owner() {
            self.register_fork_of_owner(ref_id, fork_id)?;
        }
        {
            let mut tables = self.shared.tables.lock();
            tables.pending_children.insert(fork_id, reference.clone());
        }
        tracing::debug!(%ref_id, %fork_id, owner = %reference.owner_worker(), "prepared fork for transfer");
        Ok(ForkPayload {
            owner: reference.owner_worker(),
            ref_id,
            fork_id,
            parent: self.shared.worker_id,
            type_tag: reference.type_tag().clone(),
        })
    }

    /// Materializes a received fork descriptor into a local reference.
    ///
    /// On the owning worker this resolves to the owner slot (creating it
    /// if the transfer outran the creation message). Elsewhere it resolves
    /// to this worker's single local handle for the value, creating a
    /// pending user — registered with the owner under a freshly minted
    /// fork id — if none is live. The received fork id is never adopted;
    /// it is acknowledged back to the parent once it is safe to do so,
    /// which for a pending handle means after owner confirmation.
    ///
    /// A `session` records the pending future of every materialization it
    /// observes, so a caller can later block until all of them confirmed.
    pub fn materialize_fork(
        &self,
        payload: &ForkPayload,
        session: Option<&RecordSession>,
    ) -> Result<RemoteRef, RefError> {
        if payload.owner == self.shared.worker_id {
            // A reference to a locally owned value came back home.
            let owner = self.get_or_create_owner(payload.ref_id, payload.type_tag.clone());
            self.acknowledge_child(payload.parent, payload.fork_id)?;
            return Ok(RemoteRef::Owner(owner));
        }

        enum Outcome {
            Merged(Arc<UserRef>),
            MergedPending(Arc<UserRef>),
            Fresh(Arc<UserRef>, ForkPayload),
        }

        let outcome = {
            let mut tables = self.shared.tables.lock();
            let existing = tables
                .local_users
                .get(&payload.ref_id)
                .and_then(|(fid, weak)| weak.upgrade().map(|user| (*fid, user)));
            match existing {
                Some((fork_id, user)) => {
                    if let Some(pending) = tables.pending_users.get_mut(&fork_id) {
                        pending
                            .deferred_accepts
                            .push((payload.parent, payload.fork_id));
                        if let Some(session) = session {
                            session.record(pending.ready.clone());
                        }
                        Outcome::MergedPending(user)
                    } else {
                        Outcome::Merged(user)
                    }
                }
                None => {
                    let own_fork = self.next_id();
                    let user = Arc::new(UserRef::new(
                        Arc::downgrade(&self.shared),
                        payload.owner,
                        payload.ref_id,
                        own_fork,
                        payload.type_tag.clone(),
                    ));
                    let ready = Promise::new();
                    if let Some(session) = session {
                        session.record(ready.clone());
                    }
                    tables.pending_users.insert(
                        own_fork,
                        PendingUser {
                            user: user.clone(),
                            ready,
                            deferred_accepts: vec![(payload.parent, payload.fork_id)],
                        },
                    );
                    tables
                        .local_users
                        .insert(payload.ref_id, (own_fork, Arc::downgrade(&user)));
                    let request = ForkPayload {
                        owner: payload.owner,
                        ref_id: payload.ref_id,
                        fork_id: own_fork,
                        parent: self.shared.worker_id,
                        type_tag: payload.type_tag.clone(),
                    };
                    Outcome::Fresh(user, request)
                }
            }
        };

        match outcome {
            Outcome::Merged(user) => {
                self.acknowledge_child(payload.parent, payload.fork_id)?;
                Ok(RemoteRef::User(user))
            }
            Outcome::MergedPending(user) => {
                tracing::debug!(
                    ref_id = %payload.ref_id,
                    received = %payload.fork_id,
                    "merged into pending local handle, accept deferred"
                );
                Ok(RemoteRef::User(user))
            }
            Outcome::Fresh(user, request) => {
                tracing::debug!(
                    ref_id = %payload.ref_id,
                    fork_id = %user.fork_id(),
                    received = %payload.fork_id,
                    "materialized pending user reference"
                );
                self.shared
                    .transport
                    .send(request.owner, RefMessage::ForkRequest { payload: request })?;
                Ok(RemoteRef::User(user))
            }
        }
    }

    fn acknowledge_child(&self, parent: WorkerId, fork_id: ForkId) -> Result<(), RefError> {
        if parent == self.shared.worker_id {
            // Local round-trip: retire the pending child directly.
            self.on_child_accept(fork_id).map(|_| ())
        } else {
            tracing::debug!(%fork_id, %parent, "acknowledging received fork to parent");
            self.shared
                .transport
                .send(parent, RefMessage::ChildAccept { fork_id })
        }
    }

    /// Creates a user reference to a value that will live on `owner`,
    /// before any message has been exchanged.
    ///
    /// This is the remote-call return path: both ids are minted here, the
    /// handle starts pending, and the returned descriptor travels inside
    /// the caller's own call message — the owner side runs
    /// [`RefContext::on_remote_create`] when it arrives. Deliberately
    /// never recorded in a [`RecordSession`]: creating return-value
    /// references in a loop must not block on confirmations.
    pub fn create_user(&self, owner: WorkerId, type_tag: TypeTag) -> (Arc<UserRef>, ForkPayload) {
        let ref_id = self.next_id();
        let fork_id = self.next_id();
        let user = Arc::new(UserRef::new(
            Arc::downgrade(&self.shared),
            owner,
            ref_id,
            fork_id,
            type_tag.clone(),
        ));
        {
            let mut tables = self.shared.tables.lock();
            tables.pending_users.insert(
                fork_id,
                PendingUser {
                    user: user.clone(),
                    ready: Promise::new(),
                    deferred_accepts: Vec::new(),
                },
            );
            tables
                .local_users
                .insert(ref_id, (fork_id, Arc::downgrade(&user)));
        }
        tracing::debug!(%ref_id, %fork_id, %owner, "created user reference for remote value");
        let payload = ForkPayload {
            owner,
            ref_id,
            fork_id,
            parent: self.shared.worker_id,
            type_tag,
        };
        (user, payload)
    }

    /// Owner-side handling of a remote-create descriptor embedded in an
    /// application call message.
    ///
    /// Installs the owner slot, registers the creator's fork strictly
    /// (this message kind is never retried), and acknowledges the creator.
    /// Returns the slot so the call handler can store the computed value.
    pub fn on_remote_create(&self, payload: &ForkPayload) -> Result<Arc<OwnerRef>, RefError> {
        let owner = self.get_or_create_owner(payload.ref_id, payload.type_tag.clone());
        self.register_fork_of_owner(payload.ref_id, payload.fork_id)?;
        self.shared.transport.send(
            payload.parent,
            RefMessage::ForkAccept {
                fork_id: payload.fork_id,
            },
        )?;
        Ok(owner)
    }

    /// Owner-side handling of [`RefMessage::ForkRequest`].
    ///
    /// Idempotent, and re-acks on duplicates: the request is the one
    /// message kind the transport may retry, so the registration must
    /// tolerate redelivery and the requester must always get its accept.
    pub fn on_fork_request(&self, from: WorkerId, payload: &ForkPayload) -> Result<(), RefError> {
        self.get_or_create_owner(payload.ref_id, payload.type_tag.clone());
        self.register_fork_if_absent(payload.ref_id, payload.fork_id);
        self.shared.transport.send(
            from,
            RefMessage::ForkAccept {
                fork_id: payload.fork_id,
            },
        )
    }

    /// Handling of [`RefMessage::ForkAccept`]: the owner confirmed
    /// `fork_id`.
    ///
    /// Moves the user pending → confirmed (weak-tracked from here on),
    /// completes its future, and emits the acknowledgments that were
    /// parked on confirmation. A duplicate accept — the tail of a retried
    /// fork request — is tolerated while the fork is still tracked;
    /// anything else is an unknown fork.
    pub fn on_fork_accept(&self, fork_id: ForkId) -> Result<(), RefError> {
        let state = {
            let mut tables = self.shared.tables.lock();
            match tables.pending_users.remove(&fork_id) {
                Some(state) => {
                    state.user.mark_confirmed();
                    tables
                        .confirmed_users
                        .insert(fork_id, Arc::downgrade(&state.user));
                    self.shared.users_cv.notify_all();
                    state
                }
                None => {
                    return if tables.confirmed_users.contains_key(&fork_id) {
                        tracing::trace!(%fork_id, "duplicate fork accept ignored");
                        Ok(())
                    } else {
                        Err(RefError::UnknownFork(fork_id))
                    };
                }
            }
        };
        tracing::debug!(%fork_id, "user reference confirmed by owner");
        for (parent, received) in &state.deferred_accepts {
            self.acknowledge_child(*parent, *received)?;
        }
        let _ = state.ready.complete(());
        // Dropping `state.user` may be the last strong reference if the
        // holder already released; that starts the delete handshake.
        Ok(())
    }

    /// Handling of [`RefMessage::ChildAccept`]: the worker we forwarded
    /// `fork_id` to has registered its own handle with the owner.
    ///
    /// The pending-child entry is dropped. For an owner-side source, the
    /// out-fork registered at prepare time is released as well — which can
    /// free the slot, returned to the caller for host-coordinated
    /// destruction.
    pub fn on_child_accept(&self, fork_id: ForkId) -> Result<Option<Arc<OwnerRef>>, RefError> {
        let child = {
            let mut tables = self.shared.tables.lock();
            let child = tables
                .pending_children
                .remove(&fork_id)
                .ok_or(RefError::UnknownFork(fork_id))?;
            self.shared.users_cv.notify_all();
            child
        };
        tracing::debug!(%fork_id, "forwarded reference acknowledged by child");
        match child {
            RemoteRef::Owner(owner) => self.release_fork_of_owner(owner.ref_id(), fork_id),
            RemoteRef::User(_) => Ok(None),
        }
    }

    /// Handling of [`RefMessage::UserDelete`]: a holder released its last
    /// local reference to a confirmed fork.
    pub fn on_user_delete(
        &self,
        ref_id: RefId,
        fork_id: ForkId,
    ) -> Result<Option<Arc<OwnerRef>>, RefError> {
        tracing::debug!(%ref_id, %fork_id, "delete notification received");
        self.release_fork_of_owner(ref_id, fork_id)
    }

    /// The still-pending user holding `fork_id`.
    ///
    /// Fails with [`RefError::UnknownFork`] once the user has been
    /// confirmed (or was never created here).
    pub fn pending_user(&self, fork_id: ForkId) -> Result<Arc<UserRef>, RefError> {
        let tables = self.shared.tables.lock();
        tables
            .pending_users
            .get(&fork_id)
            .map(|state| state.user.clone())
            .ok_or(RefError::UnknownFork(fork_id))
    }

    /// Fails a pending user whose confirmation can no longer arrive.
    ///
    /// Every waiter on its future observes `error` exactly once; the
    /// handle is discarded without a delete notification, since the owner
    /// never acknowledged it.
    pub fn fail_pending_user(&self, fork_id: ForkId, error: RefError) -> Result<(), RefError> {
        let state = {
            let mut tables = self.shared.tables.lock();
            let state = tables
                .pending_users
                .remove(&fork_id)
                .ok_or(RefError::UnknownFork(fork_id))?;
            let ref_id = state.user.ref_id();
            let is_current = tables
                .local_users
                .get(&ref_id)
                .map_or(false, |(fid, _)| *fid == fork_id);
            if is_current {
                tables.local_users.remove(&ref_id);
            }
            self.shared.users_cv.notify_all();
            state
        };
        tracing::warn!(%fork_id, %error, "pending user reference failed");
        let _ = state.ready.fail(error);
        Ok(())
    }

    // === Value transfer ===

    /// Future of the referenced value's contents.
    ///
    /// On the owner this is the value future itself. On a user worker the
    /// first call sends a [`RefMessage::ValueRequest`] to the owner and
    /// subsequent calls for the same value merge onto the same future
    /// until the response lands.
    pub fn fetch_value(&self, reference: &RemoteRef) -> Promise<Vec<u8>> {
        match reference {
            RemoteRef::Owner(owner) => owner.value_future(),
            RemoteRef::User(user) => {
                let ref_id = user.ref_id();
                let (promise, first) = {
                    let mut tables = self.shared.tables.lock();
                    match tables.pending_fetches.entry(ref_id) {
                        Entry::Occupied(entry) => (entry.get().clone(), false),
                        Entry::Vacant(entry) => (entry.insert(Promise::new()).clone(), true),
                    }
                };
                if first {
                    tracing::debug!(%ref_id, owner = %user.owner(), "requesting value from owner");
                    if let Err(error) = self
                        .shared
                        .transport
                        .send(user.owner(), RefMessage::ValueRequest { ref_id })
                    {
                        let _ = promise.fail(error);
                    }
                }
                promise
            }
        }
    }

    /// Owner-side handling of [`RefMessage::ValueRequest`].
    ///
    /// Never blocks the handler thread: an unknown `ref_id` parks on the
    /// pending-owner table and the reply chains off the owner and value
    /// futures.
    pub fn on_value_request(&self, from: WorkerId, ref_id: RefId) {
        tracing::debug!(%ref_id, %from, "value requested");
        let transport = Arc::clone(&self.shared.transport);
        self.owner_future(ref_id).then(move |result| {
            let owner = match result {
                Ok(owner) => owner.clone(),
                Err(_) => return,
            };
            owner.value_future().then(move |value| {
                if let Ok(value) = value {
                    let msg = RefMessage::ValueResponse {
                        ref_id,
                        value: value.clone(),
                    };
                    if let Err(error) = transport.send(from, msg) {
                        tracing::warn!(%ref_id, %error, "failed to send value response");
                    }
                }
            });
        });
    }

    /// User-side handling of [`RefMessage::ValueResponse`].
    pub fn on_value_response(&self, ref_id: RefId, value: Vec<u8>) {
        let promise = self.shared.tables.lock().pending_fetches.remove(&ref_id);
        match promise {
            Some(promise) => {
                let _ = promise.complete(value);
            }
            None => tracing::trace!(%ref_id, "value response with no outstanding fetch"),
        }
    }

    /// Dispatches an inbound protocol message.
    ///
    /// A `Some` result carries an owner slot freed by the message; the
    /// caller destroys it under whatever synchronization the stored value
    /// needs, then drops it.
    pub fn handle_message(
        &self,
        from: WorkerId,
        msg: RefMessage,
    ) -> Result<Option<Arc<OwnerRef>>, RefError> {
        tracing::trace!(%from, kind = msg.kind(), "handling message");
        match msg {
            RefMessage::ForkRequest { payload } => {
                self.on_fork_request(from, &payload).map(|_| None)
            }
            RefMessage::ForkAccept { fork_id } => self.on_fork_accept(fork_id).map(|_| None),
            RefMessage::ChildAccept { fork_id } => self.on_child_accept(fork_id),
            RefMessage::UserDelete { ref_id, fork_id } => self.on_user_delete(ref_id, fork_id),
            RefMessage::ValueRequest { ref_id } => {
                self.on_value_request(from, ref_id);
                Ok(None)
            }
            RefMessage::ValueResponse { ref_id, value } => {
                self.on_value_response(ref_id, value);
                Ok(None)
            }
        }
    }

    // === Recording ===

    /// Opens a recording session for the current call context.
    ///
    /// Pass it to [`RefContext::materialize_fork`] while deserializing
    /// call arguments, then [`RecordSession::drain`] to block until every
    /// recorded reference is confirmed.
    pub fn begin_recording(&self) -> RecordSession {
        RecordSession::new()
    }

    // === Drain and teardown ===

    /// Blocks until the pending-users and confirmed-users tables are both
    /// empty, or `timeout` elapses.
    ///
    /// Every table mutation that removes an entry signals the shared
    /// condition variable; the loop rechecks emptiness on each signal.
    /// Returns `false` on timeout, which is not an error by itself — it is
    /// the signal that triggers leak reporting on the teardown path.
    pub fn drain_all_users(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut tables = self.shared.tables.lock();
        while !(tables.pending_users.is_empty() && tables.confirmed_users.is_empty()) {
            if self
                .shared
                .users_cv
                .wait_until(&mut tables, deadline)
                .timed_out()
            {
                let drained =
                    tables.pending_users.is_empty() && tables.confirmed_users.is_empty();
                if !drained {
                    tracing::warn!(
                        pending = tables.pending_users.len(),
                        confirmed = tables.confirmed_users.len(),
                        "drain timed out with outstanding user references"
                    );
                }
                return drained;
            }
        }
        true
    }

    /// Tears the context down: [`RefContext::destroy_with_timeout`] with
    /// the default drain bound.
    pub fn destroy(&self, ignore_leaks: bool) -> Result<Vec<Arc<OwnerRef>>, RefError> {
        self.destroy_with_timeout(ignore_leaks, DESTROY_DRAIN_TIMEOUT)
    }

    /// Drains all users within `drain_timeout`, then inspects every table
    /// for residual entries.
    ///
    /// Residues are reported as one aggregated [`RefError::Leak`] unless
    /// `ignore_leaks`; the tables are left intact on that error so the
    /// caller can retry with suppression. Otherwise the tables are
    /// cleared, leftover pending futures fail with
    /// [`RefError::Destroyed`], further delete notifications are
    /// suppressed, and the surviving owner slots are returned for
    /// host-coordinated destruction.
    pub fn destroy_with_timeout(
        &self,
        ignore_leaks: bool,
        drain_timeout: Duration,
    ) -> Result<Vec<Arc<OwnerRef>>, RefError> {
        self.drain_all_users(drain_timeout);
        self.shared.destroyed.store(true, Ordering::SeqCst);

        let mut user_promises = Vec::new();
        let mut owner_promises = Vec::new();
        let mut fetch_promises = Vec::new();
        let mut leftover_users = Vec::new();
        let mut leftover_children = Vec::new();
        let owners: Vec<Arc<OwnerRef>> = {
            let mut tables = self.shared.tables.lock();
            let report = LeakReport {
                owners: tables.owners.keys().copied().collect(),
                forks: tables
                    .forks
                    .iter()
                    .flat_map(|(ref_id, set)| set.iter().map(move |fork| (*ref_id, *fork)))
                    .collect(),
                pending_users: tables.pending_users.keys().copied().collect(),
                confirmed_users: tables.confirmed_users.keys().copied().collect(),
                pending_children: tables.pending_children.keys().copied().collect(),
            };
            if !report.is_empty() {
                tracing::warn!(%report, "residual reference entries at teardown");
                if !ignore_leaks {
                    return Err(RefError::Leak(report));
                }
            }
            let owners = tables.owners.drain().map(|(_, owner)| owner).collect();
            tables.forks.clear();
            owner_promises.extend(tables.pending_owners.drain().map(|(_, promise)| promise));
            for (_, state) in tables.pending_users.drain() {
                user_promises.push(state.ready);
                leftover_users.push(state.user);
            }
            tables.confirmed_users.clear();
            tables.local_users.clear();
            leftover_children.extend(tables.pending_children.drain().map(|(_, child)| child));
            fetch_promises.extend(tables.pending_fetches.drain().map(|(_, promise)| promise));
            self.shared.users_cv.notify_all();
            owners
        };

        for promise in user_promises {
            let _ = promise.fail(RefError::Destroyed);
        }
        for promise in owner_promises {
            let _ = promise.fail(RefError::Destroyed);
        }
        for promise in fetch_promises {
            let _ = promise.fail(RefError::Destroyed);
        }
        drop(leftover_users);
        drop(leftover_children);
        tracing::debug!(owners = owners.len(), "context destroyed");
        Ok(owners)
    }

    /// Snapshot of table sizes, for operational visibility.
    pub fn debug_info(&self) -> DebugInfo {
        let tables = self.shared.tables.lock();
        DebugInfo {
            worker_id: self.shared.worker_id.as_u16(),
            owners: tables.owners.len(),
            pending_owners: tables.pending_owners.len(),
            live_forks: tables.forks.values().map(HashSet::len).sum(),
            pending_users: tables.pending_users.len(),
            confirmed_users: tables.confirmed_users.len(),
            pending_children: tables.pending_children.len(),
            pending_fetches: tables.pending_fetches.len(),
        }
    }
}

/// Read-only snapshot of the context's table sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugInfo {
    /// This worker's id.
    pub worker_id: u16,
    /// Installed owner slots.
    pub owners: usize,
    /// Owner futures awaiting creation.
    pub pending_owners: usize,
    /// Live forks across all owned values.
    pub live_forks: usize,
    /// Users awaiting owner acknowledgment.
    pub pending_users: usize,
    /// Confirmed, weak-tracked users.
    pub confirmed_users: usize,
    /// Forwarded references awaiting child acknowledgment.
    pub pending_children: usize,
    /// Outstanding value fetches.
    pub pending_fetches: usize,
}
