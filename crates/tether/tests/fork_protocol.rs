//! End-to-end protocol tests over the in-memory hub.
//!
//! Every test pumps messages by hand, which is what lets adverse delivery
//! orders — the whole reason the handshakes exist — be exercised
//! deterministically instead of left to scheduler luck.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tether::{
    Envelope, InMemoryHub, OwnerRef, RefContext, RefMessage, RemoteRef, TypeTag, WorkerId,
};

/// A handful of simulated workers sharing one hub.
struct Cluster {
    hub: Arc<InMemoryHub>,
    workers: HashMap<WorkerId, RefContext>,
}

impl Cluster {
    fn new(ids: &[u16]) -> Self {
        let hub = InMemoryHub::new();
        let workers = ids
            .iter()
            .map(|id| {
                let worker = WorkerId::new(*id);
                let ctx = RefContext::new(worker, Arc::new(hub.port(worker)));
                (worker, ctx)
            })
            .collect();
        Self { hub, workers }
    }

    fn ctx(&self, id: u16) -> &RefContext {
        &self.workers[&WorkerId::new(id)]
    }

    fn deliver(&self, env: Envelope) -> Option<Arc<OwnerRef>> {
        self.workers[&env.to]
            .handle_message(env.from, env.msg)
            .unwrap()
    }

    /// Delivers queued messages in send order until nothing is in flight.
    fn settle(&self) {
        loop {
            let mut delivered = false;
            let ids: Vec<WorkerId> = self.workers.keys().copied().collect();
            for worker in ids {
                for env in self.hub.take_all(worker) {
                    delivered = true;
                    self.deliver(env);
                }
            }
            if !delivered {
                break;
            }
        }
    }
}

/// A holds a fork of a value owned by B and forwards it to C; C's early
/// release is deferred, the accept confirms it, and the last delete hands
/// B's owner slot back with every table empty.
#[test]
fn full_lifecycle_across_three_workers() {
    let cluster = Cluster::new(&[0, 1, 2]);
    let (a, b, c) = (WorkerId::new(0), WorkerId::new(1), WorkerId::new(2));

    // B owns a value.
    let ctx_b = cluster.ctx(1);
    let owner = ctx_b.create_owner(TypeTag::new("tensor"));
    owner.set_value(vec![42]).unwrap();
    let ref_id = owner.ref_id();

    // B forks to A; A's handle confirms once the handshakes settle.
    let to_a = ctx_b.prepare_fork(&RemoteRef::Owner(owner.clone())).unwrap();
    assert_eq!(ctx_b.debug_info().pending_children, 1);
    let a_ref = cluster.ctx(0).materialize_fork(&to_a, None).unwrap();
    let a_user = a_ref.as_user().unwrap().clone();
    assert!(!a_user.is_confirmed());
    cluster.settle();
    assert!(a_user.is_confirmed());
    assert_eq!(ctx_b.debug_info().pending_children, 0);
    // A's own fork replaced the out-fork B registered at prepare time.
    assert_eq!(ctx_b.debug_info().live_forks, 1);

    // A forwards its fork to C.
    let to_c = cluster.ctx(0).prepare_fork(&a_ref).unwrap();
    assert_eq!(cluster.ctx(0).debug_info().pending_children, 1);
    let c_ref = cluster.ctx(2).materialize_fork(&to_c, None).unwrap();
    let c_user = c_ref.as_user().unwrap().clone();
    assert!(!c_user.is_confirmed());

    // C releases every local holder before the accept arrives. The delete
    // must be deferred: only C's fork request is on the wire.
    drop(c_ref);
    drop(c_user);
    assert_eq!(cluster.ctx(2).debug_info().pending_users, 1);
    let queued = cluster.hub.take_all(b);
    assert_eq!(queued.len(), 1);
    assert!(matches!(queued[0].msg, RefMessage::ForkRequest { .. }));
    for env in queued {
        cluster.deliver(env);
    }
    assert_eq!(ctx_b.debug_info().live_forks, 2);

    // B's accept reaches C: pending becomes confirmed, and only then do
    // the deferred child-accept and delete go out.
    for env in cluster.hub.take_all(c) {
        cluster.deliver(env);
    }
    assert_eq!(cluster.ctx(2).debug_info().pending_users, 0);
    assert_eq!(cluster.ctx(2).debug_info().confirmed_users, 0);
    assert_eq!(cluster.hub.pending(a), 1);
    assert_eq!(cluster.hub.pending(b), 1);

    // A retires its pending child.
    for env in cluster.hub.take_all(a) {
        cluster.deliver(env);
    }
    assert_eq!(cluster.ctx(0).debug_info().pending_children, 0);

    // B drops C's fork; A's is still live.
    for env in cluster.hub.take_all(b) {
        assert!(cluster.deliver(env).is_none());
    }
    assert_eq!(ctx_b.debug_info().live_forks, 1);
    assert_eq!(ctx_b.debug_info().owners, 1);

    // A releases the last fork; the slot empties and is handed back.
    drop(a_ref);
    drop(a_user);
    let mut freed = None;
    for env in cluster.hub.take_all(b) {
        if let Some(owner) = cluster.deliver(env) {
            freed = Some(owner);
        }
    }
    let freed = freed.expect("owner slot returned for host cleanup");
    assert_eq!(freed.ref_id(), ref_id);
    assert_eq!(ctx_b.debug_info().owners, 0);
    assert_eq!(ctx_b.debug_info().live_forks, 0);

    for id in [0, 1, 2] {
        let info = cluster.ctx(id).debug_info();
        assert_eq!(info.pending_users, 0);
        assert_eq!(info.confirmed_users, 0);
        assert_eq!(info.pending_children, 0);
    }
}

#[test]
fn delete_while_pending_waits_for_confirmation() {
    let cluster = Cluster::new(&[0, 1]);
    let b = WorkerId::new(1);
    let ctx_b = cluster.ctx(1);
    let owner = ctx_b.create_owner(TypeTag::new("t"));
    let payload = ctx_b.prepare_fork(&RemoteRef::Owner(owner.clone())).unwrap();
    drop(owner);

    let ctx_a = cluster.ctx(0);
    let user = ctx_a.materialize_fork(&payload, None).unwrap();
    drop(user);
    assert_eq!(ctx_a.debug_info().pending_users, 1);

    // The holder is gone, yet nothing but the fork request is on the
    // wire: a delete racing ahead of the registration could free the
    // value under the still-unregistered fork.
    let queued = cluster.hub.take_all(b);
    assert_eq!(queued.len(), 1);
    assert!(matches!(queued[0].msg, RefMessage::ForkRequest { .. }));
    for env in queued {
        cluster.deliver(env);
    }

    // Confirmation releases the deferred delete and the whole chain
    // unwinds.
    cluster.settle();
    assert_eq!(ctx_a.debug_info().pending_users, 0);
    assert_eq!(ctx_a.debug_info().confirmed_users, 0);
    assert_eq!(ctx_b.debug_info().owners, 0);
    assert_eq!(ctx_b.debug_info().live_forks, 0);
}

#[test]
fn recorder_waits_for_all_accepts_regardless_of_order() {
    let cluster = Cluster::new(&[0, 1]);
    let (a, b) = (WorkerId::new(0), WorkerId::new(1));
    let ctx_b = cluster.ctx(1);

    let k = 4;
    let mut payloads = Vec::new();
    for i in 0..k {
        let owner = ctx_b.create_owner(TypeTag::new("t"));
        owner.set_value(vec![i as u8]).unwrap();
        payloads.push(ctx_b.prepare_fork(&RemoteRef::Owner(owner)).unwrap());
    }

    let ctx_a = cluster.ctx(0);
    let session = ctx_a.begin_recording();
    let refs: Vec<RemoteRef> = payloads
        .iter()
        .map(|p| ctx_a.materialize_fork(p, Some(&session)).unwrap())
        .collect();
    assert_eq!(session.len(), k);
    let drained = session.drain();
    assert!(!drained.is_complete());

    for env in cluster.hub.take_all(b) {
        cluster.deliver(env);
    }

    // Deliver the accepts in reverse arrival order; the drain completes
    // only once the final one lands.
    let mut accepts = cluster.hub.take_all(a);
    assert_eq!(accepts.len(), k);
    accepts.reverse();
    let last = accepts.pop().unwrap();
    for env in accepts {
        cluster.deliver(env);
        assert!(!drained.is_complete());
    }
    cluster.deliver(last);
    assert_eq!(
        drained.wait_timeout(Duration::from_secs(1)),
        Some(Ok(()))
    );

    drop(refs);
    cluster.settle();
    assert_eq!(ctx_b.debug_info().owners, 0);
}

#[test]
fn drain_converges_as_users_are_released() {
    let cluster = Arc::new(Cluster::new(&[0, 1]));
    let ctx_a = cluster.ctx(0).clone();
    let ctx_b = cluster.ctx(1).clone();

    let mut users = Vec::new();
    for i in 0..5u8 {
        let owner = ctx_b.create_owner(TypeTag::new("t"));
        owner.set_value(vec![i]).unwrap();
        let payload = ctx_b.prepare_fork(&RemoteRef::Owner(owner)).unwrap();
        users.push(ctx_a.materialize_fork(&payload, None).unwrap());
    }
    assert_eq!(ctx_a.debug_info().pending_users, 5);

    let releaser = {
        let cluster = Arc::clone(&cluster);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            // Confirm every user, then release them all.
            cluster.settle();
            drop(users);
            cluster.settle();
        })
    };

    assert!(ctx_a.drain_all_users(Duration::from_secs(5)));
    let info = ctx_a.debug_info();
    assert_eq!(info.pending_users, 0);
    assert_eq!(info.confirmed_users, 0);

    releaser.join().unwrap();
    assert_eq!(ctx_b.debug_info().owners, 0);
}

/// Only the fork request may be redelivered by the transport; this pins
/// both the idempotent registration and the tolerated duplicate accept it
/// produces. If the transport's retry policy ever widens beyond this one
/// message kind, every other handler's exactly-once assumption has to be
/// re-audited.
#[test]
fn retried_fork_request_is_reacked_and_tolerated() {
    let cluster = Cluster::new(&[0, 1]);
    let (a, b) = (WorkerId::new(0), WorkerId::new(1));
    let ctx_b = cluster.ctx(1);
    let owner = ctx_b.create_owner(TypeTag::new("t"));
    let payload = ctx_b.prepare_fork(&RemoteRef::Owner(owner.clone())).unwrap();
    drop(owner);
    let user = cluster.ctx(0).materialize_fork(&payload, None).unwrap();

    let request = cluster.hub.take_all(b).pop().unwrap();
    cluster.deliver(request.clone());
    let forks_after_first = ctx_b.debug_info().live_forks;
    cluster.deliver(request);
    assert_eq!(ctx_b.debug_info().live_forks, forks_after_first);

    // Both accept copies reach the requester; the second is ignored.
    let accepts = cluster.hub.take_all(a);
    assert_eq!(accepts.len(), 2);
    for env in accepts {
        cluster.deliver(env);
    }
    assert!(user.as_user().unwrap().is_confirmed());
    assert_eq!(cluster.ctx(0).debug_info().confirmed_users, 1);

    cluster.settle();
    drop(user);
    cluster.settle();
    assert_eq!(ctx_b.debug_info().owners, 0);
}

#[test]
fn value_request_before_creation_resolves_lazily() {
    let cluster = Cluster::new(&[0, 1]);
    let b = WorkerId::new(1);
    let ctx_a = cluster.ctx(0);

    // A names a value that will live on B. The fetch races ahead of the
    // creation message.
    let (user, create) = ctx_a.create_user(b, TypeTag::new("t"));
    let fetched = ctx_a.fetch_value(&RemoteRef::User(user.clone()));
    for env in cluster.hub.take_all(b) {
        cluster.deliver(env);
    }
    assert_eq!(cluster.ctx(1).debug_info().pending_owners, 1);
    assert!(!fetched.is_complete());

    // The creation finally arrives; the parked request resolves without
    // ever having blocked a handler.
    let owner = cluster.ctx(1).on_remote_create(&create).unwrap();
    owner.set_value(vec![7, 7]).unwrap();
    drop(owner);
    cluster.settle();
    assert_eq!(
        fetched.wait_timeout(Duration::from_secs(1)),
        Some(Ok(vec![7, 7]))
    );
    assert!(user.is_confirmed());
    assert_eq!(cluster.ctx(1).debug_info().pending_owners, 0);

    drop(user);
    cluster.settle();
    assert_eq!(cluster.ctx(1).debug_info().owners, 0);
}

#[test]
fn receiver_merges_forks_of_the_same_value() {
    let cluster = Cluster::new(&[0, 1]);
    let ctx_b = cluster.ctx(1);
    let owner = ctx_b.create_owner(TypeTag::new("t"));
    let p1 = ctx_b.prepare_fork(&RemoteRef::Owner(owner.clone())).unwrap();
    let p2 = ctx_b.prepare_fork(&RemoteRef::Owner(owner.clone())).unwrap();
    drop(owner);

    // The same value arrives twice (say, twice in one argument list): one
    // local handle, one fork request, the second accept deferred.
    let ctx_a = cluster.ctx(0);
    let r1 = ctx_a.materialize_fork(&p1, None).unwrap();
    let r2 = ctx_a.materialize_fork(&p2, None).unwrap();
    assert!(Arc::ptr_eq(r1.as_user().unwrap(), r2.as_user().unwrap()));
    assert_eq!(ctx_a.debug_info().pending_users, 1);
    assert_eq!(cluster.hub.pending(WorkerId::new(1)), 1);
    assert_eq!(ctx_b.debug_info().pending_children, 2);

    cluster.settle();
    assert!(r1.as_user().unwrap().is_confirmed());
    assert_eq!(ctx_b.debug_info().pending_children, 0);
    assert_eq!(ctx_b.debug_info().live_forks, 1);

    drop(r1);
    drop(r2);
    cluster.settle();
    assert_eq!(ctx_b.debug_info().owners, 0);
    assert_eq!(ctx_a.debug_info().confirmed_users, 0);
}
