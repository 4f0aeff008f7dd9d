//! Remote call primitives.
//!
//! Every primitive takes a destination — a rank, or a shared future of a
//! rank, in which case submission waits for the future — and the action's
//! argument tuple, captured by value.
//!
//! * [`sync`] blocks the caller until the remote result is in.
//! * [`detached`] is fire-and-forget; the callee still runs the action
//!   exactly once, and no result travels back.
//! * [`call`] submits under a launch policy and returns a future.
//!
//! When the destination is the local rank the action runs through the thread
//! layer without touching the fabric; the observable result is the same.
//! Calls from one rank to one destination for one action are delivered in
//! submission order; nothing is promised across destinations.

use crate::registry::{send_evaluate, Action, Registry};
use crate::threads::{spawn, Future, Launch, Promise, SharedFuture};
use crate::transport::runtime;
use crate::{Client, Rank};

/// Where a call goes: a rank known now, or one known later.
pub enum Dest {
    Rank(Rank),
    Pending(SharedFuture<Rank>),
}

impl From<Rank> for Dest {
    fn from(rank: Rank) -> Dest {
        Dest::Rank(rank)
    }
}

impl From<SharedFuture<Rank>> for Dest {
    fn from(future: SharedFuture<Rank>) -> Dest {
        if future.is_ready() {
            Dest::Rank(future.get())
        } else {
            Dest::Pending(future)
        }
    }
}

/// Calls `A` on `dest` and blocks until its result is in.
pub fn sync<A: Action>(dest: impl Into<Dest>, args: A::Args) -> A::Output {
    match dest.into() {
        Dest::Pending(future) => sync_to::<A>(future.get(), args),
        Dest::Rank(rank) => sync_to::<A>(rank, args),
    }
}

fn sync_to<A: Action>(dest: Rank, args: A::Args) -> A::Output {
    let rt = runtime();
    if dest == rt.rank() && rt.shortcut() {
        return A::call(args);
    }
    let promise = Promise::new();
    let future = promise.get_future();
    let token = rt.promises.insert(Box::new(promise));
    send_evaluate::<A>(dest, Some(token), &args);
    future.get()
}

/// Runs `A` on `dest` and forgets about it. No result is delivered; a panic
/// in the callee is logged there and lost here.
pub fn detached<A: Action>(dest: impl Into<Dest>, args: A::Args)
where
    A::Args: Send + 'static,
{
    match dest.into() {
        Dest::Rank(rank) => detached_to::<A>(rank, args),
        Dest::Pending(future) => {
            spawn(Launch::Async, move || detached_to::<A>(future.get(), args));
        }
    }
}

fn detached_to<A: Action>(dest: Rank, args: A::Args) {
    let rt = runtime();
    if dest == rt.rank() && rt.shortcut() {
        spawn(Launch::Async, move || {
            A::call(args);
        });
        return;
    }
    send_evaluate::<A>(dest, None, &args);
}

/// Calls `A` on `dest` under the given launch policy.
///
/// `Async` submits now and returns a pending future; `Deferred` does nothing
/// until the future is first waited on, then submits and waits inline in the
/// caller; `Sync` submits and waits before returning.
pub fn call<A: Action>(policy: Launch, dest: impl Into<Dest>, args: A::Args) -> Future<A::Output> {
    match dest.into() {
        Dest::Rank(rank) => call_to::<A>(policy, rank, args),
        Dest::Pending(future) => match policy {
            Launch::Sync => call_to::<A>(policy, future.get(), args),
            Launch::Deferred => Future::deferred(move || sync_to::<A>(future.get(), args)),
            Launch::Async => spawn(Launch::Async, move || sync_to::<A>(future.get(), args)),
        },
    }
}

fn call_to<A: Action>(policy: Launch, dest: Rank, args: A::Args) -> Future<A::Output> {
    let rt = runtime();
    if dest == rt.rank() && rt.shortcut() {
        return spawn(policy, move || A::call(args));
    }
    match policy {
        // A deferred call reaches the promise table and the fabric only when
        // first awaited; an abandoned deferred call leaves no trace.
        Launch::Deferred => Future::deferred(move || sync_to::<A>(dest, args)),
        Launch::Async | Launch::Sync => {
            let promise = Promise::new();
            let future = promise.get_future();
            let token = rt.promises.insert(Box::new(promise));
            send_evaluate::<A>(dest, Some(token), &args);
            if policy == Launch::Sync {
                future.wait();
            }
            future
        }
    }
}

/// Sends `A` to every destination, returning per-destination futures.
pub fn broadcast<A: Action>(dests: &[Rank], args: A::Args) -> Vec<Future<A::Output>>
where
    A::Args: Clone,
{
    dests.iter().map(|&dest| call::<A>(Launch::Async, dest, args.clone())).collect()
}

/// Fire-and-forget broadcast.
pub fn broadcast_detached<A: Action>(dests: &[Rank], args: A::Args)
where
    A::Args: Clone,
{
    for &dest in dests {
        detached::<A>(dest, args.clone());
    }
}

/// Runs `A` on every rank of `lo..hi` and resolves once all have finished.
///
/// The range is split in half recursively, so the wait tree is logarithmic.
pub fn broadcast_barrier<A: Action>(args: A::Args, lo: Rank, hi: Rank) -> Future<()>
where
    A::Args: Clone,
{
    assert!(lo < hi, "empty barrier range");
    if hi - lo == 1 {
        return spawn(Launch::Async, move || {
            sync::<A>(lo, args);
        });
    }
    let mid = lo + (hi - lo) / 2;
    let first = broadcast_barrier::<A>(args.clone(), lo, mid);
    let second = broadcast_barrier::<A>(args, mid, hi);
    spawn(Launch::Async, move || {
        first.get();
        second.get();
    })
}

const CAST_FAN_OUT: Rank = 3;

/// Runs `A` on every rank, forwarding through a fan-out-3 tree so the
/// critical path is logarithmic in the world size. Resolves with the
/// results in rank order.
///
/// Requires [`register_broadcast`] for `A` on every rank.
pub fn broadcast_tree<A: Action>(args: A::Args) -> Future<Vec<A::Output>>
where
    A::Args: Clone,
    A::Output: Send + Sync,
{
    let size = runtime().size();
    call::<TreeCast<A>>(Launch::Async, 0, (0, size, args))
}

/// Registers the forwarding action that [`broadcast_tree`] relies on, in
/// addition to `A` itself.
pub fn register_broadcast<A: Action>(registry: &mut Registry)
where
    A::Args: Clone,
    A::Output: Send + Sync,
{
    registry.register::<TreeCast<A>>();
}

/// The recursive helper behind [`broadcast_tree`]: forwards to the next
/// subtree level, then evaluates locally, then splices the results back in
/// rank order.
pub(crate) struct TreeCast<A>(std::marker::PhantomData<A>);

impl<A: Action> Action for TreeCast<A>
where
    A::Args: Clone,
    A::Output: Send + Sync,
{
    type Args = (Rank, Rank, A::Args);
    type Output = Vec<A::Output>;

    fn call((lo, hi, args): Self::Args) -> Vec<A::Output> {
        debug_assert_eq!(runtime().rank(), lo);
        let rest = hi - lo - 1;
        let chunk = (rest + CAST_FAN_OUT - 1) / CAST_FAN_OUT;
        let mut forwards = Vec::new();
        if chunk > 0 {
            let mut sub_lo = lo + 1;
            while sub_lo < hi {
                let sub_hi = std::cmp::min(hi, sub_lo + chunk);
                forwards.push(call::<TreeCast<A>>(
                    Launch::Async,
                    sub_lo,
                    (sub_lo, sub_hi, args.clone()),
                ));
                sub_lo = sub_hi;
            }
        }
        let mine = A::call(args);
        let mut results = vec![mine];
        for forward in forwards {
            results.extend(forward.get());
        }
        results
    }
}

/// Read access by index, for the reduction helpers below.
pub trait IndexedContainer: Send + Sync + 'static {
    type Item: Clone + Send + Sync + 'static;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn index(&self, i: usize) -> &Self::Item;
}

impl<T: Clone + Send + Sync + 'static> IndexedContainer for Vec<T> {
    type Item = T;
    fn len(&self) -> usize {
        Vec::len(self)
    }
    fn index(&self, i: usize) -> &T {
        &self[i]
    }
}

/// Maps `f` over `container[lo..hi]` and folds the results with `op`.
///
/// The range is non-empty; `op` must be associative. The binary split keeps
/// combination order equal to an in-order left fold, and the left half runs
/// on the pool while the caller reduces the right half.
pub fn map_reduce1<C, B, F, Op>(f: F, op: Op, container: &Client<C>, lo: usize, hi: usize) -> B
where
    C: IndexedContainer,
    B: Send + 'static,
    F: Fn(&C::Item) -> B + Clone + Send + Sync + 'static,
    Op: Fn(B, B) -> B + Clone + Send + Sync + 'static,
{
    assert!(container.is_local(), "reductions need a local container client");
    assert!(lo < hi, "empty reduction range");
    if hi - lo == 1 {
        return f(container.get().index(lo));
    }
    let mid = lo + (hi - lo) / 2;
    let left = {
        let (f, op, container) = (f.clone(), op.clone(), container.clone());
        spawn(Launch::Async, move || map_reduce1(f, op, &container, lo, mid))
    };
    let right = map_reduce1(f, op.clone(), container, mid, hi);
    op(left.get(), right)
}

/// Like [`map_reduce1`], with `zero` covering the empty range.
pub fn map_reduce<C, B, F, Op>(f: F, op: Op, zero: B, container: &Client<C>) -> B
where
    C: IndexedContainer,
    B: Send + 'static,
    F: Fn(&C::Item) -> B + Clone + Send + Sync + 'static,
    Op: Fn(B, B) -> B + Clone + Send + Sync + 'static,
{
    let len = container.get().len();
    if len == 0 {
        return zero;
    }
    map_reduce1(f, op, container, 0, len)
}

/// Folds a non-empty container with `op` alone.
pub fn reduce1<C, Op>(op: Op, container: &Client<C>, lo: usize, hi: usize) -> C::Item
where
    C: IndexedContainer,
    Op: Fn(C::Item, C::Item) -> C::Item + Clone + Send + Sync + 'static,
{
    map_reduce1(|item: &C::Item| item.clone(), op, container, lo, hi)
}

/// Folds a container with `op`, `zero` covering the empty case.
pub fn reduce<C, Op>(op: Op, zero: C::Item, container: &Client<C>) -> C::Item
where
    C: IndexedContainer,
    Op: Fn(C::Item, C::Item) -> C::Item + Clone + Send + Sync + 'static,
{
    map_reduce(|item: &C::Item| item.clone(), op, zero, container)
}
