//! Distributed-reference-counted shared pointers.
//!
//! A [`GlobalSharedPtr`] moves ownership of a heap value across ranks. The
//! value lives in exactly one place: an *owner* slot on its home rank. Every
//! other rank that holds handles keeps a *manager* slot carrying one
//! reference on the owner. Counts are two-level:
//!
//! * an owner slot counts its home-rank handle families, the managers on
//!   other ranks, and copies serialized from the home rank that are still in
//!   flight;
//! * a manager slot counts its rank's handle families and the copies it has
//!   serialized that are still in flight.
//!
//! Serializing a non-empty pointer first bumps the local slot — that bump
//! *is* the in-flight reference, and it keeps the owner alive while the
//! bytes travel, whatever happens to the sender afterwards. The receiver
//! either folds the inherited reference into the local owner (home case,
//! releasing the sender's slot by a detached action) or installs a fresh
//! manager and registers it with the owner before the sender's in-flight
//! reference is released. Since every release rides behind the reference it
//! depends on — FIFO per (sender, receiver) pair — the owner's count never
//! touches zero while a handle or an in-flight copy exists anywhere.
//!
//! When the owner's count does reach zero the slot is removed and the value
//! dropped: the pointee is destroyed exactly once, on its home rank. A
//! release arriving after that is a broken invariant and fatal.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::call::{detached, sync};
use crate::global::GlobalPtr;
use crate::registry::{Action, Registry};
use crate::threads::{spawn, Future, Launch};
use crate::transport::{runtime, Runtime};
use crate::{Data, Rank};

/// Marks a `GlobalPtr` that names a slot rather than a pointee.
pub(crate) struct SlotTag;

type Value = Arc<dyn Any + Send + Sync>;

enum SlotKind {
    /// Home side: holds the pointee.
    Owner { value: Value },
    /// Remote side: holds one reference on the owner.
    Manager { owner: GlobalPtr<SlotTag> },
}

struct Slot {
    count: isize,
    kind: SlotKind,
}

/// The per-rank table of owner and manager slots, keyed by the opaque
/// word that [`GlobalPtr`] carries.
pub(crate) struct SlotTable {
    next: AtomicU64,
    slots: Mutex<HashMap<u64, Slot>>,
}

impl SlotTable {
    pub(crate) fn new() -> Self {
        SlotTable { next: AtomicU64::new(1), slots: Mutex::new(HashMap::new()) }
    }

    fn fresh_addr(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    fn insert(&self, kind: SlotKind) -> u64 {
        let addr = self.fresh_addr();
        self.slots.lock().insert(addr, Slot { count: 1, kind });
        addr
    }

    /// Adds one reference to a live slot.
    fn retain(&self, addr: u64) {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&addr).expect("retain on a dead slot");
        assert!(slot.count > 0, "retain on a dying slot");
        slot.count += 1;
    }

    /// The pointee held by an owner slot.
    fn value(&self, addr: u64) -> Value {
        let slots = self.slots.lock();
        match &slots.get(&addr).expect("dereferencing a dead slot").kind {
            SlotKind::Owner { value } => value.clone(),
            SlotKind::Manager { .. } => panic!("dereferencing through a manager slot"),
        }
    }
}

/// Drops one reference; a slot reaching zero is removed, destroying the
/// pointee (owner) or releasing the owner reference (manager).
fn release_slot(rt: &Arc<Runtime>, addr: u64) {
    let removed = {
        let mut slots = rt.slots.slots.lock();
        let slot = slots.get_mut(&addr).expect("release on a dead slot");
        slot.count -= 1;
        assert!(slot.count >= 0, "slot reference count underflow");
        if slot.count == 0 {
            slots.remove(&addr)
        } else {
            None
        }
    };
    if let Some(slot) = removed {
        match slot.kind {
            // Dropping the value here destroys the pointee, exactly once.
            SlotKind::Owner { value } => drop(value),
            SlotKind::Manager { owner } => release_remote(rt, owner),
        }
    }
}

fn release_remote(rt: &Arc<Runtime>, slot: GlobalPtr<SlotTag>) {
    if slot.proc() == rt.rank() {
        release_slot(rt, slot.addr());
    } else {
        detached::<ReleaseSlot>(slot.proc(), (slot.addr(),));
    }
}

/// Built-in: drop one reference on a slot of the destination rank.
pub(crate) struct ReleaseSlot;
impl Action for ReleaseSlot {
    type Args = (u64,);
    type Output = ();
    fn call((addr,): (u64,)) {
        release_slot(&runtime(), addr);
    }
}

/// Built-in, runs on an owner's home rank: add a reference for a freshly
/// installed remote manager, then release the sender-side in-flight
/// reference it inherited. The order matters; the new manager's reference
/// must be on the books before the one that kept the owner alive goes away.
pub(crate) struct RegisterThenUnregister;
impl Action for RegisterThenUnregister {
    type Args = (u64, GlobalPtr<SlotTag>);
    type Output = ();
    fn call((owner_addr, sender): (u64, GlobalPtr<SlotTag>)) {
        let rt = runtime();
        rt.slots.retain(owner_addr);
        release_remote(&rt, sender);
    }
}

pub(crate) fn register_builtins(registry: &mut Registry) {
    registry.register_inline::<ReleaseSlot>();
    registry.register_inline::<RegisterThenUnregister>();
}

/// One handle family's reference on a local slot. Cloned handles share it;
/// the drop of the last clone releases the slot reference.
pub(crate) struct SlotHandle {
    rt: Arc<Runtime>,
    addr: u64,
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        release_slot(&self.rt, self.addr);
    }
}

/// An owning, serializable reference to a value on some rank's heap.
///
/// Cheap to clone; clones share one reference. The only legal dereference is
/// on the home rank; [`GlobalSharedPtr::local`] fetches a copy elsewhere.
pub struct GlobalSharedPtr<T> {
    gptr: GlobalPtr<T>,
    handle: Option<Arc<SlotHandle>>,
    value: Option<Arc<T>>,
}

impl<T: Send + Sync + 'static> GlobalSharedPtr<T> {
    /// The empty pointer: no pointee, no owner, no traffic.
    pub fn null() -> Self {
        GlobalSharedPtr { gptr: GlobalPtr::null(), handle: None, value: None }
    }

    /// Moves `value` onto this rank's heap and becomes its first reference.
    pub fn new(value: T) -> Self {
        let rt = runtime();
        let arc = Arc::new(value);
        let addr = rt.slots.insert(SlotKind::Owner { value: arc.clone() });
        GlobalSharedPtr {
            gptr: GlobalPtr::new(rt.rank(), addr),
            handle: Some(Arc::new(SlotHandle { rt, addr })),
            value: Some(arc),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.gptr.is_empty()
    }

    /// The pointee's home rank, negative when empty.
    pub fn proc(&self) -> Rank {
        self.gptr.proc()
    }

    pub fn is_local(&self) -> bool {
        self.gptr.is_local()
    }

    /// The pointee. Only legal on the home rank.
    pub fn get(&self) -> Arc<T> {
        assert!(!self.is_empty(), "dereferencing an empty global pointer");
        assert!(self.is_local(), "dereferencing a global pointer away from its home rank");
        self.value.clone().expect("local pointer carries its value")
    }
}

impl<T: Data> GlobalSharedPtr<T> {
    /// A future of a locally-dereferenceable pointer: this one if already
    /// local or empty, otherwise a fresh copy of the pointee on this rank.
    pub fn local(&self) -> Future<GlobalSharedPtr<T>> {
        if self.is_empty() || self.is_local() {
            return Future::ready(self.clone());
        }
        let this = self.clone();
        let home = self.proc();
        spawn(Launch::Async, move || {
            let copy: T = sync::<FetchValue<T>>(home, (this,));
            GlobalSharedPtr::new(copy)
        })
    }
}

/// Built-in per-component action: read a copy of the pointee on its home
/// rank. Registered through [`crate::register_component`].
pub(crate) struct FetchValue<T>(std::marker::PhantomData<T>);
impl<T: Data> Action for FetchValue<T> {
    type Args = (GlobalSharedPtr<T>,);
    type Output = T;
    fn call((ptr,): Self::Args) -> T {
        (*ptr.get()).clone()
    }
}

/// Constructs a fresh shared pointer on the current rank.
pub fn make_global_shared<T: Send + Sync + 'static>(value: T) -> GlobalSharedPtr<T> {
    GlobalSharedPtr::new(value)
}

impl<T> Clone for GlobalSharedPtr<T> {
    fn clone(&self) -> Self {
        GlobalSharedPtr {
            gptr: self.gptr,
            handle: self.handle.clone(),
            value: self.value.clone(),
        }
    }
}

impl<T> PartialEq for GlobalSharedPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.gptr == other.gptr
    }
}
impl<T> Eq for GlobalSharedPtr<T> {}

impl<T> fmt::Debug for GlobalSharedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "GlobalSharedPtr({:?})", self.gptr)
    }
}

// Send path. The local slot is bumped before the fields are written; the
// bump travels as the in-flight reference described in the module docs.
impl<T: Send + Sync + 'static> Serialize for GlobalSharedPtr<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.handle {
            None => (self.gptr, Option::<(GlobalPtr<SlotTag>, GlobalPtr<SlotTag>)>::None)
                .serialize(serializer),
            Some(handle) => {
                handle.rt.slots.retain(handle.addr);
                let owner = self.gptr.cast::<SlotTag>();
                let sender: GlobalPtr<SlotTag> = GlobalPtr::new(handle.rt.rank(), handle.addr);
                (self.gptr, Some((owner, sender))).serialize(serializer)
            }
        }
    }
}

// Receive path; see the module docs for the reference choreography.
impl<'de, T: Send + Sync + 'static> Deserialize<'de> for GlobalSharedPtr<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (gptr, rest): (GlobalPtr<T>, Option<(GlobalPtr<SlotTag>, GlobalPtr<SlotTag>)>) =
            Deserialize::deserialize(deserializer)?;
        if gptr.is_empty() {
            return Ok(GlobalSharedPtr::null());
        }
        let (owner, sender) = rest.expect("non-empty global pointer without owner metadata");
        let rt = runtime();
        if gptr.proc() == rt.rank() {
            // The pointee is local: fold into the owner slot, then hand the
            // inherited in-flight reference back to the sender.
            rt.slots.retain(owner.addr());
            let value = rt
                .slots
                .value(owner.addr())
                .downcast::<T>()
                .unwrap_or_else(|_| panic!("owner slot holds a different pointee type"));
            release_remote(&rt, sender);
            Ok(GlobalSharedPtr {
                gptr,
                handle: Some(Arc::new(SlotHandle { rt, addr: owner.addr() })),
                value: Some(value),
            })
        } else {
            // Remote: install a manager, register it with the owner, and
            // only then let go of the sender's in-flight reference.
            let addr = rt.slots.insert(SlotKind::Manager { owner });
            detached::<RegisterThenUnregister>(owner.proc(), (owner.addr(), sender));
            Ok(GlobalSharedPtr {
                gptr,
                handle: Some(Arc::new(SlotHandle { rt, addr })),
                value: None,
            })
        }
    }
}
