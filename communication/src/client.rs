//! Client handles: the universal remote-object reference.
//!
//! A [`Client`] is a shared future of a [`GlobalSharedPtr`]. It is what the
//! tree layer passes between ranks: cheap to clone, serializable once ready,
//! and naturally pipelined — a client made from a pending remote
//! construction can be handed on before the construction has finished.

use std::fmt;
use std::sync::Arc;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::call::{call, Dest};
use crate::registry::{Action, Registry};
use crate::shared::{FetchValue, GlobalSharedPtr};
use crate::threads::{spawn, Future, Launch, SharedFuture};
use crate::{Data, Rank};

/// A future of a global shared pointer; empty, pending, or ready.
///
/// A ready client is *local* when the pointee lives on this rank (direct
/// dereference allowed) and *remote* otherwise (reads go through the
/// runtime). Clones share the underlying future.
pub struct Client<T> {
    data: SharedFuture<GlobalSharedPtr<T>>,
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Self {
        Client { data: self.data.clone() }
    }
}

impl<T: Send + Sync + 'static> Client<T> {
    /// A ready client with no pointee.
    pub fn empty() -> Self {
        Client { data: SharedFuture::ready(GlobalSharedPtr::null()) }
    }

    /// A ready client owning a fresh pointee on the current rank.
    pub fn new(value: T) -> Self {
        Client::from_ptr(GlobalSharedPtr::new(value))
    }

    pub fn from_ptr(ptr: GlobalSharedPtr<T>) -> Self {
        Client { data: SharedFuture::ready(ptr) }
    }

    pub fn from_future(future: Future<GlobalSharedPtr<T>>) -> Self {
        Client { data: future.share() }
    }

    /// Blocks until the client is ready.
    pub fn wait(&self) {
        self.data.wait();
    }

    pub fn is_ready(&self) -> bool {
        self.data.is_ready()
    }

    /// The resolved pointer; blocks while pending.
    pub fn get_ptr(&self) -> GlobalSharedPtr<T> {
        self.data.get()
    }

    pub fn is_empty(&self) -> bool {
        self.get_ptr().is_empty()
    }

    /// The pointee's home rank; blocks while pending.
    pub fn proc(&self) -> Rank {
        self.get_ptr().proc()
    }

    pub fn is_local(&self) -> bool {
        self.get_ptr().is_local()
    }

    /// The home rank as a future, for future-of-destination calls.
    pub fn proc_future(&self) -> SharedFuture<Rank> {
        if self.data.is_ready() {
            return SharedFuture::ready(self.data.get().proc());
        }
        let data = self.data.clone();
        spawn(Launch::Async, move || data.get().proc()).share()
    }

    /// The pointee. Only legal once ready and local.
    pub fn get(&self) -> Arc<T> {
        self.get_ptr().get()
    }
}

impl<T: Data> Client<T> {
    /// A client whose pointee is readable on this rank: `self` when already
    /// local (or empty), otherwise a fetched copy.
    ///
    /// Requires [`register_component`] for `T`.
    pub fn local(&self) -> Client<T> {
        if self.data.is_ready() {
            return Client::from_future(self.data.get().local());
        }
        let data = self.data.clone();
        Client::from_future(spawn(Launch::Async, move || data.get().local().get()))
    }
}

impl<T: Send + Sync + 'static> PartialEq for Client<T> {
    /// Pointee identity: two clients are equal when they resolve to the
    /// same global pointer.
    fn eq(&self, other: &Self) -> bool {
        self.get_ptr() == other.get_ptr()
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.data.is_ready() {
            write!(f, "Client({:?})", self.data.get())
        } else {
            write!(f, "Client(<pending>)")
        }
    }
}

// A client serializes as its resolved pointer; serialization of a pending
// client blocks until construction finishes.
impl<T: Send + Sync + 'static> Serialize for Client<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.data.get().serialize(serializer)
    }
}

impl<'de, T: Send + Sync + 'static> Deserialize<'de> for Client<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Client::from_ptr(GlobalSharedPtr::deserialize(deserializer)?))
    }
}

/// Submits a constructor action to `dest` and wraps the eventual pointer.
///
/// `A` is any registered action whose output is a `GlobalSharedPtr<T>`; the
/// returned client resolves when the remote construction completes.
pub fn make_remote_client<A, T>(dest: impl Into<Dest>, args: A::Args) -> Client<T>
where
    T: Send + Sync + 'static,
    A: Action<Output = GlobalSharedPtr<T>>,
{
    Client::from_future(call::<A>(Launch::Async, dest, args))
}

/// Registers the runtime's per-component actions for `T`: the pointee fetch
/// behind [`GlobalSharedPtr::local`] and [`Client::local`].
pub fn register_component<T: Data>(registry: &mut Registry) {
    registry.register::<FetchValue<T>>();
}
