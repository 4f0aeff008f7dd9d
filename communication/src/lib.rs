//! Communication layer for the arbor runtime.
//!
//! This crate provides the pieces below the tree container: a registry of
//! serializable actions, a cooperative worker pool with promises and futures,
//! a message fabric connecting the ranks of a computation, remote call
//! primitives, distributed-reference-counted shared pointers, and the
//! termination protocol that drains a computation cleanly.
//!
//! Ranks are connected either through in-process channels (for tests and
//! single-machine runs) or through a full TCP mesh. Every message carries one
//! serialized action: a length-prefixed registry identifier followed by the
//! bincode-encoded body. Point-to-point delivery is FIFO per (sender,
//! receiver) pair; no fairness is promised across pairs.
//!
//! # Examples
//! ```
//! use arbor_communication::{execute, Config, Action, sync};
//!
//! struct Ping;
//! impl Action for Ping {
//!     type Args = (u8,);
//!     type Output = u8;
//!     fn call((x,): (u8,)) -> u8 { x }
//! }
//!
//! let code = execute(
//!     Config::Process { ranks: 2, threads: 2 },
//!     |registry| registry.register::<Ping>(),
//!     |world| {
//!         let echoed = sync::<Ping>(world.size() - 1, (42,));
//!         assert_eq!(echoed, 42);
//!         0
//!     },
//! ).unwrap();
//! assert_eq!(code, 0);
//! ```

pub mod call;
pub mod client;
pub mod global;
pub mod initialize;
pub mod message;
pub mod networking;
mod promises;
pub mod registry;
pub mod shared;
mod termination;
pub mod threads;
pub mod transport;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use call::{
    broadcast, broadcast_barrier, broadcast_detached, broadcast_tree, call, detached, map_reduce,
    map_reduce1, reduce, reduce1, register_broadcast, sync, Dest, IndexedContainer,
};
pub use client::{make_remote_client, register_component, Client};
pub use global::GlobalPtr;
pub use initialize::{execute, execute_from_args, Config, World};
pub use registry::{Action, Registry};
pub use shared::{make_global_shared, GlobalSharedPtr};
pub use threads::{sleep_for, spawn, yield_now, Future, Launch, Mutex, MutexGuard, Promise, SharedFuture};
pub use transport::{runtime, CommStats, Runtime};

/// The identity of a process within the world, `0 .. size`.
///
/// Negative ranks never name a process; they mark empty global pointers.
pub type Rank = i32;

/// A composite trait for values that may cross process boundaries.
pub trait Data: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static> Data for T {}
