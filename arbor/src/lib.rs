//! A distributed, recursively partitioned sequence with a functional API.
//!
//! `arbor` supplies the [`Tree`] container on top of the runtime in
//! [`arbor_communication`]: a sequence stored as a tree whose leaves hold
//! small arrays and whose branches hold clients of subtrees living on any
//! rank. Applications express parallel work through the tree's algebraic
//! operations — `fmap`, `fmap2`, `fold_map`, `stencil_fmap`, `iota`,
//! `mbind` — and never name a process rank.
//!
//! # Examples
//! ```
//! use arbor::{execute, Config, IotaRange, Range, Tree};
//!
//! let code = execute(
//!     Config::Thread,
//!     |_registry| {},
//!     |_world| {
//!         let xs = Tree::iota(&|i| i + 1, IotaRange::new(Range::new(0, 100, 1)));
//!         let total = xs.fold(&|a, b| a + b, 0);
//!         assert_eq!(total, 5050);
//!         0
//!     },
//! ).unwrap();
//! assert_eq!(code, 0);
//! ```

pub mod actions;
pub mod range;
pub mod stencil;
pub mod tree;

pub use range::{IotaRange, Range};
pub use stencil::{Boundaries, Face};
pub use tree::{mjoin, Tree, MAX_LEAF};

pub use arbor_communication as communication;
pub use arbor_communication::{
    broadcast, call, detached, execute, execute_from_args, make_remote_client, runtime, spawn,
    sync, Action, Client, Config, Data, Future, GlobalSharedPtr, Launch, Promise, Rank, Registry,
    SharedFuture, World,
};
