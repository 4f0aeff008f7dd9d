//! Non-owning global pointers.
//!
//! A [`GlobalPtr`] names an object by the pair (process rank, opaque machine
//! word). It carries no lifetime information and is only dereferenceable on
//! its home process, through the slot table of the shared-pointer layer. It
//! is intended for manager metadata, not for application code.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::transport::runtime;
use crate::Rank;

/// A non-owning reference to an object that may live on any process.
///
/// An empty pointer has a negative rank. Equality and hashing are structural
/// over the `(proc, addr)` pair; the pointee type takes no part in either.
pub struct GlobalPtr<T> {
    proc: Rank,
    addr: u64,
    marker: PhantomData<fn() -> T>,
}

impl<T> GlobalPtr<T> {
    /// The empty pointer.
    pub fn null() -> Self {
        GlobalPtr { proc: -1, addr: 0, marker: PhantomData }
    }

    pub(crate) fn new(proc: Rank, addr: u64) -> Self {
        GlobalPtr { proc, addr, marker: PhantomData }
    }

    /// The rank this pointer refers into, negative when empty.
    pub fn proc(&self) -> Rank {
        self.proc
    }

    pub(crate) fn addr(&self) -> u64 {
        self.addr
    }

    pub fn is_empty(&self) -> bool {
        self.proc < 0
    }

    /// Whether the pointee lives on the calling process.
    pub fn is_local(&self) -> bool {
        !self.is_empty() && self.proc == runtime().rank()
    }

    /// Reinterprets the pointee type. The `(proc, addr)` pair is unchanged.
    pub(crate) fn cast<U>(&self) -> GlobalPtr<U> {
        GlobalPtr::new(self.proc, self.addr)
    }
}

impl<T> Copy for GlobalPtr<T> {}
impl<T> Clone for GlobalPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for GlobalPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.proc == other.proc && self.addr == other.addr
    }
}
impl<T> Eq for GlobalPtr<T> {}

impl<T> Hash for GlobalPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.proc.hash(state);
        self.addr.hash(state);
    }
}

impl<T> fmt::Debug for GlobalPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "GlobalPtr({}, {:#x})", self.proc, self.addr)
    }
}

// The wire form is the two fields verbatim.
impl<T> Serialize for GlobalPtr<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.proc, self.addr).serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for GlobalPtr<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (proc, addr) = <(Rank, u64)>::deserialize(deserializer)?;
        Ok(GlobalPtr::new(proc, addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_empty() {
        let p: GlobalPtr<u32> = GlobalPtr::null();
        assert!(p.is_empty());
        assert!(p.proc() < 0);
    }

    #[test]
    fn equality_is_structural() {
        let a: GlobalPtr<u32> = GlobalPtr::new(1, 17);
        let b: GlobalPtr<u32> = GlobalPtr::new(1, 17);
        let c: GlobalPtr<u32> = GlobalPtr::new(2, 17);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn wire_form_is_the_two_fields() {
        let p: GlobalPtr<u32> = GlobalPtr::new(3, 0x1234);
        let bytes = bincode::serialize(&p).unwrap();
        assert_eq!(bytes.len(), 4 + 8);
        let q: GlobalPtr<u32> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(p, q);
    }
}
