//! The per-process promise table.
//!
//! A remote call parks its typed promise here under a fresh token; the token
//! travels inside the evaluate message and comes back in the finish message,
//! whose handler takes the entry out and resolves it. Tokens are sequence
//! numbers unique for the lifetime of the process and are never reused.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

pub(crate) struct PromiseTable {
    next: AtomicU64,
    entries: Mutex<HashMap<u64, Box<dyn Any + Send>>>,
}

impl PromiseTable {
    pub(crate) fn new() -> Self {
        PromiseTable { next: AtomicU64::new(1), entries: Mutex::new(HashMap::new()) }
    }

    pub(crate) fn insert(&self, promise: Box<dyn Any + Send>) -> u64 {
        let token = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(token, promise);
        token
    }

    /// Removes the entry for `token`. A missing entry means a finish message
    /// was duplicated or fabricated, which is a broken invariant.
    pub(crate) fn take(&self, token: u64) -> Box<dyn Any + Send> {
        self.entries
            .lock()
            .remove(&token)
            .unwrap_or_else(|| panic!("no promise registered under token {}", token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threads::Promise;

    #[test]
    fn insert_take_round_trip() {
        let table = PromiseTable::new();
        let promise: Promise<u32> = Promise::new();
        let future = promise.get_future();
        let token = table.insert(Box::new(promise));
        let recovered = table.take(token).downcast::<Promise<u32>>().unwrap();
        recovered.set_value(11);
        assert_eq!(future.get(), 11);
    }

    #[test]
    fn tokens_are_unique() {
        let table = PromiseTable::new();
        let a = table.insert(Box::new(Promise::<u32>::new()));
        let b = table.insert(Box::new(Promise::<u32>::new()));
        assert_ne!(a, b);
    }

    #[test]
    #[should_panic(expected = "no promise registered")]
    fn double_take_is_fatal() {
        let table = PromiseTable::new();
        let token = table.insert(Box::new(Promise::<u32>::new()));
        let _ = table.take(token);
        let _ = table.take(token);
    }
}
