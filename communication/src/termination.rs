//! The four-stage termination protocol.
//!
//! Shutdown is organized as two rounds of a tree barrier over the ranks,
//! fan-out 3, rooted at rank 0. Stage 1 travels down once the user's main
//! has returned; stage 2 travels up as subtrees report idle; stage 3 travels
//! down and closes the send gate for user messages; stage 4 travels up to
//! report the drain complete. Rank 0 then broadcasts the user's exit code
//! down the tree and every rank's driver returns it.
//!
//! A stage observed out of order is a broken invariant and fatal.

use std::cmp::min;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::call::detached;
use crate::registry::{Action, Registry};
use crate::transport::runtime;
use crate::Rank;

const FAN_OUT: Rank = 3;

/// Per-rank state of the shutdown protocol.
pub(crate) struct Termination {
    rank: Rank,
    size: Rank,
    stage: AtomicI32,
    stage_1_counter: AtomicI32,
    stage_3_counter: AtomicI32,
    user_result: AtomicI32,
    exit: Mutex<Option<i32>>,
    exit_cond: Condvar,
}

impl Termination {
    pub(crate) fn new(rank: Rank, size: Rank) -> Self {
        Termination {
            rank,
            size,
            stage: AtomicI32::new(0),
            stage_1_counter: AtomicI32::new(0),
            stage_3_counter: AtomicI32::new(0),
            user_result: AtomicI32::new(0),
            exit: Mutex::new(None),
            exit_cond: Condvar::new(),
        }
    }

    fn parent(&self) -> Rank {
        if self.rank == 0 {
            -1
        } else {
            (self.rank - 1) / FAN_OUT
        }
    }

    fn child_min(&self) -> Rank {
        self.rank * FAN_OUT + 1
    }

    fn child_max(&self) -> Rank {
        min(self.size, self.child_min() + FAN_OUT)
    }

    fn child_count(&self) -> i32 {
        self.child_max() - self.child_min()
    }

    /// Once a rank has acknowledged its subtree idle (stage 2), it refuses
    /// new user-initiated sends; stage 3/4 traffic still flows.
    pub(crate) fn refusing_sends(&self) -> bool {
        self.stage.load(Ordering::SeqCst) >= 2
    }

    /// Called on rank 0 when the user's main returns.
    pub(crate) fn begin(&self, exit_code: i32) {
        assert_eq!(self.rank, 0, "termination starts at the root");
        self.user_result.store(exit_code, Ordering::SeqCst);
        self.stage_1();
    }

    fn stage_1(&self) {
        assert_eq!(self.stage.swap(1, Ordering::SeqCst), 0, "stage 1 out of order");
        self.stage_1_counter.store(0, Ordering::SeqCst);
        for proc in self.child_min()..self.child_max() {
            detached::<Stage1>(proc, ());
        }
        self.stage_2();
    }

    fn stage_2(&self) {
        assert_eq!(self.stage.load(Ordering::SeqCst), 1, "stage 2 out of order");
        let value = self.stage_1_counter.fetch_add(1, Ordering::SeqCst) + 1;
        if value == self.child_count() + 1 {
            let proc = self.parent();
            self.stage.store(2, Ordering::SeqCst);
            if proc >= 0 {
                detached::<Stage2>(proc, ());
            } else {
                self.stage_3();
            }
        }
    }

    fn stage_3(&self) {
        assert_eq!(self.stage.swap(3, Ordering::SeqCst), 2, "stage 3 out of order");
        self.stage_3_counter.store(0, Ordering::SeqCst);
        for proc in self.child_min()..self.child_max() {
            detached::<Stage3>(proc, ());
        }
        self.stage_4();
    }

    fn stage_4(&self) {
        assert_eq!(self.stage.load(Ordering::SeqCst), 3, "stage 4 out of order");
        let value = self.stage_3_counter.fetch_add(1, Ordering::SeqCst) + 1;
        if value == self.child_count() + 1 {
            let proc = self.parent();
            self.stage.store(4, Ordering::SeqCst);
            if proc >= 0 {
                detached::<Stage4>(proc, ());
            } else {
                // Drain complete everywhere; publish the exit code.
                self.deliver_exit(self.user_result.load(Ordering::SeqCst));
            }
        }
    }

    fn deliver_exit(&self, code: i32) {
        for proc in self.child_min()..self.child_max() {
            detached::<Exit>(proc, (code,));
        }
        *self.exit.lock() = Some(code);
        self.exit_cond.notify_all();
    }

    /// Blocks the rank driver until the exit code arrives.
    pub(crate) fn wait_exit(&self) -> i32 {
        let mut exit = self.exit.lock();
        loop {
            if let Some(code) = *exit {
                return code;
            }
            self.exit_cond.wait_for(&mut exit, Duration::from_millis(10));
        }
    }
}

struct Stage1;
impl Action for Stage1 {
    type Args = ();
    type Output = ();
    const PROTOCOL: bool = true;
    fn call(_: ()) {
        runtime().termination.stage_1();
    }
}

struct Stage2;
impl Action for Stage2 {
    type Args = ();
    type Output = ();
    const PROTOCOL: bool = true;
    fn call(_: ()) {
        runtime().termination.stage_2();
    }
}

struct Stage3;
impl Action for Stage3 {
    type Args = ();
    type Output = ();
    const PROTOCOL: bool = true;
    fn call(_: ()) {
        runtime().termination.stage_3();
    }
}

struct Stage4;
impl Action for Stage4 {
    type Args = ();
    type Output = ();
    const PROTOCOL: bool = true;
    fn call(_: ()) {
        runtime().termination.stage_4();
    }
}

struct Exit;
impl Action for Exit {
    type Args = (i32,);
    type Output = ();
    const PROTOCOL: bool = true;
    fn call((code,): (i32,)) {
        runtime().termination.deliver_exit(code);
    }
}

pub(crate) fn register_builtins(registry: &mut Registry) {
    registry.register_inline::<Stage1>();
    registry.register_inline::<Stage2>();
    registry.register_inline::<Stage3>();
    registry.register_inline::<Stage4>();
    registry.register_inline::<Exit>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_arithmetic() {
        let t = Termination::new(0, 13);
        assert_eq!(t.parent(), -1);
        assert_eq!((t.child_min(), t.child_max()), (1, 4));
        let t = Termination::new(4, 13);
        assert_eq!(t.parent(), 1);
        assert_eq!((t.child_min(), t.child_max()), (13, 13));
        assert_eq!(t.child_count(), 0);
        let t = Termination::new(1, 13);
        assert_eq!(t.parent(), 0);
        assert_eq!((t.child_min(), t.child_max()), (4, 7));
    }
}
