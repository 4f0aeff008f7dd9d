//! The thread layer: a cooperative worker pool, promises and futures.
//!
//! Tasks run on a fixed pool of workers. Every blocking wait on this layer is
//! cooperative: a worker that waits on an unready future picks queued jobs
//! off the pool and runs them while it waits, so fork/join recursion cannot
//! starve the fixed pool. Suspension points are `wait`/`get` on a future,
//! [`yield_now`], [`sleep_for`], and the receive points inside the fabric.

use std::any::Any;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::Condvar;

use crate::transport::try_runtime;

// Task code takes locks through the same non-reentrant primitives the
// runtime itself uses.
pub use parking_lot::{Mutex, MutexGuard};

/// Launch policy for [`spawn`] and the remote call primitives.
///
/// * `Async`: run on the worker pool; the returned future is pending.
/// * `Deferred`: do not run until the future is first waited on; then run
///   inline in the waiter.
/// * `Sync`: run before returning; the future is already ready.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Launch {
    Async,
    Deferred,
    Sync,
}

/// How a task ended: its value, or the message of the panic that killed it.
type Outcome<T> = Result<T, String>;

type DeferredJob<T> = Box<dyn FnOnce() -> Outcome<T> + Send>;

struct Inner<T> {
    value: Option<Outcome<T>>,
    deferred: Option<DeferredJob<T>>,
}

struct State<T> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
}

impl<T> State<T> {
    fn new() -> Arc<Self> {
        Arc::new(State {
            inner: Mutex::new(Inner { value: None, deferred: None }),
            cond: Condvar::new(),
        })
    }

    fn fulfill(&self, outcome: Outcome<T>) {
        let mut inner = self.inner.lock();
        assert!(inner.value.is_none(), "future fulfilled twice");
        inner.value = Some(outcome);
        drop(inner);
        self.cond.notify_all();
    }

    fn is_ready(&self) -> bool {
        self.inner.lock().value.is_some()
    }

    /// Blocks until the state holds a value, running a deferred job inline
    /// and helping the worker pool while waiting.
    fn wait(&self) {
        let deferred = {
            let mut inner = self.inner.lock();
            if inner.value.is_some() {
                return;
            }
            inner.deferred.take()
        };
        if let Some(job) = deferred {
            let outcome = job();
            self.fulfill(outcome);
            return;
        }
        loop {
            if self.is_ready() {
                return;
            }
            if !help_one() {
                let mut inner = self.inner.lock();
                if inner.value.is_none() {
                    self.cond.wait_for(&mut inner, Duration::from_millis(1));
                }
            }
        }
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

fn run_to_outcome<T>(f: impl FnOnce() -> T) -> Outcome<T> {
    catch_unwind(AssertUnwindSafe(f)).map_err(panic_message)
}

/// The write end of a future. Dropping an unfulfilled promise resolves its
/// future with a "broken promise" failure.
pub struct Promise<T> {
    state: Arc<State<T>>,
    fulfilled: bool,
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Promise { state: State::new(), fulfilled: false }
    }

    /// The future resolved by this promise. Intended to be taken once.
    pub fn get_future(&self) -> Future<T> {
        Future { state: self.state.clone() }
    }

    pub fn set_value(mut self, value: T) {
        self.fulfilled = true;
        self.state.fulfill(Ok(value));
    }

    pub fn set_failure(mut self, message: String) {
        self.fulfilled = true;
        self.state.fulfill(Err(message));
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.fulfilled {
            self.state.fulfill(Err("broken promise".to_string()));
        }
    }
}

/// A single-consumer handle on an eventual value.
///
/// `get` consumes the future and panics if the producing task panicked; the
/// failure of an operation is surfaced here and nowhere else.
pub struct Future<T> {
    state: Arc<State<T>>,
}

impl<T> Future<T> {
    /// A future that is already resolved.
    pub fn ready(value: T) -> Self {
        let state = State::new();
        state.fulfill(Ok(value));
        Future { state }
    }

    /// A future that runs `f` inline in the first caller of `wait` or `get`.
    pub fn deferred(f: impl FnOnce() -> T + Send + 'static) -> Self {
        let state = State::new();
        state.inner.lock().deferred = Some(Box::new(move || run_to_outcome(f)));
        Future { state }
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    pub fn wait(&self) {
        self.state.wait();
    }

    pub fn get(self) -> T {
        self.state.wait();
        let outcome = self.state.inner.lock().value.take();
        match outcome.expect("future value already taken") {
            Ok(value) => value,
            Err(message) => panic!("{}", message),
        }
    }

    pub fn share(self) -> SharedFuture<T> {
        SharedFuture { state: self.state }
    }
}

/// A cheaply-cloneable future; every clone observes the same value.
pub struct SharedFuture<T> {
    state: Arc<State<T>>,
}

impl<T> Clone for SharedFuture<T> {
    fn clone(&self) -> Self {
        SharedFuture { state: self.state.clone() }
    }
}

impl<T> SharedFuture<T> {
    pub fn ready(value: T) -> Self {
        Future::ready(value).share()
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    pub fn wait(&self) {
        self.state.wait();
    }
}

impl<T: Clone> SharedFuture<T> {
    pub fn get(&self) -> T {
        self.state.wait();
        let inner = self.state.inner.lock();
        match inner.value.as_ref().expect("future resolved but empty") {
            Ok(value) => value.clone(),
            Err(message) => panic!("{}", message),
        }
    }
}

/// Runs a task under the given launch policy.
pub fn spawn<R, F>(policy: Launch, f: F) -> Future<R>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    match policy {
        Launch::Sync => {
            let state = State::new();
            state.fulfill(run_to_outcome(f));
            Future { state }
        }
        Launch::Deferred => Future::deferred(f),
        Launch::Async => {
            let promise = Promise::new();
            let future = promise.get_future();
            submit(move || match run_to_outcome(f) {
                Ok(value) => promise.set_value(value),
                Err(message) => promise.set_failure(message),
            });
            future
        }
    }
}

/// Gives the scheduler a chance to run one queued task.
pub fn yield_now() {
    if !help_one() {
        std::thread::yield_now();
    }
}

/// Suspends the calling task for at least `duration`.
pub fn sleep_for(duration: Duration) {
    std::thread::sleep(duration);
}

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// The worker pool's injector queue. Workers and cooperative waiters pull
/// from the same queue; there is no per-worker deque.
pub(crate) struct Pool {
    tx: Sender<Job>,
    rx: Receiver<Job>,
    shutdown: AtomicBool,
}

impl Pool {
    pub(crate) fn new() -> Pool {
        let (tx, rx) = crossbeam_channel::unbounded();
        Pool { tx, rx, shutdown: AtomicBool::new(false) }
    }

    pub(crate) fn submit(&self, job: Job) {
        // Sends only fail after shutdown, when no job may run anyway.
        let _ = self.tx.send(job);
    }

    pub(crate) fn try_pop(&self) -> Option<Job> {
        match self.rx.try_recv() {
            Ok(job) => Some(job),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub(crate) fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// The body of one worker thread.
    pub(crate) fn work(&self) {
        loop {
            match self.rx.recv_timeout(Duration::from_millis(50)) {
                Ok(job) => run_job(job),
                Err(_) => {
                    if self.shutdown.load(Ordering::SeqCst) && self.rx.is_empty() {
                        return;
                    }
                }
            }
        }
    }
}

/// Schedules a job on the calling thread's runtime pool, or runs it on a
/// fresh thread when no runtime is attached (plain unit tests).
pub(crate) fn submit(job: impl FnOnce() + Send + 'static) {
    match try_runtime() {
        Some(rt) => rt.pool.submit(Box::new(job)),
        None => {
            std::thread::spawn(job);
        }
    }
}

thread_local! {
    static HELP_DEPTH: Cell<usize> = const { Cell::new(0) };
}

// Bounds the stack growth of nested helping; beyond it waiters fall back to
// timed condvar waits and progress is made by other workers.
const MAX_HELP_DEPTH: usize = 64;

fn run_job(job: Job) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
        log::error!("worker task panicked: {}", panic_message(payload));
    }
}

/// Runs one queued job of the calling thread's runtime, if any.
fn help_one() -> bool {
    let Some(rt) = try_runtime() else { return false };
    if HELP_DEPTH.with(|d| d.get()) >= MAX_HELP_DEPTH {
        return false;
    }
    match rt.pool.try_pop() {
        Some(job) => {
            HELP_DEPTH.with(|d| d.set(d.get() + 1));
            run_job(job);
            HELP_DEPTH.with(|d| d.set(d.get() - 1));
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_launch_is_ready_immediately() {
        let f = spawn(Launch::Sync, || 2 + 2);
        assert!(f.is_ready());
        assert_eq!(f.get(), 4);
    }

    #[test]
    fn deferred_runs_on_get() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let f = spawn(Launch::Deferred, move || {
            flag.store(true, Ordering::SeqCst);
            7
        });
        assert!(!ran.load(Ordering::SeqCst));
        assert!(!f.is_ready());
        assert_eq!(f.get(), 7);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn deferred_shared_future_runs_on_wait() {
        let f = spawn(Launch::Deferred, || "value".to_string()).share();
        let g = f.clone();
        g.wait();
        assert_eq!(f.get(), "value");
        assert_eq!(g.get(), "value");
    }

    #[test]
    fn async_launch_without_runtime_uses_a_thread() {
        let f = spawn(Launch::Async, || 6 * 7);
        assert_eq!(f.get(), 42);
    }

    #[test]
    fn promise_resolves_future() {
        let p = Promise::new();
        let f = p.get_future();
        p.set_value(9u32);
        assert_eq!(f.get(), 9);
    }

    #[test]
    #[should_panic(expected = "broken promise")]
    fn dropped_promise_breaks_future() {
        let p: Promise<u32> = Promise::new();
        let f = p.get_future();
        drop(p);
        f.get();
    }

    #[test]
    #[should_panic(expected = "deliberate")]
    fn panics_surface_through_get() {
        let f = spawn(Launch::Sync, || -> u32 { panic!("deliberate") });
        f.get();
    }
}
