//! The action registry.
//!
//! An action is a callable entry point with serializable arguments and
//! result, addressable over the wire by a stable textual identifier. The
//! identifier is derived from a deterministic hash of the action's type
//! name, so it is byte-identical on every peer running the same binary.
//!
//! Each registered action contributes two wire entries, distinguished by
//! suffix: `<id>/evaluate` (arguments plus an optional promise token; runs
//! on the callee) and `<id>/finish` (outcome plus the token; runs back on
//! the caller). Registration happens on every process, before the fabric
//! starts; afterwards the registry is read-only and shared without locks.
//! Receiving an identifier that was never registered is fatal.

use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::hash::Hasher;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::de::DeserializeOwned;
use serde::Serialize;
use twox_hash::XxHash64;

use crate::message;
use crate::promises::PromiseTable;
use crate::threads::Promise;
use crate::transport::{post, runtime};
use crate::Rank;

/// A callable entry point that can be invoked from any rank.
///
/// Implementations are unit types; per-call state travels in `Args`.
pub trait Action: Send + Sync + 'static {
    type Args: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn call(args: Self::Args) -> Self::Output;

    /// Messages of protocol actions are exempt from the termination
    /// protocol's send/receive gates. Leave this alone for user actions.
    const PROTOCOL: bool = false;

    /// The stable identifier: a hash of the action's type identity.
    fn name() -> String {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(type_name::<Self>().as_bytes());
        format!("{:016x}", hasher.finish())
    }
}

/// Delivery metadata handed to wire handlers.
#[derive(Copy, Clone, Debug)]
pub struct Envelope {
    /// The rank the message came from.
    pub source: Rank,
}

type Handler = fn(&[u8], Envelope);

pub(crate) struct Entry {
    pub(crate) handler: Handler,
    pub(crate) protocol: bool,
    owner: TypeId,
    /// Inline entries run on the receive thread, in arrival order, instead
    /// of on the pool. Reference-count and stage messages need the per-pair
    /// FIFO to extend through execution; pool scheduling would reorder them.
    pub(crate) inline: bool,
}

/// The append-only map from wire identifiers to handlers.
pub struct Registry {
    entries: HashMap<String, Entry>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Registry { entries: HashMap::new() }
    }

    /// Registers an action's evaluate and finish entries.
    ///
    /// Must be called identically on every process; the bootstrap layer runs
    /// one registration callback per rank to guarantee this.
    pub fn register<A: Action>(&mut self) {
        self.insert::<A>(
            evaluate_id::<A>(),
            Entry { handler: evaluate_handler::<A>, protocol: A::PROTOCOL, owner: TypeId::of::<A>(), inline: false },
        );
        self.insert::<A>(
            finish_id::<A>(),
            Entry { handler: finish_handler::<A>, protocol: A::PROTOCOL, owner: TypeId::of::<A>(), inline: false },
        );
    }

    /// Registers an action whose evaluate phase runs inline on the receive
    /// thread. Restricted to the runtime's own quick, non-blocking actions.
    pub(crate) fn register_inline<A: Action>(&mut self) {
        self.insert::<A>(
            evaluate_id::<A>(),
            Entry { handler: evaluate_handler::<A>, protocol: A::PROTOCOL, owner: TypeId::of::<A>(), inline: true },
        );
        self.insert::<A>(
            finish_id::<A>(),
            Entry { handler: finish_handler::<A>, protocol: A::PROTOCOL, owner: TypeId::of::<A>(), inline: false },
        );
    }

    // Registering the same action again is a no-op; two distinct actions
    // hashing to one identifier would corrupt dispatch and must abort.
    fn insert<A: Action>(&mut self, id: String, entry: Entry) {
        if let Some(previous) = self.entries.get(&id) {
            assert!(
                previous.owner == TypeId::of::<A>(),
                "action identifier {:?} is claimed by two distinct action types",
                id
            );
            return;
        }
        self.entries.insert(id, entry);
    }

    pub(crate) fn lookup(&self, id: &str) -> &Entry {
        self.entries
            .get(id)
            .unwrap_or_else(|| panic!("received unknown action identifier {:?}; the peers are running different registrations", id))
    }
}

pub(crate) fn evaluate_id<A: Action>() -> String {
    format!("{}/evaluate", A::name())
}

pub(crate) fn finish_id<A: Action>() -> String {
    format!("{}/finish", A::name())
}

/// Serializes and posts an evaluate message.
pub(crate) fn send_evaluate<A: Action>(dest: Rank, token: Option<u64>, args: &A::Args) {
    let body = bincode::serialize(&(token, args)).expect("failed to serialize action arguments");
    let bytes = message::frame(&evaluate_id::<A>(), &body);
    post(&runtime(), dest, bytes, A::PROTOCOL);
}

/// Runs the action on the callee and, for calls that expect a result, posts
/// the finish message back to the caller. The callee's panic, if any, is
/// captured into the outcome rather than unwinding the worker.
fn evaluate_handler<A: Action>(body: &[u8], envelope: Envelope) {
    let (token, args): (Option<u64>, A::Args) =
        bincode::deserialize(body).expect("failed to deserialize action arguments");
    let outcome: Result<A::Output, String> =
        catch_unwind(AssertUnwindSafe(|| A::call(args))).map_err(crate::threads::panic_message);
    if let Some(token) = token {
        let body =
            bincode::serialize(&(token, outcome)).expect("failed to serialize action outcome");
        let bytes = message::frame(&finish_id::<A>(), &body);
        post(&runtime(), envelope.source, bytes, A::PROTOCOL);
    } else if let Err(message) = outcome {
        // A detached action has nowhere to surface its failure.
        log::error!("detached action {} panicked: {}", A::name(), message);
    }
}

/// Resolves the caller-side promise named by the finish message.
fn finish_handler<A: Action>(body: &[u8], _envelope: Envelope) {
    let (token, outcome): (u64, Result<A::Output, String>) =
        bincode::deserialize(body).expect("failed to deserialize action outcome");
    let promise = take_promise::<A::Output>(&runtime().promises, token);
    match outcome {
        Ok(value) => promise.set_value(value),
        Err(message) => promise.set_failure(message),
    }
}

fn take_promise<T: 'static>(table: &PromiseTable, token: u64) -> Box<Promise<T>> {
    table
        .take(token)
        .downcast::<Promise<T>>()
        .unwrap_or_else(|_| panic!("promise table entry has the wrong type for token {}", token))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Double;
    impl Action for Double {
        type Args = (u32,);
        type Output = u32;
        fn call((x,): (u32,)) -> u32 {
            2 * x
        }
    }

    struct Triple;
    impl Action for Triple {
        type Args = (u32,);
        type Output = u32;
        fn call((x,): (u32,)) -> u32 {
            3 * x
        }
    }

    #[test]
    fn identifiers_are_stable_and_distinct() {
        assert_eq!(Double::name(), Double::name());
        assert_ne!(Double::name(), Triple::name());
        assert_eq!(Double::name().len(), 16);
        assert!(Double::name().is_ascii());
    }

    #[test]
    fn evaluate_and_finish_are_suffix_distinguished() {
        assert_eq!(evaluate_id::<Double>(), format!("{}/evaluate", Double::name()));
        assert_eq!(finish_id::<Double>(), format!("{}/finish", Double::name()));
    }

    #[test]
    fn re_registration_is_idempotent() {
        let mut registry = Registry::new();
        registry.register::<Double>();
        registry.register::<Double>();
        registry.lookup(&evaluate_id::<Double>());
    }

    #[test]
    #[should_panic(expected = "unknown action identifier")]
    fn unknown_identifier_is_fatal() {
        let registry = Registry::new();
        registry.lookup("ffffffffffffffff/evaluate");
    }
}
