//! Action lifts for the tree operations.
//!
//! The traversal operations' action forms ship work to subtree home ranks
//! through the companion actions defined here: a registered element action
//! is lifted to an action over a whole subtree, and the lift recurses by
//! dispatching itself to the children's homes. The `register_*` helpers
//! install an element action together with the lifts it needs; like all
//! registration, they must run identically on every rank.

use std::marker::PhantomData;

use arbor_communication::{Action, Client, Data, GlobalSharedPtr, Registry};

use crate::range::IotaRange;
use crate::stencil::Face;
use crate::tree::Tree;

/// A unary action, `In -> Out`.
pub trait Unary: Action {
    type In: Data;
    type Out: Data;
    fn apply(x: Self::In) -> Self::Out;
}

impl<A, T, R> Unary for A
where
    A: Action<Args = (T,), Output = R>,
    T: Data,
    R: Data,
{
    type In = T;
    type Out = R;
    fn apply(x: T) -> R {
        A::call((x,))
    }
}

/// A binary action, `(In1, In2) -> Out`.
pub trait Binary: Action {
    type In1: Data;
    type In2: Data;
    type Out: Data;
    fn apply2(x: Self::In1, y: Self::In2) -> Self::Out;
}

impl<A, T, U, R> Binary for A
where
    A: Action<Args = (T, U), Output = R>,
    T: Data,
    U: Data,
    R: Data,
{
    type In1 = T;
    type In2 = U;
    type Out = R;
    fn apply2(x: T, y: U) -> R {
        A::call((x, y))
    }
}

/// A stencil combiner action, `(Cell, Bnd, Bnd) -> Out`.
pub trait StencilFn: Action {
    type Cell: Data;
    type Bnd: Data;
    type Out: Data;
    fn apply(cell: Self::Cell, left: Self::Bnd, right: Self::Bnd) -> Self::Out;
}

impl<A, T, B, R> StencilFn for A
where
    A: Action<Args = (T, B, B), Output = R>,
    T: Data,
    B: Data,
    R: Data,
{
    type Cell = T;
    type Bnd = B;
    type Out = R;
    fn apply(cell: T, left: B, right: B) -> R {
        A::call((cell, left, right))
    }
}

/// A boundary projection action, `(Cell, Face) -> Bnd`.
pub trait BoundaryFn: Action {
    type Cell: Data;
    type Bnd: Data;
    fn project(cell: Self::Cell, face: Face) -> Self::Bnd;
}

impl<A, T, B> BoundaryFn for A
where
    A: Action<Args = (T, Face), Output = B>,
    T: Data,
    B: Data,
{
    type Cell = T;
    type Bnd = B;
    fn project(cell: T, face: Face) -> B {
        A::call((cell, face))
    }
}

/// Reads a shallow copy of a subtree on its home rank; what the closure
/// forms use to pull remote children over.
pub struct TreeFetch<T>(PhantomData<fn() -> T>);

impl<T: Data> Action for TreeFetch<T> {
    type Args = (Client<Tree<T>>,);
    type Output = Tree<T>;
    fn call((client,): Self::Args) -> Tree<T> {
        (*client.get()).clone()
    }
}

/// Maps a subtree on its home rank.
pub struct TreeFmap<A>(PhantomData<fn() -> A>);

impl<A: Unary> Action for TreeFmap<A> {
    type Args = (Client<Tree<A::In>>,);
    type Output = GlobalSharedPtr<Tree<A::Out>>;
    fn call((client,): Self::Args) -> Self::Output {
        GlobalSharedPtr::new(client.get().fmap_action::<A>())
    }
}

/// Zips two subtrees on the first one's home rank.
pub struct TreeFmap2<A>(PhantomData<fn() -> A>);

impl<A: Binary> Action for TreeFmap2<A> {
    type Args = (Client<Tree<A::In1>>, Client<Tree<A::In2>>);
    type Output = GlobalSharedPtr<Tree<A::Out>>;
    fn call((left, right): Self::Args) -> Self::Output {
        let right = Tree::fetch(&right);
        GlobalSharedPtr::new(left.get().fmap2_action::<A>(&right))
    }
}

/// Folds a subtree on its home rank.
pub struct TreeFoldMap<F, Op>(PhantomData<fn() -> (F, Op)>);

impl<F, Op> Action for TreeFoldMap<F, Op>
where
    F: Unary,
    Op: Action<Args = (F::Out, F::Out), Output = F::Out>,
{
    type Args = (Client<Tree<F::In>>, F::Out);
    type Output = F::Out;
    fn call((client, z): Self::Args) -> F::Out {
        client.get().fold_map_action::<F, Op>(z)
    }
}

/// Constructs a subtree over a sub-range on the destination rank.
pub struct TreeIota<A>(PhantomData<fn() -> A>);

impl<A: Unary<In = i64>> Action for TreeIota<A> {
    type Args = (IotaRange,);
    type Output = GlobalSharedPtr<Tree<A::Out>>;
    fn call((range,): Self::Args) -> Self::Output {
        GlobalSharedPtr::new(Tree::iota_action::<A>(range))
    }
}

/// Projects a subtree's extremal cell on its home rank.
pub struct TreeBoundary<G>(PhantomData<fn() -> G>);

impl<G: BoundaryFn> Action for TreeBoundary<G> {
    type Args = (Client<Tree<G::Cell>>, Face);
    type Output = G::Bnd;
    fn call((client, face): Self::Args) -> G::Bnd {
        client.get().boundary_action::<G>(face)
    }
}

/// Rebuilds a subtree under a stencil on its home rank.
pub struct TreeStencil<F, G>(PhantomData<fn() -> (F, G)>);

impl<F, G> Action for TreeStencil<F, G>
where
    F: StencilFn,
    G: BoundaryFn<Cell = F::Cell, Bnd = F::Bnd>,
{
    type Args = (Client<Tree<F::Cell>>, F::Bnd, F::Bnd);
    type Output = GlobalSharedPtr<Tree<F::Out>>;
    fn call((client, bm, bp): Self::Args) -> Self::Output {
        GlobalSharedPtr::new(client.get().stencil_fmap_action::<F, G>(bm, bp))
    }
}

/// Registers the subtree fetch for element type `T`, needed by the closure
/// forms (and `head`/`last`/`size`) whenever children live remotely.
pub fn register_tree<T: Data>(registry: &mut Registry) {
    registry.register::<TreeFetch<T>>();
}

/// Registers a unary element action and its `fmap` lift.
pub fn register_map_action<A: Unary>(registry: &mut Registry) {
    registry.register::<A>();
    registry.register::<TreeFmap<A>>();
    register_tree::<A::In>(registry);
    register_tree::<A::Out>(registry);
}

/// Registers a binary element action and its `fmap2` lift.
pub fn register_map2_action<A: Binary>(registry: &mut Registry) {
    registry.register::<A>();
    registry.register::<TreeFmap2<A>>();
    register_tree::<A::In1>(registry);
    register_tree::<A::In2>(registry);
    register_tree::<A::Out>(registry);
}

/// Registers a projection/combiner pair and their `fold_map` lift.
pub fn register_fold_actions<F, Op>(registry: &mut Registry)
where
    F: Unary,
    Op: Action<Args = (F::Out, F::Out), Output = F::Out>,
{
    registry.register::<F>();
    registry.register::<Op>();
    registry.register::<TreeFoldMap<F, Op>>();
    register_tree::<F::In>(registry);
}

/// Registers an index action and its distributed `iota` lift.
pub fn register_iota_action<A: Unary<In = i64>>(registry: &mut Registry) {
    registry.register::<A>();
    registry.register::<TreeIota<A>>();
    register_tree::<A::Out>(registry);
}

/// Registers a stencil combiner/projection pair and their lifts.
pub fn register_stencil_actions<F, G>(registry: &mut Registry)
where
    F: StencilFn,
    G: BoundaryFn<Cell = F::Cell, Bnd = F::Bnd>,
{
    registry.register::<F>();
    registry.register::<G>();
    registry.register::<TreeStencil<F, G>>();
    registry.register::<TreeBoundary<G>>();
    register_tree::<F::Cell>(registry);
    register_tree::<F::Out>(registry);
}
