//! The distributed tree: a recursively partitioned sequence.
//!
//! A tree is either a *leaf* holding a small ordered array of values, or a
//! *branch* holding a non-empty ordered array of clients of subtrees, which
//! may live on any rank. Trees are immutable: every operation builds a new
//! tree. In-order traversal — left to right through the leaves — is the
//! sequence a tree represents.
//!
//! Every traversal operation comes in two forms. The closure form takes
//! ordinary functions and works on the calling rank, pulling remote
//! subtrees over as it descends. The action form takes registered
//! [`Action`]s and ships the work to each subtree's home rank instead,
//! returning clients of the results; the two forms produce equal trees.

use std::cmp::min;
use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use arbor_communication::{call, runtime, sync, Client, Data, Launch, Rank};

use crate::actions::{Binary, TreeFetch, TreeFmap, TreeFmap2, TreeFoldMap, TreeIota, Unary};
use crate::range::{IotaRange, Range};

/// The largest number of values a leaf may hold. Construction subdivides
/// anything larger.
pub const MAX_LEAF: usize = 10;

pub(crate) type LeafVec<T> = SmallVec<[T; MAX_LEAF]>;

#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "T: Data")]
pub(crate) enum Node<T> {
    Leaf(LeafVec<T>),
    Branch(Vec<Client<Tree<T>>>),
}

/// A distributed, recursively partitioned sequence of `T`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound = "T: Data")]
pub struct Tree<T> {
    pub(crate) node: Node<T>,
}

impl<T: Data> Tree<T> {
    /// The empty tree; the identity of [`Tree::mplus`].
    pub fn mzero() -> Tree<T> {
        Tree { node: Node::Leaf(SmallVec::new()) }
    }

    /// The singleton tree.
    pub fn munit(value: T) -> Tree<T> {
        Tree { node: Node::Leaf(std::iter::once(value).collect()) }
    }

    /// A tree over the given values, subdivided so that no leaf exceeds
    /// [`MAX_LEAF`].
    pub fn from_values(values: impl IntoIterator<Item = T>) -> Tree<T> {
        let values: Vec<T> = values.into_iter().collect();
        if values.len() <= MAX_LEAF {
            return Tree { node: Node::Leaf(values.into_iter().collect()) };
        }
        let children = values
            .into_iter()
            .chunks(MAX_LEAF)
            .into_iter()
            .map(|chunk| Client::new(Tree { node: Node::Leaf(chunk.collect()) }))
            .collect();
        Tree::branch(children)
    }

    /// A tree of the given values as one leaf. Unlike [`Tree::from_values`]
    /// the count must fit a single leaf.
    pub fn msome(values: impl IntoIterator<Item = T>) -> Tree<T> {
        let values: LeafVec<T> = values.into_iter().collect();
        assert!(values.len() <= MAX_LEAF, "msome of more than {} values", MAX_LEAF);
        Tree { node: Node::Leaf(values) }
    }

    /// A branch over the given subtrees.
    pub fn branch(children: Vec<Client<Tree<T>>>) -> Tree<T> {
        assert!(!children.is_empty(), "a branch must have at least one child");
        Tree { node: Node::Branch(children) }
    }

    /// A branch whose children are `self` and `others`, in order.
    pub fn mplus(&self, others: &[Tree<T>]) -> Tree<T> {
        let mut children = Vec::with_capacity(1 + others.len());
        children.push(Client::new(self.clone()));
        children.extend(others.iter().map(|tree| Client::new(tree.clone())));
        Tree::branch(children)
    }

    /// Resolves a child to a tree on the calling rank: a clone when local,
    /// a shallow copy fetched from its home rank otherwise.
    pub(crate) fn fetch(client: &Client<Tree<T>>) -> Tree<T> {
        let ptr = client.get_ptr();
        assert!(!ptr.is_empty(), "a tree child is never an empty client");
        if ptr.is_local() {
            (*ptr.get()).clone()
        } else {
            sync::<TreeFetch<T>>(ptr.proc(), (client.clone(),))
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.node {
            Node::Leaf(values) => values.is_empty(),
            Node::Branch(children) => {
                children.iter().all(|child| Tree::fetch(child).is_empty())
            }
        }
    }

    /// The number of values in the sequence: the sum of leaf cardinalities.
    pub fn size(&self) -> usize {
        match &self.node {
            Node::Leaf(values) => values.len(),
            Node::Branch(children) => {
                children.iter().map(|child| Tree::fetch(child).size()).sum()
            }
        }
    }

    /// The first value in in-order traversal; the tree must be non-empty.
    pub fn head(&self) -> T {
        match &self.node {
            Node::Leaf(values) => values.first().expect("head of an empty tree").clone(),
            Node::Branch(children) => {
                Tree::fetch(children.first().expect("branches are never empty")).head()
            }
        }
    }

    /// The last value in in-order traversal; the tree must be non-empty.
    pub fn last(&self) -> T {
        match &self.node {
            Node::Leaf(values) => values.last().expect("last of an empty tree").clone(),
            Node::Branch(children) => {
                Tree::fetch(children.last().expect("branches are never empty")).last()
            }
        }
    }

    /// The sequence the tree represents, in order.
    pub fn to_vec(&self) -> Vec<T> {
        match &self.node {
            Node::Leaf(values) => values.to_vec(),
            Node::Branch(children) => children
                .iter()
                .flat_map(|child| Tree::fetch(child).to_vec())
                .collect(),
        }
    }

    /// A tree whose in-order traversal is `f(i)` for each `i` of the range,
    /// built on the calling rank.
    pub fn iota(f: &impl Fn(i64) -> T, range: IotaRange) -> Tree<T> {
        let local = range.local;
        if local.size() <= MAX_LEAF {
            return Tree { node: Node::Leaf(local.iter().map(f).collect()) };
        }
        let children = subdivide(local)
            .map(|fine| Client::new(Tree::iota(f, IotaRange::with_global(range.global, fine))))
            .collect();
        Tree::branch(children)
    }

    /// The distributed form of [`Tree::iota`]: sub-ranges are constructed on
    /// ranks round-robin across the world, and the children resolve as the
    /// remote constructions complete.
    pub fn iota_action<A>(range: IotaRange) -> Tree<T>
    where
        A: Unary<In = i64, Out = T>,
    {
        let local = range.local;
        if local.size() <= MAX_LEAF {
            return Tree { node: Node::Leaf(local.iter().map(A::apply).collect()) };
        }
        let size = runtime().size();
        let children = subdivide(local)
            .enumerate()
            .map(|(index, fine)| {
                let dest = index as Rank % size;
                let sub = IotaRange::with_global(range.global, fine);
                Client::from_future(call::<TreeIota<A>>(Launch::Async, dest, (sub,)))
            })
            .collect();
        Tree::branch(children)
    }

    /// A tree of the same shape with `f` applied to every value.
    pub fn fmap<R: Data>(&self, f: &impl Fn(&T) -> R) -> Tree<R> {
        match &self.node {
            Node::Leaf(values) => Tree { node: Node::Leaf(values.iter().map(f).collect()) },
            Node::Branch(children) => Tree::branch(
                children
                    .iter()
                    .map(|child| Client::new(Tree::fetch(child).fmap(f)))
                    .collect(),
            ),
        }
    }

    /// The action form of [`Tree::fmap`]: each subtree is mapped on its home
    /// rank. Requires [`crate::actions::register_map_action`] for `A`.
    pub fn fmap_action<A: Unary<In = T>>(&self) -> Tree<A::Out> {
        match &self.node {
            Node::Leaf(values) => {
                Tree { node: Node::Leaf(values.iter().cloned().map(A::apply).collect()) }
            }
            Node::Branch(children) => Tree::branch(
                children
                    .iter()
                    .map(|child| {
                        Client::from_future(call::<TreeFmap<A>>(
                            Launch::Async,
                            child.proc_future(),
                            (child.clone(),),
                        ))
                    })
                    .collect(),
            ),
        }
    }

    /// Zips two trees of equal shape. Unequal shapes are a hard error: the
    /// trees are traversed in lock-step and any leaf-length or child-count
    /// mismatch aborts.
    pub fn fmap2<U: Data, R: Data>(&self, other: &Tree<U>, f: &impl Fn(&T, &U) -> R) -> Tree<R> {
        match (&self.node, &other.node) {
            (Node::Leaf(left), Node::Leaf(right)) => {
                assert_eq!(left.len(), right.len(), "fmap2 on leaves of different length");
                Tree {
                    node: Node::Leaf(
                        left.iter().zip(right.iter()).map(|(a, b)| f(a, b)).collect(),
                    ),
                }
            }
            (Node::Branch(left), Node::Branch(right)) => {
                assert_eq!(left.len(), right.len(), "fmap2 on branches of different width");
                Tree::branch(
                    left.iter()
                        .zip(right.iter())
                        .map(|(a, b)| {
                            Client::new(Tree::fetch(a).fmap2(&Tree::fetch(b), f))
                        })
                        .collect(),
                )
            }
            _ => panic!("fmap2 on trees of different shape"),
        }
    }

    /// The action form of [`Tree::fmap2`]; each zipped pair is combined on
    /// the first subtree's home rank.
    pub fn fmap2_action<A>(&self, other: &Tree<A::In2>) -> Tree<A::Out>
    where
        A: Binary<In1 = T>,
    {
        match (&self.node, &other.node) {
            (Node::Leaf(left), Node::Leaf(right)) => {
                assert_eq!(left.len(), right.len(), "fmap2 on leaves of different length");
                Tree {
                    node: Node::Leaf(
                        left.iter()
                            .zip(right.iter())
                            .map(|(a, b)| A::apply2(a.clone(), b.clone()))
                            .collect(),
                    ),
                }
            }
            (Node::Branch(left), Node::Branch(right)) => {
                assert_eq!(left.len(), right.len(), "fmap2 on branches of different width");
                Tree::branch(
                    left.iter()
                        .zip(right.iter())
                        .map(|(a, b)| {
                            Client::from_future(call::<TreeFmap2<A>>(
                                Launch::Async,
                                a.proc_future(),
                                (a.clone(), b.clone()),
                            ))
                        })
                        .collect(),
                )
            }
            _ => panic!("fmap2 on trees of different shape"),
        }
    }

    /// In-order fold of `f`-projected values under an associative `op` with
    /// identity `z`.
    pub fn fold_map<R: Clone>(&self, f: &impl Fn(&T) -> R, op: &impl Fn(R, R) -> R, z: R) -> R {
        match &self.node {
            Node::Leaf(values) => values.iter().fold(z, |acc, value| op(acc, f(value))),
            Node::Branch(children) => children.iter().fold(z.clone(), |acc, child| {
                op(acc, Tree::fetch(child).fold_map(f, op, z.clone()))
            }),
        }
    }

    /// `fold_map` with the identity projection.
    pub fn fold(&self, op: &impl Fn(T, T) -> T, z: T) -> T {
        self.fold_map(&|value| value.clone(), op, z)
    }

    /// The action form of [`Tree::fold_map`]: every child contributes its
    /// partial result from its home rank, and the branch combines them in
    /// in-order left-fold order.
    pub fn fold_map_action<F, Op>(&self, z: F::Out) -> F::Out
    where
        F: Unary<In = T>,
        Op: arbor_communication::Action<Args = (F::Out, F::Out), Output = F::Out>,
    {
        match &self.node {
            Node::Leaf(values) => values
                .iter()
                .fold(z, |acc, value| Op::call((acc, F::apply(value.clone())))),
            Node::Branch(children) => {
                let partials: Vec<_> = children
                    .iter()
                    .map(|child| {
                        call::<TreeFoldMap<F, Op>>(
                            Launch::Async,
                            child.proc_future(),
                            (child.clone(), z.clone()),
                        )
                    })
                    .collect();
                partials
                    .into_iter()
                    .fold(z, |acc, partial| Op::call((acc, partial.get())))
            }
        }
    }

    /// Concatenates `f(x)` over the in-order sequence of the tree.
    pub fn mbind<R: Data>(&self, f: &impl Fn(&T) -> Tree<R>) -> Tree<R> {
        match &self.node {
            Node::Leaf(values) if values.is_empty() => Tree::mzero(),
            Node::Leaf(values) => {
                Tree::branch(values.iter().map(|value| Client::new(f(value))).collect())
            }
            Node::Branch(children) => Tree::branch(
                children
                    .iter()
                    .map(|child| Client::new(Tree::fetch(child).mbind(f)))
                    .collect(),
            ),
        }
    }
}

/// Flattens one level of nesting.
pub fn mjoin<T: Data>(nested: &Tree<Tree<T>>) -> Tree<T> {
    nested.mbind(&|tree| tree.clone())
}

/// Splits a range into contiguous sub-ranges of at most [`MAX_LEAF`]
/// strides each.
fn subdivide(range: Range) -> impl Iterator<Item = Range> {
    let coarse = Range::new(range.imin, range.imax, range.istep * MAX_LEAF as i64);
    coarse.iter().map(move |imin| {
        Range::new(
            imin,
            min(range.imax, imin + range.istep * MAX_LEAF as i64),
            range.istep,
        )
    })
}

impl<T: Data + fmt::Display> fmt::Display for Tree<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tree[{}]", self.to_vec().iter().join(", "))
    }
}

impl<T: Data + fmt::Debug> fmt::Debug for Tree<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.node {
            Node::Leaf(values) => write!(f, "Leaf({:?})", values),
            Node::Branch(children) => write!(f, "Branch({} children)", children.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdivision_covers_the_range_in_order() {
        let range = Range::new(3, 137, 2);
        let pieces: Vec<Range> = subdivide(range).collect();
        assert!(pieces.iter().all(|piece| piece.size() <= MAX_LEAF));
        let flattened: Vec<i64> = pieces.iter().flat_map(|piece| piece.iter()).collect();
        let expected: Vec<i64> = range.iter().collect();
        assert_eq!(flattened, expected);
    }

    #[test]
    fn subdivision_of_a_leaf_sized_range_is_one_piece()  {
        let pieces: Vec<Range> = subdivide(Range::new(0, 10, 1)).collect();
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0], Range::new(0, 10, 1));
    }
}
