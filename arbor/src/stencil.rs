//! Stencil operations: `fmap` with access to neighbor values.
//!
//! A stencil pass rebuilds a tree so that every cell sees its own value plus
//! a projected *boundary* from each neighbor. The projection `g` turns a
//! cell into a boundary value for one of its faces; the combiner `f` turns
//! a cell and its two boundaries into the output cell. The caller supplies
//! the outermost boundaries; boundaries between the children of a branch
//! come from `g` applied to the adjacent child's extremal cell,
//! recursively.

use serde::{Deserialize, Serialize};

use arbor_communication::{call, spawn, sync, Client, Data, Future, Launch};

use crate::actions::{BoundaryFn, StencilFn, TreeBoundary, TreeStencil};
use crate::tree::{Node, Tree};

/// Which side of a cell a boundary belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Face {
    Lower,
    Upper,
}

/// The pair of boundary values enclosing a 1-D region.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Boundaries<B> {
    pub lower: B,
    pub upper: B,
}

impl<B> Boundaries<B> {
    pub fn new(lower: B, upper: B) -> Self {
        Boundaries { lower, upper }
    }
}

impl<T: Data> Tree<T> {
    /// The boundary of the whole tree at `face`: `g` applied to the extremal
    /// cell on that side. The tree must be non-empty.
    pub fn boundary<B: Data>(&self, g: &impl Fn(&T, Face) -> B, face: Face) -> B {
        match face {
            Face::Lower => g(&self.head(), face),
            Face::Upper => g(&self.last(), face),
        }
    }

    /// A tree of the same shape where each cell sees its neighbors'
    /// projections: cell `i` of a leaf sees `g(x[i-1], Upper)` on the left
    /// and `g(x[i+1], Lower)` on the right, with `bm` and `bp` standing in
    /// at the two ends of the whole tree.
    pub fn stencil_fmap<B: Data, R: Data>(
        &self,
        f: &impl Fn(&T, &B, &B) -> R,
        g: &impl Fn(&T, Face) -> B,
        bm: B,
        bp: B,
    ) -> Tree<R> {
        match &self.node {
            Node::Leaf(values) if values.is_empty() => Tree::mzero(),
            Node::Leaf(values) => {
                let n = values.len();
                let out = values
                    .iter()
                    .enumerate()
                    .map(|(i, value)| {
                        let left =
                            if i == 0 { bm.clone() } else { g(&values[i - 1], Face::Upper) };
                        let right =
                            if i == n - 1 { bp.clone() } else { g(&values[i + 1], Face::Lower) };
                        f(value, &left, &right)
                    })
                    .collect();
                Tree { node: Node::Leaf(out) }
            }
            Node::Branch(children) => {
                let trees: Vec<Tree<T>> = children.iter().map(Tree::fetch).collect();
                let n = trees.len();
                let out = trees
                    .iter()
                    .enumerate()
                    .map(|(i, tree)| {
                        let left = if i == 0 {
                            bm.clone()
                        } else {
                            trees[i - 1].boundary(g, Face::Upper)
                        };
                        let right = if i == n - 1 {
                            bp.clone()
                        } else {
                            trees[i + 1].boundary(g, Face::Lower)
                        };
                        Client::new(tree.stencil_fmap(f, g, left, right))
                    })
                    .collect();
                Tree::branch(out)
            }
        }
    }

    /// The action form of [`Tree::boundary`]: the projection runs on the
    /// extremal subtree's home rank.
    pub fn boundary_action<G>(&self, face: Face) -> G::Bnd
    where
        G: BoundaryFn<Cell = T>,
    {
        match &self.node {
            Node::Leaf(values) => {
                let cell = match face {
                    Face::Lower => values.first().expect("boundary of an empty tree"),
                    Face::Upper => values.last().expect("boundary of an empty tree"),
                };
                G::project(cell.clone(), face)
            }
            Node::Branch(children) => {
                let child = match face {
                    Face::Lower => children.first().expect("branches are never empty"),
                    Face::Upper => children.last().expect("branches are never empty"),
                };
                sync::<TreeBoundary<G>>(child.proc_future(), (child.clone(), face))
            }
        }
    }

    /// The action form of [`Tree::stencil_fmap`]: every subtree is rebuilt
    /// on its home rank, and internal boundaries travel as messages between
    /// the adjacent subtrees' homes. Requires
    /// [`crate::actions::register_stencil_actions`] for `F` and `G`.
    pub fn stencil_fmap_action<F, G>(&self, bm: F::Bnd, bp: F::Bnd) -> Tree<F::Out>
    where
        F: StencilFn<Cell = T>,
        G: BoundaryFn<Cell = T, Bnd = F::Bnd>,
    {
        match &self.node {
            Node::Leaf(values) if values.is_empty() => Tree::mzero(),
            Node::Leaf(values) => {
                let n = values.len();
                let out = values
                    .iter()
                    .enumerate()
                    .map(|(i, value)| {
                        let left = if i == 0 {
                            bm.clone()
                        } else {
                            G::project(values[i - 1].clone(), Face::Upper)
                        };
                        let right = if i == n - 1 {
                            bp.clone()
                        } else {
                            G::project(values[i + 1].clone(), Face::Lower)
                        };
                        F::apply(value.clone(), left, right)
                    })
                    .collect();
                Tree { node: Node::Leaf(out) }
            }
            Node::Branch(children) => {
                let n = children.len();
                // Left boundaries: the supplied bm for the first child, the
                // left neighbor's upper projection for the rest; mirrored
                // for the right. Each projection is evaluated on the
                // neighbor's home rank while the children proceed.
                let mut lefts: Vec<Future<F::Bnd>> = Vec::with_capacity(n);
                let mut rights: Vec<Future<F::Bnd>> = Vec::with_capacity(n);
                for i in 0..n {
                    if i == 0 {
                        lefts.push(Future::ready(bm.clone()));
                    } else {
                        let neighbor = &children[i - 1];
                        lefts.push(call::<TreeBoundary<G>>(
                            Launch::Async,
                            neighbor.proc_future(),
                            (neighbor.clone(), Face::Upper),
                        ));
                    }
                    if i == n - 1 {
                        rights.push(Future::ready(bp.clone()));
                    } else {
                        let neighbor = &children[i + 1];
                        rights.push(call::<TreeBoundary<G>>(
                            Launch::Async,
                            neighbor.proc_future(),
                            (neighbor.clone(), Face::Lower),
                        ));
                    }
                }
                let out = children
                    .iter()
                    .zip(lefts.into_iter().zip(rights))
                    .map(|(child, (left, right))| {
                        let child = child.clone();
                        Client::from_future(spawn(Launch::Async, move || {
                            let left = left.get();
                            let right = right.get();
                            sync::<TreeStencil<F, G>>(
                                child.proc_future(),
                                (child.clone(), left, right),
                            )
                        }))
                    })
                    .collect();
                Tree::branch(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Unit coverage of the pure leaf arithmetic lives here; whole-tree
    // stencil behavior is exercised in tests/tree.rs with a runtime up.
    #[test]
    fn boundaries_hold_their_sides() {
        let b = Boundaries::new(-1.0f64, 64.0f64);
        assert_eq!(b.lower, -1.0);
        assert_eq!(b.upper, 64.0);
    }
}
