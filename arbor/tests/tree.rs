//! Algebraic laws of the tree container, exercised on a world of one.

use arbor::{execute, Config, IotaRange, Range, Tree};

/// Runs `body` as the computation's main and asserts a clean exit.
fn run(body: impl Fn() + Send + Sync + 'static) {
    let code = execute(Config::Thread, |_| {}, move |_world| {
        body();
        0
    })
    .unwrap();
    assert_eq!(code, 0);
}

/// Runs `body` and asserts that it panicked.
fn run_expecting_panic(body: impl Fn() + Send + Sync + 'static) {
    let code = execute(Config::Thread, |_| {}, move |_world| {
        body();
        0
    })
    .unwrap();
    assert_eq!(code, 101, "the computation should have panicked");
}

fn iota_i64(n: i64) -> Tree<i64> {
    Tree::iota(&|i| i, IotaRange::new(Range::new(0, n, 1)))
}

#[test]
fn iota_size_and_elements() {
    run(|| {
        let r = Range::new(3, 90, 4);
        let xs = Tree::iota(&|i| 10 * i, IotaRange::new(r));
        assert_eq!(xs.size(), r.size());
        let expected: Vec<i64> = r.iter().map(|i| 10 * i).collect();
        assert_eq!(xs.to_vec(), expected);
        assert_eq!(xs.head(), 30);
        assert_eq!(xs.last(), 10 * 87);
    });
}

#[test]
fn iota_fold_sums_the_range() {
    run(|| {
        let xs = Tree::iota(&|i| i + 1, IotaRange::new(Range::new(0, 100, 1)));
        assert_eq!(xs.fold(&|a, b| a + b, 0), 5050);
    });
}

#[test]
fn functor_composition() {
    run(|| {
        let xs = iota_i64(137);
        let f = |x: &i64| x + 3;
        let g = |x: &i64| x * 5;
        let composed = xs.fmap(&|x| g(&f(x)));
        let chained = xs.fmap(&f).fmap(&g);
        assert_eq!(composed.to_vec(), chained.to_vec());
        assert_eq!(composed.size(), xs.size());
    });
}

#[test]
fn fold_map_fuses_with_fmap() {
    run(|| {
        let xs = iota_i64(64);
        let g = |x: &i64| x * 7;
        let f = |x: &i64| x % 13;
        let op = |a: i64, b: i64| a + b;
        let outer = xs.fmap(&g).fold_map(&f, &op, 0);
        let fused = xs.fold_map(&|x| f(&g(x)), &op, 0);
        assert_eq!(outer, fused);
    });
}

#[test]
fn fmap2_zips_pointwise() {
    run(|| {
        let xs = iota_i64(50);
        let ys = xs.fmap(&|x| x * x);
        let zs = xs.fmap2(&ys, &|a, b| b - a);
        assert_eq!(zs.size(), xs.size());
        let expected: Vec<i64> = (0..50).map(|i| i * i - i).collect();
        assert_eq!(zs.to_vec(), expected);
    });
}

#[test]
fn fmap2_rejects_mismatched_shapes() {
    run_expecting_panic(|| {
        let xs = iota_i64(50);
        let ys = iota_i64(40);
        let _ = xs.fmap2(&ys, &|a, b| a + b);
    });
}

#[test]
fn monad_left_identity() {
    run(|| {
        let f = |x: &i64| Tree::from_values([*x, -*x]);
        let bound = Tree::munit(17i64).mbind(&f);
        assert_eq!(bound.to_vec(), f(&17).to_vec());
    });
}

#[test]
fn monad_join_of_unit() {
    run(|| {
        let xs = iota_i64(23);
        let joined = arbor::mjoin(&Tree::munit(xs.clone()));
        assert_eq!(joined.to_vec(), xs.to_vec());
        let joined = arbor::mjoin(&xs.fmap(&|x| Tree::munit(*x)));
        assert_eq!(joined.to_vec(), xs.to_vec());
    });
}

#[test]
fn mbind_concatenates_in_order() {
    run(|| {
        let xs = iota_i64(12);
        let doubled = xs.mbind(&|x| Tree::from_values([*x, *x]));
        let expected: Vec<i64> = (0..12).flat_map(|i| [i, i]).collect();
        assert_eq!(doubled.to_vec(), expected);
        assert_eq!(doubled.size(), 24);
    });
}

#[test]
fn mbind_on_the_empty_tree_is_empty() {
    run(|| {
        let zero: Tree<i64> = Tree::mzero();
        let bound = zero.mbind(&|x| Tree::munit(*x));
        assert!(bound.is_empty());
        assert_eq!(bound.size(), 0);
    });
}

#[test]
fn mplus_identity_and_associativity_up_to_shape() {
    run(|| {
        let xs = iota_i64(21);
        let zero: Tree<i64> = Tree::mzero();
        assert_eq!(zero.mplus(&[xs.clone()]).to_vec(), xs.to_vec());
        assert_eq!(xs.mplus(&[zero.clone()]).to_vec(), xs.to_vec());

        let (a, b, c) = (iota_i64(4), iota_i64(7), iota_i64(11));
        let left = a.mplus(&[b.clone()]).mplus(&[c.clone()]);
        let right = a.mplus(&[b.mplus(&[c.clone()])]);
        assert_eq!(left.to_vec(), right.to_vec());
        assert_eq!(left.size(), right.size());
    });
}

#[test]
fn msome_is_a_single_leaf() {
    run(|| {
        let xs = Tree::msome([1i64, 2, 3]);
        assert_eq!(xs.to_vec(), vec![1, 2, 3]);
        assert_eq!((xs.head(), xs.last()), (1, 3));
    });
}

#[test]
fn msome_refuses_to_overflow_a_leaf() {
    run_expecting_panic(|| {
        let _ = Tree::msome(0i64..20);
    });
}

#[test]
fn from_values_preserves_order_past_the_leaf_bound() {
    run(|| {
        let xs = Tree::from_values(0i64..137);
        assert_eq!(xs.size(), 137);
        assert_eq!(xs.to_vec(), (0..137).collect::<Vec<_>>());
    });
}

#[test]
fn empty_branch_is_rejected() {
    run_expecting_panic(|| {
        let _: Tree<i64> = Tree::branch(Vec::new());
    });
}

#[test]
fn stencil_on_one_leaf() {
    run(|| {
        // Four cells in one leaf: every cell sees its true neighbors.
        let xs = Tree::from_values([0.0f64, 1.0, 2.0, 3.0]);
        let ys = xs.stencil_fmap(&|_, l, r| r - l, &|x, _| *x, -1.0, 4.0);
        assert_eq!(ys.to_vec(), vec![1.0 - (-1.0), 2.0, 2.0, 4.0 - 2.0]);
    });
}

#[test]
fn stencil_round_trip_across_branches() {
    run(|| {
        let xs = Tree::iota(&|i| i as f64, IotaRange::new(Range::new(0, 64, 1)));
        let ys = xs.stencil_fmap(&|_, l, r| r - l, &|x, _| *x, -1.0, 64.0);
        assert_eq!(ys.size(), 64);
        let values = ys.to_vec();
        for (i, value) in values.iter().enumerate() {
            assert_eq!(*value, 2.0, "cell {} saw the wrong neighbors", i);
        }
    });
}

#[test]
fn stencil_of_a_singleton_sees_both_outer_boundaries() {
    run(|| {
        let xs = Tree::munit(5.0f64);
        let ys = xs.stencil_fmap(&|x, l, r| x + l + r, &|x, _| *x, 1.0, 2.0);
        assert_eq!(ys.to_vec(), vec![8.0]);
    });
}

#[test]
fn display_renders_the_traversal() {
    run(|| {
        let xs = Tree::from_values([1i64, 2, 3]);
        assert_eq!(format!("{}", xs), "tree[1, 2, 3]");
    });
}
