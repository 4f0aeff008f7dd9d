//! A 1-D wave equation solver expressed through the tree algebra.
//!
//! The state is a tree of cells `(u, rho, v)` with `rho = du/dt` and
//! `v = du/dx`. The spatial derivative comes from a stencil pass whose
//! boundary projection is the neighboring cell itself; time integration is
//! a two-stage Runge-Kutta built from `fmap2`; the conserved energy is a
//! `fold_map`. No process rank appears anywhere in the solver.
//!
//! ```ignore
//! cargo run --example wave -- -w 4 400 100
//! ```

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use arbor::actions::{
    register_fold_actions, register_iota_action, register_map2_action, register_stencil_actions,
};
use arbor::{execute, Action, Config, Face, IotaRange, Range, Tree};

#[derive(Copy, Clone, Debug)]
struct Params {
    ncells: i64,
    steps: usize,
    dx: f64,
    dt: f64,
}

static PARAMS: OnceLock<Params> = OnceLock::new();

fn params() -> &'static Params {
    PARAMS.get().expect("parameters are set before the computation starts")
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Cell {
    u: f64,
    rho: f64,
    v: f64,
}

/// Cell center of index `i`.
fn x(i: i64) -> f64 {
    (i as f64 + 0.5) * params().dx
}

/// A standing wave at rest.
struct Init;
impl Action for Init {
    type Args = (i64,);
    type Output = Cell;
    fn call((i,): (i64,)) -> Cell {
        use std::f64::consts::TAU;
        Cell { u: (TAU * x(i)).sin(), rho: 0.0, v: TAU * (TAU * x(i)).cos() }
    }
}

/// Spatial right-hand side: centered differences over the neighbor cells.
struct Rhs;
impl Action for Rhs {
    type Args = (Cell, Cell, Cell);
    type Output = Cell;
    fn call((cell, lower, upper): (Cell, Cell, Cell)) -> Cell {
        let dx = params().dx;
        Cell {
            u: cell.rho,
            rho: (upper.v - lower.v) / (2.0 * dx),
            v: (upper.rho - lower.rho) / (2.0 * dx),
        }
    }
}

/// The boundary a cell presents to its neighbor is the cell itself.
struct Edge;
impl Action for Edge {
    type Args = (Cell, Face);
    type Output = Cell;
    fn call((cell, _face): (Cell, Face)) -> Cell {
        cell
    }
}

/// The reflecting image of an edge cell, for the outer boundaries.
fn mirror(cell: &Cell) -> Cell {
    Cell { u: -cell.u, rho: -cell.rho, v: cell.v }
}

/// `state + dt/2 * rhs`, the half step of RK2.
struct AxpyHalf;
impl Action for AxpyHalf {
    type Args = (Cell, Cell);
    type Output = Cell;
    fn call((state, rhs): (Cell, Cell)) -> Cell {
        axpy(0.5 * params().dt, &state, &rhs)
    }
}

/// `state + dt * rhs`, the full step.
struct AxpyFull;
impl Action for AxpyFull {
    type Args = (Cell, Cell);
    type Output = Cell;
    fn call((state, rhs): (Cell, Cell)) -> Cell {
        axpy(params().dt, &state, &rhs)
    }
}

fn axpy(a: f64, state: &Cell, rhs: &Cell) -> Cell {
    Cell { u: state.u + a * rhs.u, rho: state.rho + a * rhs.rho, v: state.v + a * rhs.v }
}

/// Energy density of a cell.
struct EnergyOf;
impl Action for EnergyOf {
    type Args = (Cell,);
    type Output = f64;
    fn call((cell,): (Cell,)) -> f64 {
        0.5 * (cell.rho * cell.rho + cell.v * cell.v) * params().dx
    }
}

struct Sum;
impl Action for Sum {
    type Args = (f64, f64);
    type Output = f64;
    fn call((a, b): (f64, f64)) -> f64 {
        a + b
    }
}

fn rhs(state: &Tree<Cell>) -> Tree<Cell> {
    let lower = mirror(&state.head());
    let upper = mirror(&state.last());
    state.stencil_fmap_action::<Rhs, Edge>(lower, upper)
}

fn step(state: &Tree<Cell>) -> Tree<Cell> {
    let r0 = rhs(state);
    let half = state.fmap2_action::<AxpyHalf>(&r0);
    let r1 = rhs(&half);
    state.fmap2_action::<AxpyFull>(&r1)
}

fn energy(state: &Tree<Cell>) -> f64 {
    state.fold_map_action::<EnergyOf, Sum>(0.0)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let (config, free) = Config::from_args(std::env::args().skip(1))?;
    let ncells: i64 = free.first().map(|s| s.parse()).transpose()?.unwrap_or(400);
    let steps: usize = free.get(1).map(|s| s.parse()).transpose()?.unwrap_or(100);
    let dx = 1.0 / ncells as f64;
    PARAMS.set(Params { ncells, steps, dx, dt: 0.5 * dx }).expect("parameters set once");

    let code = execute(
        config,
        |registry| {
            register_iota_action::<Init>(registry);
            register_stencil_actions::<Rhs, Edge>(registry);
            register_map2_action::<AxpyHalf>(registry);
            register_map2_action::<AxpyFull>(registry);
            register_fold_actions::<EnergyOf, Sum>(registry);
        },
        |_world| {
            let p = *params();
            let mut state = Tree::iota_action::<Init>(IotaRange::new(Range::new(0, p.ncells, 1)));
            let e0 = energy(&state);
            println!("cells: {}, steps: {}, initial energy: {:.6}", p.ncells, p.steps, e0);
            for n in 1..=p.steps {
                state = step(&state);
                if n % 10 == 0 {
                    println!("step {:4}: energy {:.6}", n, energy(&state));
                }
            }
            let drift = (energy(&state) - e0).abs() / e0;
            println!("relative energy drift after {} steps: {:.2e}", p.steps, drift);
            0
        },
    )?;
    std::process::exit(code);
}
