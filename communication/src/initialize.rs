//! Bootstrap: configuration, process placement, and the rank driver.
//!
//! [`execute`] assembles one rank of a computation: registry first, then the
//! worker pool, then the fabric, then the user's main on rank 0 — and tears
//! everything down in reverse once the termination protocol delivers the
//! exit code.

use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::unbounded;

use crate::registry::Registry;
use crate::transport::{
    attach, channel_recv_loop, tcp_recv_loop, tcp_send_loop, CommStats, Fabric, Runtime,
};
use crate::{networking, shared, termination, Rank};

/// Possible shapes of a computation.
pub enum Config {
    /// One rank, this process, default worker count.
    Thread,
    /// Several ranks inside one OS process, connected by channels. The
    /// fabric of tests and single-machine runs.
    Process {
        ranks: usize,
        /// Worker threads per rank.
        threads: usize,
    },
    /// One rank per OS process over a TCP mesh.
    Cluster {
        /// Worker threads for this rank.
        threads: usize,
        /// This process's identity, `0 .. addresses.len()`.
        process: usize,
        /// One `host:port` per rank, in rank order.
        addresses: Vec<String>,
        /// Report connection progress.
        report: bool,
    },
}

impl Config {
    /// Constructs a configuration from command-line arguments.
    ///
    /// Understands `-w/--threads`, `-p/--process`, `-n/--processes`,
    /// `-h/--hostfile` and `-r/--report`; returns the configuration and the
    /// remaining free arguments, which are handed to the user's main.
    pub fn from_args<I: Iterator<Item = String>>(args: I) -> Result<(Config, Vec<String>)> {
        let mut opts = getopts::Options::new();
        opts.optopt("w", "threads", "number of per-process worker threads", "NUM");
        opts.optopt("p", "process", "identity of this process", "IDX");
        opts.optopt("n", "processes", "number of processes", "NUM");
        opts.optopt("h", "hostfile", "text file whose lines are process addresses", "FILE");
        opts.optflag("r", "report", "reports connection progress");

        let matches = opts.parse(args).map_err(|e| anyhow!("{}", e))?;

        let threads = match matches.opt_str("w") {
            Some(arg) => arg.parse().context("parsing -w")?,
            None => default_threads(),
        };
        let process: usize =
            matches.opt_str("p").map(|arg| arg.parse()).transpose().context("parsing -p")?.unwrap_or(0);
        let processes: usize =
            matches.opt_str("n").map(|arg| arg.parse()).transpose().context("parsing -n")?.unwrap_or(1);
        let report = matches.opt_present("r");

        if process >= processes {
            bail!("process index {} out of range for {} processes", process, processes);
        }

        let config = if processes > 1 {
            let addresses = match matches.opt_str("h") {
                Some(hosts) => {
                    use std::io::BufRead;
                    let file = std::fs::File::open(&hosts)
                        .with_context(|| format!("opening hostfile {}", hosts))?;
                    let reader = std::io::BufReader::new(file);
                    let addresses: Vec<String> =
                        reader.lines().take(processes).collect::<std::io::Result<_>>()?;
                    if addresses.len() < processes {
                        bail!(
                            "could only read {} addresses from {}, but -n: {}",
                            addresses.len(),
                            hosts,
                            processes
                        );
                    }
                    addresses
                }
                None => (0..processes).map(|index| format!("localhost:{}", 2101 + index)).collect(),
            };
            Config::Cluster { threads, process, addresses, report }
        } else if threads != default_threads() {
            Config::Process { ranks: 1, threads }
        } else {
            Config::Thread
        };
        Ok((config, matches.free))
    }
}

fn default_threads() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(2)
}

/// What the user's main sees of its surroundings.
pub struct World {
    rt: Arc<Runtime>,
    args: Vec<String>,
}

impl World {
    /// This process's rank.
    pub fn rank(&self) -> Rank {
        self.rt.rank()
    }

    /// The number of ranks.
    pub fn size(&self) -> Rank {
        self.rt.size()
    }

    /// The free command-line arguments.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// A snapshot of this rank's transport counters.
    pub fn stats(&self) -> CommStats {
        self.rt.stats()
    }
}

/// Parses the command line and runs the computation it describes.
pub fn execute_from_args<I, R, F>(args: I, register: R, rpc_main: F) -> Result<i32>
where
    I: Iterator<Item = String>,
    R: Fn(&mut Registry) + Send + Sync + 'static,
    F: Fn(&World) -> i32 + Send + Sync + 'static,
{
    let (config, free) = Config::from_args(args)?;
    execute_with_args(config, free, register, rpc_main)
}

/// Initializes a computation and runs `rpc_main` on rank 0.
///
/// `register` runs once per rank, before any traffic, and must register the
/// same actions everywhere — it is the Rust-side stand-in for registration
/// at static-initialization time, and keeping it a single shared callback is
/// what makes the registries byte-identical across peers.
///
/// Returns the exit code of `rpc_main`, propagated to every rank by the
/// termination protocol.
pub fn execute<R, F>(config: Config, register: R, rpc_main: F) -> Result<i32>
where
    R: Fn(&mut Registry) + Send + Sync + 'static,
    F: Fn(&World) -> i32 + Send + Sync + 'static,
{
    execute_with_args(config, Vec::new(), register, rpc_main)
}

fn execute_with_args<R, F>(config: Config, args: Vec<String>, register: R, rpc_main: F) -> Result<i32>
where
    R: Fn(&mut Registry) + Send + Sync + 'static,
    F: Fn(&World) -> i32 + Send + Sync + 'static,
{
    // Fixed construction order: registry, thread pool, transport, then the
    // user's main; teardown happens in reverse inside `run_rank`.
    let mut registry = Registry::new();
    termination::register_builtins(&mut registry);
    shared::register_builtins(&mut registry);
    register(&mut registry);
    let registry = Arc::new(registry);

    let shortcut = std::env::var("RPC_DISABLE_SHORTCUT").is_err();
    let rpc_main: Arc<dyn Fn(&World) -> i32 + Send + Sync> = Arc::new(rpc_main);
    let args = Arc::new(args);

    match config {
        Config::Thread => {
            let rt = Runtime::new(0, 1, registry, Fabric::Single, shortcut);
            Ok(run_rank(rt, default_threads(), None, Vec::new(), rpc_main, args))
        }
        Config::Process { ranks, threads } => {
            assert!(ranks > 0, "a computation needs at least one rank");
            let size = ranks as Rank;
            let mut channels = Vec::with_capacity(ranks);
            for _ in 0..ranks {
                channels.push(unbounded::<(Rank, Vec<u8>)>());
            }
            let peers: Vec<_> = channels.iter().map(|(tx, _)| tx.clone()).collect();

            let mut drivers = Vec::with_capacity(ranks);
            for (rank, (_, rx)) in channels.into_iter().enumerate() {
                let rt =
                    Runtime::new(rank as Rank, size, registry.clone(), Fabric::Channels { peers: peers.clone() }, shortcut);
                let recv_rt = rt.clone();
                let recv = thread::Builder::new()
                    .name(format!("arbor recv {}", rank))
                    .spawn(move || channel_recv_loop(recv_rt, rx))
                    .context("spawning receive loop")?;
                let (rpc_main, args) = (rpc_main.clone(), args.clone());
                drivers.push((
                    thread::Builder::new()
                        .name(format!("arbor rank {}", rank))
                        .spawn(move || run_rank(rt, threads, None, Vec::new(), rpc_main, args))
                        .context("spawning rank driver")?,
                    recv,
                ));
            }
            drop(peers);

            let mut code = None;
            for (driver, recv) in drivers {
                let rank_code = driver.join().map_err(|_| anyhow!("rank driver panicked"))?;
                recv.join().map_err(|_| anyhow!("receive loop panicked"))?;
                assert!(code.is_none() || code == Some(rank_code), "ranks disagree on the exit code");
                code = Some(rank_code);
            }
            Ok(code.expect("at least one rank ran"))
        }
        Config::Cluster { threads, process, addresses, report } => {
            let size = addresses.len() as Rank;
            let rank = process as Rank;
            let placement = Placement::derive(rank, size, &addresses);
            let sockets = networking::create_sockets(addresses, process, report)?;

            let mut peers = Vec::with_capacity(size as usize);
            let mut loops = Vec::new();
            let mut pending_recv = Vec::new();
            for (peer, socket) in sockets.into_iter().enumerate() {
                match socket {
                    None => peers.push(None),
                    Some(stream) => {
                        let (tx, rx) = unbounded::<Vec<u8>>();
                        peers.push(Some(tx));
                        let writer = stream.try_clone().context("cloning stream")?;
                        let peer_rank = peer as Rank;
                        loops.push(
                            thread::Builder::new()
                                .name(format!("arbor send {}", peer))
                                .spawn(move || {
                                    if let Err(error) = tcp_send_loop(writer, rx, rank, peer_rank) {
                                        panic!("communication error on send to {}: {:?}", peer_rank, error);
                                    }
                                })
                                .context("spawning send loop")?,
                        );
                        pending_recv.push(stream);
                    }
                }
            }

            let rt = Runtime::new(rank, size, registry, Fabric::Tcp { peers }, shortcut);
            for stream in pending_recv {
                let recv_rt = rt.clone();
                loops.push(
                    thread::Builder::new()
                        .name("arbor recv".to_string())
                        .spawn(move || {
                            if let Err(error) = tcp_recv_loop(recv_rt, stream) {
                                panic!("communication error on receive: {:?}", error);
                            }
                        })
                        .context("spawning receive loop")?,
                );
            }

            let code = run_rank(rt, threads, Some(placement), loops, rpc_main, args);
            Ok(code)
        }
    }
}

/// Drives one rank to completion: spawn and pin workers, report placement,
/// run the user's main on rank 0, wait for the exit code, drain and join.
fn run_rank(
    rt: Arc<Runtime>,
    threads: usize,
    placement: Option<Placement>,
    fabric_loops: Vec<thread::JoinHandle<()>>,
    rpc_main: Arc<dyn Fn(&World) -> i32 + Send + Sync>,
    args: Arc<Vec<String>>,
) -> i32 {
    attach(&rt);
    check_environment(&rt, threads, placement.as_ref());

    let cores = core_affinity::get_core_ids().unwrap_or_default();
    let mut workers = Vec::with_capacity(threads);
    for worker in 0..threads {
        let worker_rt = rt.clone();
        let core = placement.as_ref().and_then(|p| p.core_for(worker, threads, &cores));
        workers.push(
            thread::Builder::new()
                .name(format!("arbor worker {}", worker))
                .spawn(move || {
                    attach(&worker_rt);
                    if let Some(core) = core {
                        core_affinity::set_for_current(core);
                    }
                    worker_rt.pool.work();
                })
                .expect("spawning worker thread"),
        );
    }

    if rt.rank() == 0 {
        log::info!("running on {} ranks, {} workers each", rt.size(), threads);
        let main_rt = rt.clone();
        let args = args.to_vec();
        rt.pool.submit(Box::new(move || {
            let world = World { rt: main_rt.clone(), args };
            // A panicking main must still drain the world; every rank would
            // otherwise wait forever for an exit code.
            let code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                (rpc_main)(&world)
            }))
            .unwrap_or_else(|payload| {
                log::error!("rpc_main panicked: {}", crate::threads::panic_message(payload));
                101
            });
            main_rt.termination.begin(code);
        }));
    }

    let code = rt.termination.wait_exit();
    if rt.rank() == 0 {
        if code == 0 {
            log::info!("done: success");
        } else {
            log::info!("done: failure (error={})", code);
        }
    }

    // Teardown in reverse: fabric first (queued messages still drain), then
    // the pool, then the loops.
    rt.close_fabric();
    rt.pool.stop();
    for worker in workers {
        let _ = worker.join();
    }
    for handle in fabric_loops {
        let _ = handle.join();
    }
    crate::transport::detach();
    code
}

/// Where this rank sits on its node, derived from the environment hint.
struct Placement {
    node: Rank,
    nodes: Rank,
    local_rank: Rank,
    local_size: Rank,
}

impl Placement {
    fn derive(rank: Rank, size: Rank, addresses: &[String]) -> Placement {
        let hinted = std::env::var("RPC_NODES").ok().and_then(|s| s.trim().parse::<Rank>().ok());
        let nodes = hinted.unwrap_or_else(|| {
            let mut hosts: Vec<&str> =
                addresses.iter().map(|a| a.split(':').next().unwrap_or(a)).collect();
            hosts.sort_unstable();
            hosts.dedup();
            hosts.len() as Rank
        });
        let nodes = nodes.clamp(1, size);
        if size % nodes != 0 {
            log::warn!("world of {} does not divide into {} nodes; assuming one node", size, nodes);
            return Placement { node: 0, nodes: 1, local_rank: rank, local_size: size };
        }
        let local_size = size / nodes;
        Placement {
            node: rank / local_size,
            nodes,
            local_rank: rank % local_size,
            local_size,
        }
    }

    /// The PU for a worker, filling the node evenly: worker `w` of local
    /// rank `l` is thread `l * threads + w` of the node's thread grid.
    fn core_for(
        &self,
        worker: usize,
        threads: usize,
        cores: &[core_affinity::CoreId],
    ) -> Option<core_affinity::CoreId> {
        if cores.is_empty() {
            return None;
        }
        let node_threads = self.local_size as usize * threads;
        let node_thread = self.local_rank as usize * threads + worker;
        Some(cores[node_thread * cores.len() / node_threads % cores.len()])
    }
}

/// Warns about inconsistencies between the environment's expectations and
/// the observed world; never fatal.
fn check_environment(rt: &Arc<Runtime>, threads: usize, placement: Option<&Placement>) {
    let nodes = placement.map(|p| p.nodes).unwrap_or(1);
    if rt.rank() == 0 {
        log::info!("processes: {}", rt.size());
        log::info!("worker threads per process: {}", threads);
        log::info!("compute nodes: {}", nodes);
    }
    if let Some(p) = placement {
        log::info!(
            "rank {}: node {}/{}, local rank {}/{}",
            rt.rank(),
            p.node,
            p.nodes,
            p.local_rank,
            p.local_size
        );
    }
    check_count("RPC_PROCESSES", rt.size());
    check_count("RPC_THREADS", threads as Rank);
    check_count("RPC_NODES", nodes);
    let cores = core_affinity::get_core_ids().map(|ids| ids.len()).unwrap_or(0) as Rank;
    if cores > 0 {
        check_count("RPC_CORES", cores);
    }
}

fn check_count(name: &str, actual: Rank) {
    match std::env::var(name) {
        Ok(value) => match value.trim().parse::<Rank>() {
            Ok(expected) if expected == actual => {}
            Ok(expected) => {
                log::warn!(
                    "environment variable {} ({}) is inconsistent with the observed value ({})",
                    name,
                    expected,
                    actual
                );
            }
            Err(_) => {
                log::warn!("environment variable {} ({:?}) is not an integer", name, value);
            }
        },
        Err(_) => log::warn!("environment variable {} is not set", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(line: &str) -> impl Iterator<Item = String> + '_ {
        line.split_whitespace().map(|s| s.to_string())
    }

    #[test]
    fn default_config_is_single_threaded() {
        let (config, free) = Config::from_args(argv("")).unwrap();
        assert!(matches!(config, Config::Thread));
        assert!(free.is_empty());
    }

    #[test]
    fn cluster_config_defaults_to_localhost() {
        let (config, _) = Config::from_args(argv("-n 3 -p 1 -w 2")).unwrap();
        match config {
            Config::Cluster { threads, process, addresses, report } => {
                assert_eq!(threads, 2);
                assert_eq!(process, 1);
                assert_eq!(addresses, vec!["localhost:2101", "localhost:2102", "localhost:2103"]);
                assert!(!report);
            }
            _ => panic!("expected a cluster configuration"),
        }
    }

    #[test]
    fn free_arguments_pass_through() {
        let (_, free) = Config::from_args(argv("-w 2 demo 17")).unwrap();
        assert_eq!(free, vec!["demo", "17"]);
    }

    #[test]
    fn process_index_must_be_in_range() {
        assert!(Config::from_args(argv("-n 2 -p 5")).is_err());
    }

    #[test]
    fn placement_splits_the_world_evenly() {
        let addresses: Vec<String> = Vec::new();
        std::env::set_var("RPC_NODES", "2");
        let p = Placement::derive(5, 8, &addresses);
        std::env::remove_var("RPC_NODES");
        assert_eq!((p.node, p.nodes, p.local_rank, p.local_size), (1, 2, 1, 4));
    }
}
