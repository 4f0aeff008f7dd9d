//! Round-trip latency of sync calls between two ranks.
//!
//! ```ignore
//! cargo run --example ping -- -n 2 -p 0 &
//! cargo run --example ping -- -n 2 -p 1
//! ```

use std::time::Instant;

use arbor_communication::{execute_from_args, sync, Action};

struct Ping;
impl Action for Ping {
    type Args = (u8,);
    type Output = u8;
    fn call((x,): (u8,)) -> u8 {
        x
    }
}

struct Payload;
impl Action for Payload {
    type Args = (Vec<u8>,);
    type Output = usize;
    fn call((bytes,): (Vec<u8>,)) -> usize {
        bytes.len()
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let code = execute_from_args(
        std::env::args().skip(1),
        |registry| {
            registry.register::<Ping>();
            registry.register::<Payload>();
        },
        |world| {
            let peer = world.size() - 1;
            const WARMUP: usize = 1_000;
            const ROUNDS: usize = 10_000;
            for _ in 0..WARMUP {
                sync::<Ping>(peer, (0,));
            }
            let start = Instant::now();
            for _ in 0..ROUNDS {
                assert_eq!(sync::<Ping>(peer, (42,)), 42);
            }
            let elapsed = start.elapsed();
            println!(
                "{} round trips to rank {}: {:?} ({:.2} us each)",
                ROUNDS,
                peer,
                elapsed,
                elapsed.as_secs_f64() * 1e6 / ROUNDS as f64
            );

            let megabyte = vec![0u8; 1 << 20];
            let start = Instant::now();
            const BULK: usize = 64;
            for _ in 0..BULK {
                assert_eq!(sync::<Payload>(peer, (megabyte.clone(),)), megabyte.len());
            }
            let elapsed = start.elapsed();
            println!(
                "{} MiB in {:?} ({:.1} MiB/s)",
                BULK,
                elapsed,
                BULK as f64 / elapsed.as_secs_f64()
            );
            let stats = world.stats();
            println!("sent {} messages, received {}", stats.sent, stats.received);
            0
        },
    )?;
    std::process::exit(code);
}
