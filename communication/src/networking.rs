//! Networking code for assembling the TCP mesh between ranks.
//!
//! Every pair of ranks shares one stream: lower ranks connect to higher
//! ranks' listeners, retrying until the peer's listener is up, and identify
//! themselves with a little-endian index handshake.

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Creates socket connections from a list of host addresses.
///
/// The item at `my_index` is `None`; all other items hold the stream to that
/// rank. `noisy` reports connection progress.
pub fn create_sockets(
    addresses: Vec<String>,
    my_index: usize,
    noisy: bool,
) -> Result<Vec<Option<TcpStream>>> {
    let hosts1 = Arc::new(addresses);
    let hosts2 = hosts1.clone();

    let start_task = thread::spawn(move || start_connections(hosts1, my_index, noisy));
    let await_task = thread::spawn(move || await_connections(hosts2, my_index, noisy));

    let mut results = start_task.join().expect("connect thread panicked")?;
    results.push(None);
    let to_extend = await_task.join().expect("accept thread panicked")?;
    results.extend(to_extend);

    if noisy {
        log::info!("process {}: initialization complete", my_index);
    }
    Ok(results)
}

/// Result contains connections `[0, my_index - 1]`.
fn start_connections(
    addresses: Arc<Vec<String>>,
    my_index: usize,
    noisy: bool,
) -> Result<Vec<Option<TcpStream>>> {
    let mut results: Vec<Option<TcpStream>> = (0..my_index).map(|_| None).collect();
    for index in 0..my_index {
        loop {
            match TcpStream::connect(&addresses[index][..]) {
                Ok(stream) => {
                    stream.set_nodelay(true).context("set_nodelay call failed")?;
                    let mut handshake = [0u8; 8];
                    LittleEndian::write_u64(&mut handshake, my_index as u64);
                    std::io::Write::write_all(&mut &stream, &handshake)
                        .context("failed to send process index")?;
                    results[index] = Some(stream);
                    if noisy {
                        log::info!("process {}: connection to process {}", my_index, index);
                    }
                    break;
                }
                Err(error) => {
                    if noisy {
                        log::info!(
                            "process {}: error connecting to process {}: {}; retrying",
                            my_index,
                            index,
                            error
                        );
                    }
                    sleep(Duration::from_millis(500));
                }
            }
        }
    }
    Ok(results)
}

/// Result contains connections `[my_index + 1, addresses.len() - 1]`.
fn await_connections(
    addresses: Arc<Vec<String>>,
    my_index: usize,
    noisy: bool,
) -> Result<Vec<Option<TcpStream>>> {
    let mut results: Vec<Option<TcpStream>> =
        (0..(addresses.len() - my_index - 1)).map(|_| None).collect();
    let listener = TcpListener::bind(&addresses[my_index][..])
        .with_context(|| format!("binding {}", addresses[my_index]))?;

    for _ in (my_index + 1)..addresses.len() {
        let mut stream = listener.accept().context("accepting connection")?.0;
        stream.set_nodelay(true).context("set_nodelay call failed")?;
        let mut buffer = [0u8; 8];
        stream.read_exact(&mut buffer).context("failed to read process index")?;
        let identifier = LittleEndian::read_u64(&buffer) as usize;
        results[identifier - my_index - 1] = Some(stream);
        if noisy {
            log::info!("process {}: connection from process {}", my_index, identifier);
        }
    }
    Ok(results)
}
