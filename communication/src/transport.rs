//! The per-process runtime and its message fabric.
//!
//! Exactly one [`Runtime`] exists per rank. It owns the registry, the worker
//! pool, the promise and slot tables, and the fabric that connects this rank
//! to its peers. Three fabrics exist: a loopback-only fabric for a world of
//! one, an in-process channel fabric used by tests and single-machine runs,
//! and a TCP mesh for clusters.
//!
//! Messages are posted to a per-destination queue and picked up by a send
//! loop; a receive loop per peer decodes arriving payloads through the
//! registry and schedules them on the worker pool. Both directions preserve
//! FIFO order per (sender, receiver) pair, which the reference-counting and
//! termination layers rely on.

use std::cell::RefCell;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;

use crate::message::{self, MessageHeader};
use crate::promises::PromiseTable;
use crate::registry::{Envelope, Registry};
use crate::shared::SlotTable;
use crate::termination::Termination;
use crate::threads::Pool;
use crate::Rank;

thread_local! {
    static CURRENT: RefCell<Option<Arc<Runtime>>> = const { RefCell::new(None) };
}

/// The runtime the calling thread belongs to.
///
/// Panics off runtime threads; every thread the runtime spawns (workers,
/// receive loops, the rank driver) is attached to its runtime.
pub fn runtime() -> Arc<Runtime> {
    try_runtime().expect("no runtime is attached to this thread")
}

pub(crate) fn try_runtime() -> Option<Arc<Runtime>> {
    CURRENT.with(|current| current.borrow().clone())
}

pub(crate) fn attach(rt: &Arc<Runtime>) {
    CURRENT.with(|current| *current.borrow_mut() = Some(rt.clone()));
}

pub(crate) fn detach() {
    CURRENT.with(|current| *current.borrow_mut() = None);
}

/// A snapshot of the fabric's message counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CommStats {
    /// Messages handed to the fabric by this rank.
    pub sent: u64,
    /// Messages received from peers by this rank.
    pub received: u64,
}

/// The state of one rank: identity, registry, scheduler, tables, fabric.
pub struct Runtime {
    pub(crate) rank: Rank,
    pub(crate) size: Rank,
    pub(crate) registry: Arc<Registry>,
    pub(crate) pool: Pool,
    pub(crate) promises: PromiseTable,
    pub(crate) slots: SlotTable,
    pub(crate) termination: Termination,
    fabric: Mutex<Fabric>,
    shortcut: bool,
    sent: AtomicU64,
    received: AtomicU64,
}

impl Runtime {
    pub(crate) fn new(
        rank: Rank,
        size: Rank,
        registry: Arc<Registry>,
        fabric: Fabric,
        shortcut: bool,
    ) -> Arc<Runtime> {
        assert!(rank >= 0 && rank < size, "rank {} outside world of {}", rank, size);
        Arc::new(Runtime {
            rank,
            size,
            registry,
            pool: Pool::new(),
            promises: PromiseTable::new(),
            slots: SlotTable::new(),
            termination: Termination::new(rank, size),
            fabric: Mutex::new(fabric),
            shortcut,
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
        })
    }

    /// This process's rank within the world.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// The number of ranks in the world.
    pub fn size(&self) -> Rank {
        self.size
    }

    /// Whether calls to the local rank may bypass the fabric.
    pub(crate) fn shortcut(&self) -> bool {
        self.shortcut
    }

    /// A snapshot of this rank's message counters.
    pub fn stats(&self) -> CommStats {
        CommStats {
            sent: self.sent.load(Ordering::SeqCst),
            received: self.received.load(Ordering::SeqCst),
        }
    }

    /// Closes the send side of the fabric. Queued messages still drain.
    pub(crate) fn close_fabric(&self) {
        *self.fabric.lock() = Fabric::Closed;
    }
}

/// The send side of this rank's connection to its peers.
pub(crate) enum Fabric {
    /// A world of one; only the local shortcut can deliver.
    Single,
    /// All ranks share one OS process; peers are channel endpoints.
    Channels { peers: Vec<Sender<(Rank, Vec<u8>)>> },
    /// One OS process per rank; peers are the queues of per-peer send loops.
    Tcp { peers: Vec<Option<Sender<Vec<u8>>>> },
    /// Shut down; late messages are dropped.
    Closed,
}

/// Hands one serialized action to the fabric.
///
/// User-class messages are refused once the termination protocol has passed
/// stage 2 on this rank; protocol-class messages always go through. A
/// message to the local rank (possible only when the shortcut is disabled)
/// loops through the normal receive path, transport statistics included.
pub(crate) fn post(rt: &Arc<Runtime>, dest: Rank, bytes: Vec<u8>, protocol: bool) {
    assert!(dest >= 0 && dest < rt.size, "destination {} outside world of {}", dest, rt.size);
    if !protocol && rt.termination.refusing_sends() {
        log::debug!("rank {}: dropping user message to {} during drain", rt.rank, dest);
        return;
    }
    rt.sent.fetch_add(1, Ordering::SeqCst);
    if dest == rt.rank {
        dispatch(rt, rt.rank, bytes);
        return;
    }
    let fabric = rt.fabric.lock();
    match &*fabric {
        Fabric::Single => unreachable!("a world of one has no peers"),
        Fabric::Channels { peers } => {
            let _ = peers[dest as usize].send((rt.rank, bytes));
        }
        Fabric::Tcp { peers } => {
            let sender = peers[dest as usize].as_ref().expect("no stream to destination");
            let _ = sender.send(bytes);
        }
        Fabric::Closed => {
            log::debug!("rank {}: dropping message to {} after shutdown", rt.rank, dest);
        }
    }
}

/// Decodes one received payload and schedules its handler on the pool.
///
/// Once this rank refuses user sends, received user-class actions are
/// dropped as well; only protocol traffic still executes, mirroring the
/// stage 3/4 window of the termination protocol.
pub(crate) fn dispatch(rt: &Arc<Runtime>, source: Rank, bytes: Vec<u8>) {
    rt.received.fetch_add(1, Ordering::SeqCst);
    let (id, _) = message::split_frame(&bytes);
    let entry = rt.registry.lookup(id);
    if !entry.protocol && rt.termination.refusing_sends() {
        log::debug!("rank {}: dropping received user action during drain", rt.rank);
        return;
    }
    let handler = entry.handler;
    let envelope = Envelope { source };
    if entry.inline {
        let (_, body) = message::split_frame(&bytes);
        handler(body, envelope);
        return;
    }
    rt.pool.submit(Box::new(move || {
        let (_, body) = message::split_frame(&bytes);
        handler(body, envelope);
    }));
}

/// Receive side of the in-process channel fabric: one loop per rank, fed by
/// every peer; per-sender FIFO order is the channel's own.
pub(crate) fn channel_recv_loop(rt: Arc<Runtime>, rx: Receiver<(Rank, Vec<u8>)>) {
    attach(&rt);
    for (source, bytes) in rx.iter() {
        dispatch(&rt, source, bytes);
    }
}

/// Repeatedly sends queued messages into a TcpStream.
///
/// The communication pattern is a sequence of (header, payload) pairs,
/// terminated by a zero-length header once the queue closes, after which the
/// write side of the stream is shut down.
pub(crate) fn tcp_send_loop(
    stream: TcpStream,
    queue: Receiver<Vec<u8>>,
    source: Rank,
    target: Rank,
) -> anyhow::Result<()> {
    let mut writer = BufWriter::with_capacity(1 << 16, stream);
    let mut seqno = 0u32;
    let mut write = |writer: &mut BufWriter<TcpStream>, bytes: Vec<u8>| -> anyhow::Result<()> {
        let header = MessageHeader {
            source: source as u32,
            target: target as u32,
            length: bytes.len() as u32,
            seqno,
        };
        seqno = seqno.wrapping_add(1);
        header.write_to(writer).context("writing header")?;
        writer.write_all(&bytes).context("writing payload")?;
        Ok(())
    };
    loop {
        match queue.try_recv() {
            Ok(bytes) => write(&mut writer, bytes)?,
            Err(TryRecvError::Empty) => {
                // No evidence of more data; flush buffered frames before
                // blocking on the queue.
                writer.flush().context("flushing writer")?;
                match queue.recv() {
                    Ok(bytes) => write(&mut writer, bytes)?,
                    Err(_) => break,
                }
            }
            Err(TryRecvError::Disconnected) => break,
        }
    }
    let header =
        MessageHeader { source: source as u32, target: target as u32, length: 0, seqno };
    header.write_to(&mut writer).context("writing final header")?;
    writer.flush().context("flushing writer")?;
    writer.get_mut().shutdown(Shutdown::Write).context("write shutdown failed")?;
    Ok(())
}

/// Repeatedly reads from a TcpStream and dispatches complete messages, until
/// the peer's zero-length shutdown header arrives.
pub(crate) fn tcp_recv_loop(rt: Arc<Runtime>, stream: TcpStream) -> anyhow::Result<()> {
    attach(&rt);
    let mut reader = BufReader::with_capacity(1 << 16, stream);
    loop {
        let header = MessageHeader::read_from(&mut reader).context("reading header")?;
        if header.length == 0 {
            // Clean shutdown; confirm the absence of subsequent data.
            let mut probe = [0u8; 1];
            if reader.read(&mut probe).context("reading data")? > 0 {
                bail!("clean shutdown followed by data");
            }
            return Ok(());
        }
        let mut bytes = vec![0u8; header.length as usize];
        reader.read_exact(&mut bytes).context("reading payload")?;
        dispatch(&rt, header.source as Rank, bytes);
    }
}
