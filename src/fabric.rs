//! The fabric adapter: the in-band data plane that services remote writes
//! and persist requests against a registered memory region.
//!
//! The verbs-level provider is an external collaborator; this adapter keeps
//! its interface (init, accept, process_start, process_stop, wait_close,
//! close) and its concurrency contract while carrying the traffic over a
//! TCP stream. Lanes are independent client submission channels; operations
//! on one lane stay ordered, operations on different lanes may run on
//! different worker threads in parallel.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{self, Read as _, Write as _};
use std::net::{Ipv4Addr, Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time;

use anyhow::{anyhow, Context};
use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info};

use crate::consts::NLANES_MAX;
use crate::proto::{PersistMethod, Provider, RespAttr};

const OP_WRITE: u8 = 1;
const OP_PERSIST: u8 = 2;
const OP_PERSIST_ACK: u8 = 3;

/// Flushes an address range to persistence. Invoked from worker threads,
/// possibly concurrently for disjoint ranges.
pub type PersistFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Everything needed to register a memory region with the fabric.
pub struct FabricAttr {
    pub addr: usize,
    pub size: u64,
    pub nlanes: u32,
    pub nthreads: usize,
    pub provider: Provider,
    pub persist_method: PersistMethod,
    pub persist: PersistFn,
}

/// The registered target region. Workers write through raw pointers since
/// the mapping itself is owned by the pool database; the client contract is
/// that concurrent operations touch disjoint ranges and that all traffic
/// has quiesced before the region goes away.
#[derive(Clone, Copy)]
struct Region {
    base: usize,
    len: u64,
}

impl Region {
    /// The one bounds test every op goes through, at receipt and again
    /// before touching memory.
    fn contains(&self, offset: u64, len: u64) -> bool {
        offset.checked_add(len).map_or(false, |end| end <= self.len)
    }

    fn write(&self, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        if !self.contains(offset, data.len() as u64) {
            return Err(anyhow!(
                "write of {} bytes at offset {:#x} exceeds region of {:#x} bytes",
                data.len(),
                offset,
                self.len
            ));
        }
        // Safety: bounds checked above, and the mapping outlives the
        // fabric's processing threads.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (self.base + offset as usize) as *mut u8,
                data.len(),
            );
        }
        Ok(())
    }

    fn range(&self, offset: u64, len: u64) -> anyhow::Result<(usize, usize)> {
        if !self.contains(offset, len) {
            return Err(anyhow!(
                "range of {} bytes at offset {:#x} exceeds region of {:#x} bytes",
                len,
                offset,
                self.len
            ));
        }
        Ok((self.base + offset as usize, len as usize))
    }
}

/// Shared handle for killing the whole data plane from any processing
/// thread. A fatal condition on one lane must stop the session, not just
/// that lane: the stop flag ends dispatch and the socket shutdown makes
/// sure the client sees an error instead of waiting on a dead lane.
#[derive(Clone)]
struct Fault {
    stop: Arc<AtomicBool>,
    stream: Arc<TcpStream>,
}

impl Fault {
    fn trip(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Lets the controller block until the client hangs up the data plane.
#[derive(Default)]
struct CloseNotifier {
    slot: Mutex<bool>,
    cond: Condvar,
}

impl CloseNotifier {
    fn notify(&self) {
        let mut closed = self.slot.lock().unwrap();
        *closed = true;
        self.cond.notify_all();
    }

    /// Returns false if the wait timed out. A timeout of `None` waits
    /// forever.
    fn wait(&self, timeout: Option<time::Duration>) -> bool {
        let closed = self.slot.lock().unwrap();
        match timeout {
            Some(t) => {
                // unwrap to propagate lock poisoning as an unwind
                let (closed, wait_res) =
                    self.cond.wait_timeout_while(closed, t, |closed| !*closed).unwrap();
                !wait_res.timed_out() || *closed
            }
            None => *self.cond.wait_while(closed, |closed| !*closed).unwrap(),
        }
    }
}

enum LaneOp {
    Write { offset: u64, data: Vec<u8> },
    Persist { lane: u32, offset: u64, length: u64 },
    Stop,
}

/// One data-plane endpoint serving a single registered region.
///
/// Lifecycle calls must arrive in order: init, accept, process_start,
/// process_stop, wait_close, close; dropping the value releases whatever
/// is left.
pub struct Fabric {
    listener: TcpListener,
    stream: Option<TcpStream>,
    region: Region,
    persist_method: PersistMethod,
    persist: PersistFn,
    nthreads: usize,
    stop: Arc<AtomicBool>,
    closed: Arc<CloseNotifier>,
    lanes: Vec<Sender<LaneOp>>,
    workers: Vec<thread::JoinHandle<()>>,
    reader: Option<thread::JoinHandle<()>>,
}

impl Fabric {
    /// Register the region and advertise a rendezvous tuple. The data
    /// plane listens on an ephemeral port unless `service` pins one.
    pub fn init(service: Option<u16>, attr: FabricAttr) -> anyhow::Result<(Fabric, RespAttr)> {
        if attr.nthreads == 0 {
            return Err(anyhow!("no processing threads available"));
        }

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, service.unwrap_or(0)))
            .context("binding the data plane listener")?;
        let port = listener.local_addr().context("reading the bound address")?.port();

        let nlanes = attr.nlanes.min(NLANES_MAX);
        let mut hasher = DefaultHasher::new();
        (attr.addr, attr.size).hash(&mut hasher);

        let resp = RespAttr {
            port,
            rkey: hasher.finish(),
            raddr: attr.addr as u64,
            nlanes,
            persist_method: attr.persist_method,
        };
        info!(
            "data plane on port {} (provider {:?}, {} lanes, {} threads)",
            port, attr.provider, nlanes, attr.nthreads
        );

        Ok((
            Fabric {
                listener,
                stream: None,
                region: Region { base: attr.addr, len: attr.size },
                persist_method: attr.persist_method,
                persist: attr.persist,
                nthreads: attr.nthreads,
                stop: Arc::new(AtomicBool::new(false)),
                closed: Arc::new(CloseNotifier::default()),
                lanes: Vec::new(),
                workers: Vec::new(),
                reader: None,
            },
            resp,
        ))
    }

    /// Block until the client's data-plane peer connects.
    pub fn accept(&mut self) -> anyhow::Result<()> {
        let (stream, peer) = self.listener.accept().context("accepting the data plane peer")?;
        info!("data plane peer connected from {}", peer);
        self.stream = Some(stream);
        Ok(())
    }

    /// Spawn the reader and the worker pool. Returns once they are running.
    pub fn process_start(&mut self) -> anyhow::Result<()> {
        let stream = self.stream.as_ref().ok_or_else(|| anyhow!("data plane not accepted"))?;
        let ack = Arc::new(Mutex::new(stream.try_clone().context("cloning the ack stream")?));
        let fault = Fault {
            stop: Arc::clone(&self.stop),
            stream: Arc::new(stream.try_clone().context("cloning the fault stream")?),
        };

        let mut receivers = Vec::with_capacity(self.nthreads);
        for _ in 0..self.nthreads {
            let (tx, rx) = crossbeam_channel::unbounded();
            self.lanes.push(tx);
            receivers.push(rx);
        }

        for (i, rx) in receivers.into_iter().enumerate() {
            let region = self.region;
            let method = self.persist_method;
            let persist = Arc::clone(&self.persist);
            let ack = Arc::clone(&ack);
            let fault = fault.clone();
            let handle = thread::Builder::new()
                .name(format!("lane-worker-{}", i))
                .spawn(move || worker_loop(rx, region, method, persist, ack, fault))
                .context("spawning a lane worker")?;
            self.workers.push(handle);
        }

        let reader_stream = stream.try_clone().context("cloning the reader stream")?;
        let lanes = self.lanes.clone();
        let stop = Arc::clone(&self.stop);
        let closed = Arc::clone(&self.closed);
        let region = self.region;
        let handle = thread::Builder::new()
            .name(String::from("lane-reader"))
            .spawn(move || {
                if let Err(err) = reader_loop(reader_stream, lanes, stop, region) {
                    error!("data plane reader: {:?}", err);
                    fault.trip();
                }
                closed.notify();
            })
            .context("spawning the data plane reader")?;
        self.reader = Some(handle);

        Ok(())
    }

    /// Tell the workers to drain their lanes and exit, then reap them. The
    /// reader keeps draining the socket so the close handshake stays
    /// observable.
    pub fn process_stop(&mut self) -> io::Result<()> {
        self.stop.store(true, Ordering::Release);
        let mut res = Ok(());
        for lane in self.lanes.drain(..) {
            if lane.send(LaneOp::Stop).is_err() {
                res = Err(io::Error::new(io::ErrorKind::Other, "lane worker died early"));
            }
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                res = Err(io::Error::new(io::ErrorKind::Other, "lane worker panicked"));
            }
        }
        res
    }

    /// Await the client's close handshake (EOF on the data plane). `None`
    /// waits forever.
    pub fn wait_close(&self, timeout: Option<time::Duration>) -> anyhow::Result<()> {
        if self.closed.wait(timeout) {
            Ok(())
        } else {
            Err(anyhow!("timed out waiting for the data plane to close"))
        }
    }

    /// Tear down the connection and reap the reader.
    pub fn close(&mut self) -> anyhow::Result<()> {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(reader) = self.reader.take() {
            reader.join().map_err(|_| anyhow!("data plane reader panicked"))?;
        }
        Ok(())
    }
}

impl Drop for Fabric {
    fn drop(&mut self) {
        // every exit path must reap the processing threads, even the ones
        // that never called process_stop or close; the socket goes down
        // first so nobody can stay blocked on it
        self.stop.store(true, Ordering::Release);
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        for lane in self.lanes.drain(..) {
            let _ = lane.send(LaneOp::Stop);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn reader_loop(
    mut stream: TcpStream,
    lanes: Vec<Sender<LaneOp>>,
    stop: Arc<AtomicBool>,
    region: Region,
) -> anyhow::Result<()> {
    loop {
        let op = match stream.read_u8() {
            Ok(op) => op,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                info!("data plane peer closed");
                return Ok(());
            }
            Err(err) => return Err(err).context("reading a data plane op"),
        };

        let lane = stream.read_u32::<NetworkEndian>().context("reading the lane id")?;
        let offset = stream.read_u64::<NetworkEndian>().context("reading the offset")?;
        let length = stream.read_u64::<NetworkEndian>().context("reading the length")?;
        let target = &lanes[lane as usize % lanes.len()];

        match op {
            OP_WRITE => {
                if !region.contains(offset, length) {
                    return Err(anyhow!(
                        "write of {:#x} bytes at offset {:#x} on lane {} exceeds the region",
                        length,
                        offset,
                        lane
                    ));
                }
                let mut data = vec![0; length as usize];
                stream.read_exact(&mut data).context("reading the write payload")?;
                if stop.load(Ordering::Acquire) {
                    debug!("dropping a write on lane {} after stop", lane);
                    continue;
                }
                if target.send(LaneOp::Write { offset, data }).is_err() {
                    return Err(anyhow!("lane {} worker is gone", lane));
                }
            }
            OP_PERSIST => {
                if stop.load(Ordering::Acquire) {
                    debug!("dropping a persist on lane {} after stop", lane);
                    continue;
                }
                if target.send(LaneOp::Persist { lane, offset, length }).is_err() {
                    return Err(anyhow!("lane {} worker is gone", lane));
                }
            }
            op => return Err(anyhow!("unknown data plane op {:#x}", op)),
        }
    }
}

/// A fatal condition on any lane trips the fault, which stops the whole
/// fabric rather than leaving the other lanes running against a session
/// that already failed.
fn worker_loop(
    rx: Receiver<LaneOp>,
    region: Region,
    method: PersistMethod,
    persist: PersistFn,
    ack: Arc<Mutex<TcpStream>>,
    fault: Fault,
) {
    while let Ok(op) = rx.recv() {
        match op {
            LaneOp::Stop => break,
            LaneOp::Write { offset, data } => {
                if let Err(err) = region.write(offset, &data) {
                    error!("remote write failed: {:?}", err);
                    fault.trip();
                    break;
                }
            }
            LaneOp::Persist { lane, offset, length } => {
                match region.range(offset, length) {
                    Ok((addr, len)) => {
                        // in appliance mode the client's own marker write
                        // provides durability, no flush on our side
                        if method == PersistMethod::Gpspm {
                            persist(addr, len);
                        }
                    }
                    Err(err) => {
                        error!("persist request out of range: {:?}", err);
                        fault.trip();
                        break;
                    }
                }
                if let Err(err) = send_persist_ack(&ack, lane) {
                    error!("sending a persist ack on lane {}: {}", lane, err);
                    fault.trip();
                    break;
                }
            }
        }
    }
}

fn send_persist_ack(ack: &Mutex<TcpStream>, lane: u32) -> io::Result<()> {
    let mut buf = Vec::with_capacity(5);
    buf.write_u8(OP_PERSIST_ACK)?;
    buf.write_u32::<NetworkEndian>(lane)?;
    // unwrap to propagate lock poisoning as an unwind
    let mut stream = ack.lock().unwrap();
    stream.write_all(&buf)
}
