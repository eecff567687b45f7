//! Shared helpers for driving a real session over pipe pairs, plus a
//! hand-rolled peer speaking the client side of both protocols.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;

use byteorder::{ByteOrder, NetworkEndian, ReadBytesExt, WriteBytesExt};
use nix::unistd;

use rpmemd::daemon::config::Config;
use rpmemd::daemon::session::Session;
use rpmemd::db::Db;
use rpmemd::fabric::PersistFn;
use rpmemd::oob::Oob;
use rpmemd::proto::{
    self, PoolAttr, ReqAttr, RespAttr, Status, POOL_ATTR_SIZE, RESP_ATTR_SIZE,
};
use rpmemd::transport::Transport;

pub const DP_WRITE: u8 = 1;
pub const DP_PERSIST: u8 = 2;
pub const DP_PERSIST_ACK: u8 = 3;

/// The peer's end of the out-of-band channel.
pub struct Peer {
    transport: Transport,
    fds: Vec<RawFd>,
}

impl Peer {
    pub fn recv_ready(&mut self) -> u32 {
        let mut word = [0; 4];
        self.transport.recv(&mut word).expect("ready word to arrive");
        NetworkEndian::read_u32(&word)
    }

    pub fn send_create(&mut self, req: &ReqAttr, pool_attr: &PoolAttr) {
        let mut buf = Vec::new();
        proto::encode_create(&mut buf, req, pool_attr).expect("encode to succeed");
        self.transport.send(&buf).expect("send to succeed");
    }

    pub fn send_open(&mut self, req: &ReqAttr) {
        let mut buf = Vec::new();
        proto::encode_open(&mut buf, req).expect("encode to succeed");
        self.transport.send(&buf).expect("send to succeed");
    }

    pub fn send_close(&mut self) {
        let mut buf = Vec::new();
        proto::encode_close(&mut buf).expect("encode to succeed");
        self.transport.send(&buf).expect("send to succeed");
    }

    pub fn recv_create_resp(&mut self) -> (Status, Option<RespAttr>) {
        let mut buf = vec![0; 4 + RESP_ATTR_SIZE];
        self.transport.recv(&mut buf).expect("create response to arrive");
        let status = Status::from_u32(NetworkEndian::read_u32(&buf[..4]));
        if status.is_ok() {
            let resp = RespAttr::read_from(&mut &buf[4..]).expect("response to parse");
            (status, Some(resp))
        } else {
            (status, None)
        }
    }

    pub fn recv_open_resp(&mut self) -> (Status, Option<(RespAttr, PoolAttr)>) {
        let mut buf = vec![0; 4 + RESP_ATTR_SIZE + POOL_ATTR_SIZE];
        self.transport.recv(&mut buf).expect("open response to arrive");
        let status = Status::from_u32(NetworkEndian::read_u32(&buf[..4]));
        if status.is_ok() {
            let mut cursor = &buf[4..];
            let resp = RespAttr::read_from(&mut cursor).expect("response to parse");
            let pool_attr = PoolAttr::read_from(&mut cursor).expect("attributes to parse");
            (status, Some((resp, pool_attr)))
        } else {
            (status, None)
        }
    }

    pub fn recv_close_resp(&mut self) -> Status {
        let mut word = [0; 4];
        self.transport.recv(&mut word).expect("close response to arrive");
        Status::from_u32(NetworkEndian::read_u32(&word))
    }

    /// Drop our ends of the pipes, which the daemon observes as EOF.
    pub fn hang_up(&mut self) {
        for fd in self.fds.drain(..) {
            let _ = unistd::close(fd);
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.hang_up();
    }
}

pub struct SessionHarness {
    pub handle: thread::JoinHandle<anyhow::Result<()>>,
    pub peer: Peer,
}

/// Run a whole session on a background thread, wired to the returned peer
/// through two pipes.
pub fn spawn_session(dir: &Path, persist_apm: bool, persist: PersistFn) -> SessionHarness {
    let (c2d_rx, c2d_tx) = unistd::pipe().expect("pipe to open");
    let (d2c_rx, d2c_tx) = unistd::pipe().expect("pipe to open");

    let oob = Oob::new(Transport::new(c2d_rx, d2c_tx));
    let db = Db::new(dir, 0o666).expect("db to init");
    let config = Config {
        poolset_dir: Some(String::from(dir.to_str().expect("utf8 path"))),
        persist_apm: Some(persist_apm),
        ..Config::default()
    };
    let mut session = Session::new(oob, db, config, persist, 2);

    let handle = thread::spawn(move || {
        let res = session.run();
        drop(session);
        let _ = unistd::close(c2d_rx);
        let _ = unistd::close(d2c_tx);
        res
    });

    SessionHarness {
        handle,
        peer: Peer { transport: Transport::new(d2c_rx, c2d_tx), fds: vec![d2c_rx, c2d_tx] },
    }
}

pub fn test_pool_attr() -> PoolAttr {
    PoolAttr {
        signature: *b"PMEMPOOL",
        major: 1,
        compat_features: 0,
        incompat_features: 0,
        ro_compat_features: 0,
        poolset_uuid: [0xa1; 16],
        uuid: [0xb2; 16],
        prev_uuid: [0xc3; 16],
        next_uuid: [0xd4; 16],
    }
}

/// A persist callback that only records what it was asked to flush.
pub fn recorder() -> (PersistFn, Arc<Mutex<Vec<(usize, usize)>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let persist: PersistFn = Arc::new(move |addr, len| {
        sink.lock().unwrap().push((addr, len));
    });
    (persist, log)
}

pub fn dp_write(stream: &mut TcpStream, lane: u32, offset: u64, data: &[u8]) {
    let mut msg = Vec::new();
    msg.write_u8(DP_WRITE).expect("encode to succeed");
    msg.write_u32::<NetworkEndian>(lane).expect("encode to succeed");
    msg.write_u64::<NetworkEndian>(offset).expect("encode to succeed");
    msg.write_u64::<NetworkEndian>(data.len() as u64).expect("encode to succeed");
    msg.extend_from_slice(data);
    stream.write_all(&msg).expect("data plane write to succeed");
}

pub fn dp_persist(stream: &mut TcpStream, lane: u32, offset: u64, length: u64) {
    let mut msg = Vec::new();
    msg.write_u8(DP_PERSIST).expect("encode to succeed");
    msg.write_u32::<NetworkEndian>(lane).expect("encode to succeed");
    msg.write_u64::<NetworkEndian>(offset).expect("encode to succeed");
    msg.write_u64::<NetworkEndian>(length).expect("encode to succeed");
    stream.write_all(&msg).expect("data plane write to succeed");
}

pub fn dp_recv_ack(stream: &mut TcpStream) -> u32 {
    let mut op = [0; 1];
    stream.read_exact(&mut op).expect("ack to arrive");
    assert_eq!(op[0], DP_PERSIST_ACK);
    stream.read_u32::<NetworkEndian>().expect("lane id to arrive")
}
