//! Daemon side of the out-of-band control channel: the startup status word,
//! request receipt, and response emission.

use std::io;

use byteorder::{ByteOrder, NetworkEndian, WriteBytesExt};
use tracing::debug;

use crate::consts;
use crate::proto::{
    self, PoolAttr, Request, RespAttr, Status, POOL_ATTR_SIZE, RESP_ATTR_SIZE,
};
use crate::transport::Transport;

pub struct Oob {
    transport: Transport,
}

fn connection_reset() -> io::Error {
    io::Error::from_raw_os_error(libc::ECONNRESET)
}

/// Structured decoding runs straight off the transport, where a vanished
/// peer shows up as a short read; reframe that as a reset.
fn map_eof(err: io::Error) -> io::Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        connection_reset()
    } else {
        err
    }
}

impl Oob {
    pub fn new(transport: Transport) -> Oob {
        Oob { transport }
    }

    /// The daemon's endpoint over its own stdin and stdout, which the
    /// tunnel bridges back to the client.
    pub fn stdio() -> Oob {
        Oob::new(Transport::new(consts::STDIN_FD, consts::STDOUT_FD))
    }

    /// Write the 4-byte startup status word. Zero means ready.
    pub fn status(&mut self, status: u32) -> io::Result<()> {
        let mut word = [0; 4];
        NetworkEndian::write_u32(&mut word, status);
        self.transport.send(&word)
    }

    /// Read the next request. `None` means the peer closed the channel
    /// cleanly between requests.
    pub fn recv_request(&mut self) -> io::Result<Option<Request>> {
        let mut kind_word = [0; 4];
        if !self.transport.recv_or_eof(&mut kind_word)? {
            return Ok(None);
        }
        let kind = NetworkEndian::read_u32(&kind_word);
        debug!("request kind {}", kind);

        let request = proto::decode_request(kind, &mut self.transport).map_err(map_eof)?;
        Ok(Some(request))
    }

    pub fn create_resp(&mut self, status: Status, resp: &RespAttr) -> io::Result<()> {
        let mut buf = Vec::with_capacity(4 + RESP_ATTR_SIZE);
        buf.write_u32::<NetworkEndian>(status.to_u32())?;
        resp.write_to(&mut buf)?;
        self.transport.send(&buf)
    }

    pub fn open_resp(
        &mut self,
        status: Status,
        resp: &RespAttr,
        pool_attr: &PoolAttr,
    ) -> io::Result<()> {
        let mut buf = Vec::with_capacity(4 + RESP_ATTR_SIZE + POOL_ATTR_SIZE);
        buf.write_u32::<NetworkEndian>(status.to_u32())?;
        resp.write_to(&mut buf)?;
        pool_attr.write_to(&mut buf)?;
        self.transport.send(&buf)
    }

    pub fn close_resp(&mut self, status: Status) -> io::Result<()> {
        let mut word = [0; 4];
        NetworkEndian::write_u32(&mut word, status.to_u32());
        self.transport.send(&word)
    }
}
