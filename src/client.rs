//! Client half of the control protocol: dial a daemon through the tunnel
//! and drive pool create, open, and close requests.

use std::io;

use anyhow::anyhow;
use byteorder::{ByteOrder, NetworkEndian};
use tracing::info;

use crate::proto::{
    self, PoolAttr, ReqAttr, RespAttr, Status, POOL_ATTR_SIZE, RESP_ATTR_SIZE,
};
use crate::ssh::{Target, Tunnel};
use crate::transport::ConnState;

pub struct Client {
    tunnel: Tunnel,
}

impl Client {
    /// Spawn the tunnel to `target`, run `remote_command` on the other
    /// side, and wait for the daemon's ready word.
    pub fn dial(target: &Target, remote_command: &str) -> anyhow::Result<Client> {
        let tunnel = Tunnel::open(target, remote_command)?;
        Ok(Client { tunnel })
    }

    pub fn create(&mut self, req: &ReqAttr, pool_attr: &PoolAttr) -> anyhow::Result<RespAttr> {
        let mut buf = Vec::new();
        proto::encode_create(&mut buf, req, pool_attr)?;
        self.send(&buf, "sending the create request")?;

        let payload = self.recv_resp(RESP_ATTR_SIZE, "create")?;
        let resp = RespAttr::read_from(&mut &payload[..])?;
        info!("pool '{}' created, data plane port {}", req.pool_desc, resp.port);
        Ok(resp)
    }

    pub fn open(&mut self, req: &ReqAttr) -> anyhow::Result<(RespAttr, PoolAttr)> {
        let mut buf = Vec::new();
        proto::encode_open(&mut buf, req)?;
        self.send(&buf, "sending the open request")?;

        let payload = self.recv_resp(RESP_ATTR_SIZE + POOL_ATTR_SIZE, "open")?;
        let mut cursor = &payload[..];
        let resp = RespAttr::read_from(&mut cursor)?;
        let pool_attr = PoolAttr::read_from(&mut cursor)?;
        info!("pool '{}' opened, data plane port {}", req.pool_desc, resp.port);
        Ok((resp, pool_attr))
    }

    /// Close the session: tell the daemon, wait for its answer, then wind
    /// the tunnel down and surface how it exited.
    pub fn close(mut self) -> anyhow::Result<()> {
        let mut buf = Vec::new();
        proto::encode_close(&mut buf)?;
        self.send(&buf, "sending the close request")?;
        self.recv_resp(0, "close")?;

        let code = self.tunnel.close()?;
        if code != 0 {
            return Err(anyhow!("tunnel exited with status {}", code));
        }
        Ok(())
    }

    /// Poll liveness of the control channel without consuming bytes.
    pub fn monitor(&self, nonblock: bool) -> io::Result<ConnState> {
        self.tunnel.monitor(nonblock)
    }

    /// Read a status word plus `extra` payload bytes. A non-zero status
    /// turns into an error and the payload is discarded, as it carries no
    /// meaning then.
    fn recv_resp(&mut self, extra: usize, what: &str) -> anyhow::Result<Vec<u8>> {
        let mut buf = vec![0; 4 + extra];
        self.recv(&mut buf, "receiving the response")?;

        let status = Status::from_u32(NetworkEndian::read_u32(&buf[..4]));
        if !status.is_ok() {
            return Err(anyhow!("{} request failed: {}", what, status));
        }
        buf.drain(..4);
        Ok(buf)
    }

    fn send(&mut self, buf: &[u8], what: &str) -> anyhow::Result<()> {
        match self.tunnel.send(buf) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.describe(err, what)),
        }
    }

    fn recv(&mut self, buf: &mut [u8], what: &str) -> anyhow::Result<()> {
        match self.tunnel.recv(buf) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.describe(err, what)),
        }
    }

    /// When the peer vanished, the tunnel's stderr usually says why; pull
    /// that line into the error instead of a bare reset.
    fn describe(&mut self, err: io::Error, what: &str) -> anyhow::Error {
        if err.kind() == io::ErrorKind::ConnectionReset {
            anyhow!("{}: {}", what, self.tunnel.error_line())
        } else {
            anyhow::Error::new(err).context(String::from(what))
        }
    }
}
