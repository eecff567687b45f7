//! Exact-length byte shuttling over a pair of file descriptors.
//!
//! Both ends of the out-of-band channel sit on top of this: the daemon over
//! its own stdin/stdout, the client over the pipes of the tunnel subprocess.
//! The transport moves whole caller-sized buffers and knows nothing about
//! message structure.

use std::io;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd;
use tracing::error;

// see `man ioctl_tty`; FIONREAD reports bytes pending on the read side
nix::ioctl_read_bad!(fionread, libc::FIONREAD, libc::c_int);

/// What `monitor` observed about the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connected,
    Disconnected,
}

#[derive(Debug)]
pub struct Transport {
    fd_in: RawFd,
    fd_out: RawFd,
}

fn connection_reset() -> io::Error {
    io::Error::from_raw_os_error(libc::ECONNRESET)
}

impl Transport {
    /// Build a transport over borrowed descriptors. The caller keeps them
    /// open for the transport's lifetime.
    pub fn new(fd_in: RawFd, fd_out: RawFd) -> Transport {
        Transport { fd_in, fd_out }
    }

    /// Write the whole buffer. A closed peer surfaces as
    /// `ConnectionReset` whether it shows up as `EPIPE` or a zero-length
    /// write.
    pub fn send(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut off = 0;
        while off < buf.len() {
            match unistd::write(self.fd_out, &buf[off..]) {
                Ok(0) => return Err(connection_reset()),
                Ok(n) => off += n,
                Err(Errno::EINTR) => continue,
                Err(Errno::EPIPE) => return Err(connection_reset()),
                Err(e) => return Err(io::Error::from(e)),
            }
        }
        Ok(())
    }

    /// Fill the whole buffer. EOF at any point is `ConnectionReset`.
    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<()> {
        if self.fill(buf)? {
            Ok(())
        } else {
            Err(connection_reset())
        }
    }

    /// Like `recv`, except an EOF arriving before the first byte returns
    /// `Ok(false)` so the caller can treat it as a clean peer shutdown.
    /// EOF mid-buffer is still `ConnectionReset`.
    pub fn recv_or_eof(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        self.fill(buf)
    }

    fn fill(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let mut off = 0;
        while off < buf.len() {
            match unistd::read(self.fd_in, &mut buf[off..]) {
                Ok(0) => {
                    if off == 0 {
                        return Ok(false);
                    }
                    return Err(connection_reset());
                }
                Ok(n) => off += n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e)),
            }
        }
        Ok(true)
    }

    /// Peek at the read side without consuming anything. Bytes sitting on a
    /// quiescent channel mean the peer broke protocol, so that case is
    /// reported as `EPROTO` rather than "connected".
    pub fn monitor(&self, nonblock: bool) -> io::Result<ConnState> {
        let mut fds = [PollFd::new(self.fd_in, PollFlags::POLLIN)];
        let timeout = if nonblock { 0 } else { -1 };
        loop {
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(ConnState::Connected),
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e)),
            }
        }

        let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
        if revents.contains(PollFlags::POLLNVAL) {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        if revents.contains(PollFlags::POLLIN) {
            let mut pending: libc::c_int = 0;
            // Safety: pending is stack allocated and live for the whole
            // call.
            unsafe {
                fionread(self.fd_in, &mut pending).map_err(io::Error::from)?;
            }
            if pending > 0 {
                error!("unexpected data received on a quiescent channel");
                return Err(io::Error::from_raw_os_error(libc::EPROTO));
            }
            // readable with nothing pending is how pipes report EOF
            return Ok(ConnState::Disconnected);
        }
        if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
            return Ok(ConnState::Disconnected);
        }
        Ok(ConnState::Connected)
    }
}

/// Byte-at-a-time adapter so structured decoders can run straight off the
/// transport. EOF comes back as `Ok(0)` here; framing layers decide whether
/// that is a clean close or a reset.
impl io::Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match unistd::read(self.fd_in, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e)),
            }
        }
    }
}

impl io::Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
