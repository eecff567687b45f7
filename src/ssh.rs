//! Client side tunnel supervision.
//!
//! The control channel rides on the stdio of an interactive-shell subprocess
//! (normally ssh). This module builds the argument vector, owns the child
//! and its three pipes, and layers the framed transport over the stdio pair.

use std::env;
use std::io::{self, Read as _};
use std::os::unix::io::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command, Stdio};

use anyhow::{anyhow, Context};
use byteorder::{ByteOrder, NetworkEndian};
use tracing::{error, info};

use crate::consts;
use crate::transport::{ConnState, Transport};

/// Where the tunnel dials.
#[derive(Debug, Clone, Default)]
pub struct Target {
    pub node: String,
    pub user: Option<String>,
    pub service: Option<String>,
    pub ipv4_only: bool,
}

impl Target {
    /// Parse the `[user@]node[:service]` form used on command lines.
    pub fn parse(s: &str) -> anyhow::Result<Target> {
        let (user, rest) = match s.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(String::from(user)), rest),
            Some(_) => return Err(anyhow!("empty user in target '{}'", s)),
            None => (None, s),
        };

        let (node, service) = match rest.rsplit_once(':') {
            Some((node, service)) if !service.is_empty() => {
                (node, Some(String::from(service)))
            }
            Some(_) => return Err(anyhow!("empty service in target '{}'", s)),
            None => (rest, None),
        };

        if node.is_empty() {
            return Err(anyhow!("empty node in target '{}'", s));
        }

        Ok(Target { node: String::from(node), user, service, ipv4_only: false })
    }

    fn user_at_node(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.node),
            None => self.node.clone(),
        }
    }
}

/// Name of the tunnel binary, overridable through the environment.
fn ssh_bin() -> String {
    env::var(consts::SSH_ENV_VAR).unwrap_or_else(|_| String::from(consts::DEFAULT_SSH))
}

/// The argument vector handed to the tunnel binary. Order matters: options
/// must land before the destination and the remote command must come last.
fn tunnel_args(target: &Target, remote_command: &str) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(service) = &target.service {
        args.push(String::from("-p"));
        args.push(service.clone());
    }
    // No pseudo-terminal: the stream carries binary data.
    args.push(String::from("-T"));
    if target.ipv4_only {
        args.push(String::from("-4"));
    }
    // A credential prompt would wedge the pipe, so make it fail instead.
    args.push(String::from("-oBatchMode=yes"));
    args.push(target.user_at_node());
    args.push(String::from(remote_command));
    args
}

/// A running tunnel subprocess plus the framed transport over its stdio.
#[derive(Debug)]
pub struct Tunnel {
    child: Child,
    transport: Transport,
    last_errno: Option<i32>,
}

impl Tunnel {
    /// Launch the tunnel and wait for the daemon's 4-byte ready word.
    pub fn open(target: &Target, remote_command: &str) -> anyhow::Result<Tunnel> {
        let bin = ssh_bin();
        let args = tunnel_args(target, remote_command);
        info!("spawning tunnel: {} {}", bin, args.join(" "));

        let child = Command::new(&bin)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context(format!("spawning tunnel binary '{}'", bin))?;

        let fd_in = child
            .stdout
            .as_ref()
            .ok_or_else(|| anyhow!("tunnel stdout was not piped"))?
            .as_raw_fd();
        let fd_out = child
            .stdin
            .as_ref()
            .ok_or_else(|| anyhow!("tunnel stdin was not piped"))?
            .as_raw_fd();

        let mut tunnel =
            Tunnel { child, transport: Transport::new(fd_in, fd_out), last_errno: None };

        let mut word = [0; 4];
        if let Err(err) = tunnel.recv(&mut word) {
            let cause = tunnel.error_line();
            return Err(anyhow!(err)
                .context(format!("receiving startup status from '{}': {}", target.node, cause)));
        }

        let status = NetworkEndian::read_u32(&word);
        if status != 0 {
            return Err(anyhow!(
                "{}: unexpected status received: {}",
                target.node,
                status
            ));
        }
        info!("received status: {}", status);

        Ok(tunnel)
    }

    pub fn send(&mut self, buf: &[u8]) -> io::Result<()> {
        self.transport.send(buf).map_err(|e| self.record(e))
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.transport.recv(buf).map_err(|e| self.record(e))
    }

    pub fn monitor(&self, nonblock: bool) -> io::Result<ConnState> {
        self.transport.monitor(nonblock)
    }

    fn record(&mut self, err: io::Error) -> io::Error {
        self.last_errno = err.raw_os_error();
        err
    }

    /// One blocking read of the child's stderr, shaped into a single line
    /// suitable for showing to the user as the failure cause.
    pub fn error_line(&mut self) -> String {
        let mut buf = vec![0; consts::ERR_LINE_MAX];
        let nread = match self.child.stderr.as_mut() {
            Some(stderr) => match stderr.read(&mut buf) {
                Ok(n) => n,
                Err(_) => return String::from("reading error string failed"),
            },
            None => 0,
        };

        let text = String::from_utf8_lossy(&buf[..nread]);
        let trimmed = text.trim_end_matches(|c| c == '\r' || c == '\n');
        let line = trimmed.rsplit('\n').next().unwrap_or("").trim_end_matches('\r');
        if !line.is_empty() {
            return String::from(line);
        }

        match self.last_errno {
            Some(errno) => io::Error::from_raw_os_error(errno).to_string(),
            None => String::from("unknown error"),
        }
    }

    /// Ask the child to wind down by closing its stdin, reap it, and map
    /// how it died: 0 for a clean exit, the exit code otherwise, the signal
    /// number if it was killed.
    pub fn close(mut self) -> anyhow::Result<i32> {
        drop(self.child.stdin.take());
        let status = self.child.wait().context("reaping tunnel subprocess")?;

        if let Some(sig) = status.signal() {
            error!("signal received: {}", sig);
            return Ok(sig);
        }
        match status.code() {
            Some(0) => Ok(0),
            Some(code) => {
                error!("exit status: {}", code);
                Ok(code)
            }
            None => Err(anyhow!("tunnel exit state unknown")),
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        // `close` consumes the tunnel on the orderly path; anything still
        // running here is an abandoned child that must not outlive us.
        match self.child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                let _ = self.child.kill();
                let _ = self.child.wait();
            }
        }
    }
}
