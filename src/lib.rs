//! Building blocks for a remote persistent-memory pool service.
//!
//! The daemon half serves pool create, open and close requests over a
//! control channel carried on its own stdin and stdout, then mirrors client
//! writes into a locally mapped pool file through a high-throughput data
//! plane. The client half launches the tunnel subprocess that carries the
//! control channel and drives the same requests from the other side.

pub mod client;
pub mod consts;
pub mod daemon;
pub mod db;
pub mod fabric;
pub mod logging;
pub mod oob;
pub mod proto;
pub mod ssh;
pub mod transport;
