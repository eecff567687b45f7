//! The per-session state machine.
//!
//! One session per process: requests arrive on the out-of-band channel one
//! at a time, and the controller walks the pool database and the fabric
//! through their lifecycles in a fixed order. The cleanup rules differ per
//! flow and per step; they are encoded here as scoped ownership of the
//! `Option<Fabric>` and `Option<Pool>` slots.

use std::env;
use std::io;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tracing::{error, info};

use crate::db::{Db, Pool};
use crate::fabric::{Fabric, FabricAttr, PersistFn};
use crate::oob::Oob;
use crate::proto::{
    uuid_to_string, PersistMethod, PoolAttr, ReqAttr, Request, RespAttr, Status,
};

use super::config::Config;

/// What one trip through the session loop produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Processed,
    PeerClosed,
}

pub struct Session {
    oob: Oob,
    db: Db,
    // the fabric writes into the pool mapping, so it is declared first
    // and always torn down before the pool it borrows from
    fabric: Option<Fabric>,
    pool: Option<Pool>,
    config: Config,
    nthreads: usize,
    persist_method: PersistMethod,
    persist: PersistFn,
    closing: bool,
}

/// Translate an OS error at the pool database boundary into a protocol
/// status. Anything not explicitly listed collapses to fatal.
fn db_status(err: &io::Error) -> Status {
    match err.raw_os_error() {
        Some(libc::EEXIST) => Status::Exists,
        Some(libc::EACCES) => Status::NoAccess,
        Some(libc::ENOENT) => Status::NoExist,
        Some(libc::EWOULDBLOCK) => Status::Busy,
        _ => Status::Fatal,
    }
}

impl Session {
    pub fn new(oob: Oob, db: Db, config: Config, persist: PersistFn, nthreads: usize) -> Session {
        let persist_method = if config.persist_apm.unwrap_or(false) {
            PersistMethod::Apm
        } else {
            PersistMethod::Gpspm
        };

        Session {
            oob,
            db,
            fabric: None,
            pool: None,
            config,
            nthreads,
            persist_method,
            persist,
            closing: false,
        }
    }

    /// Write the ready word and serve requests until the session winds
    /// down, the peer closes, or the channel fails.
    pub fn run(&mut self) -> anyhow::Result<()> {
        self.oob.status(0).context("writing the ready status")?;
        self.log_info();

        loop {
            match self.process_one().context("out-of-band connection process failed")? {
                Step::PeerClosed => {
                    info!("out-of-band connection closed by peer");
                    break;
                }
                Step::Processed => {
                    if self.closing {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Receive one request and dispatch it.
    pub fn process_one(&mut self) -> anyhow::Result<Step> {
        match self.oob.recv_request().context("receiving a request")? {
            None => Ok(Step::PeerClosed),
            Some(Request::Create { req, pool_attr }) => {
                self.handle_create(req, pool_attr)?;
                Ok(Step::Processed)
            }
            Some(Request::Open { req }) => {
                self.handle_open(req)?;
                Ok(Step::Processed)
            }
            Some(Request::Close) => {
                self.handle_close()?;
                Ok(Step::Processed)
            }
        }
    }

    pub fn closing(&self) -> bool {
        self.closing
    }

    fn handle_create(&mut self, req: ReqAttr, pool_attr: PoolAttr) -> anyhow::Result<()> {
        info!("create request:");
        log_req_attr(&req);
        info!("pool attributes:");
        log_pool_attr(&pool_attr);

        if self.pool.is_some() {
            error!("pool already opened");
            return self.fail_create(Status::Fatal);
        }

        match self.db.create(&req.pool_desc, req.pool_size, &pool_attr) {
            Ok(pool) => self.pool = Some(pool),
            Err(err) => {
                error!("creating pool '{}': {}", req.pool_desc, err);
                return self.fail_create(db_status(&err));
            }
        }

        if let Err(status) = self.check_pool(&req) {
            self.drop_pool();
            self.remove_pool(&req.pool_desc);
            return self.fail_create(status);
        }

        let (fabric, resp) = match self.fabric_init(&req) {
            Ok(v) => v,
            Err(err) => {
                error!("initializing the fabric: {:?}", err);
                self.drop_pool();
                self.remove_pool(&req.pool_desc);
                return self.fail_create(Status::Fatal);
            }
        };
        self.fabric = Some(fabric);

        info!("create request response (status = {})", Status::Ok.to_u32());
        log_resp_attr(&resp);
        if let Err(err) = self.oob.create_resp(Status::Ok, &resp) {
            self.fabric = None;
            self.drop_pool();
            self.remove_pool(&req.pool_desc);
            self.closing = true;
            return Err(err).context("sending the create response");
        }

        self.start_data_plane();
        Ok(())
    }

    fn handle_open(&mut self, req: ReqAttr) -> anyhow::Result<()> {
        info!("open request:");
        log_req_attr(&req);

        let mut pool_attr = PoolAttr::default();

        if self.pool.is_some() {
            error!("pool already opened");
            return self.fail_open(Status::Fatal, &pool_attr);
        }

        match self.db.open(&req.pool_desc, &mut pool_attr) {
            Ok(pool) => self.pool = Some(pool),
            Err(err) => {
                error!("opening pool '{}': {}", req.pool_desc, err);
                return self.fail_open(db_status(&err), &pool_attr);
            }
        }

        info!("pool attributes:");
        log_pool_attr(&pool_attr);

        if let Err(status) = self.check_pool(&req) {
            self.drop_pool();
            return self.fail_open(status, &pool_attr);
        }

        let (fabric, resp) = match self.fabric_init(&req) {
            Ok(v) => v,
            Err(err) => {
                error!("initializing the fabric: {:?}", err);
                self.drop_pool();
                return self.fail_open(Status::Fatal, &pool_attr);
            }
        };
        self.fabric = Some(fabric);

        info!("open request response (status = {})", Status::Ok.to_u32());
        log_resp_attr(&resp);
        if let Err(err) = self.oob.open_resp(Status::Ok, &resp, &pool_attr) {
            self.fabric = None;
            self.drop_pool();
            self.closing = true;
            return Err(err).context("sending the open response");
        }

        self.start_data_plane();
        Ok(())
    }

    fn handle_close(&mut self) -> anyhow::Result<()> {
        info!("close request");
        self.closing = true;

        if self.pool.is_none() {
            error!("pool not opened");
            return self
                .oob
                .close_resp(Status::Fatal)
                .context("sending the close response");
        }
        self.drop_pool();

        let mut status = Status::Ok;
        if let Some(fabric) = self.fabric.as_mut() {
            if let Err(err) = fabric.process_stop() {
                error!("stopping in-band processing failed: {}", err);
                status = Status::Errno(err.raw_os_error().unwrap_or(libc::EIO) as u32);
            }
        }

        info!("close request response (status = {})", status.to_u32());
        let sent = self.oob.close_resp(status);

        if sent.is_ok() {
            if let Some(fabric) = self.fabric.as_ref() {
                if let Err(err) = fabric.wait_close(None) {
                    error!("waiting for the data plane to close: {:?}", err);
                }
            }
        }

        if let Some(mut fabric) = self.fabric.take() {
            if let Err(err) = fabric.close() {
                error!("closing the fabric: {:?}", err);
            }
        }

        sent.context("sending the close response")?;
        Ok(())
    }

    /// A failed create leaves nothing behind: whatever was built so far has
    /// already been unwound by the caller, this sends the verdict and ends
    /// the session.
    fn fail_create(&mut self, status: Status) -> anyhow::Result<()> {
        let sent = self.oob.create_resp(status, &RespAttr::default());
        self.closing = true;
        sent.context("sending the create response")?;
        Ok(())
    }

    fn fail_open(&mut self, status: Status, pool_attr: &PoolAttr) -> anyhow::Result<()> {
        let sent = self.oob.open_resp(status, &RespAttr::default(), pool_attr);
        self.closing = true;
        sent.context("sending the open response")?;
        Ok(())
    }

    /// The request is only valid if the usable region can hold it.
    fn check_pool(&self, req: &ReqAttr) -> Result<(), Status> {
        let pool = self.pool.as_ref().ok_or(Status::Fatal)?;
        if pool.usable_size() < req.pool_size {
            error!(
                "requested size {} exceeds the usable {} bytes",
                req.pool_size,
                pool.usable_size()
            );
            return Err(Status::BadSize);
        }
        Ok(())
    }

    fn fabric_init(&mut self, req: &ReqAttr) -> anyhow::Result<(Fabric, RespAttr)> {
        let pool = self.pool.as_mut().ok_or_else(|| anyhow!("no pool open"))?;
        let attr = FabricAttr {
            addr: pool.usable_base(),
            size: req.pool_size,
            nlanes: req.nlanes,
            nthreads: self.nthreads,
            provider: req.provider,
            persist_method: self.persist_method,
            persist: Arc::clone(&self.persist),
        };
        Fabric::init(None, attr)
    }

    /// Steps (f) and (g): accept the in-band peer and start processing.
    /// The response is already on the wire, so failures here only log the
    /// connection status, unwind, and end the session; the backing file is
    /// the client's now and stays.
    fn start_data_plane(&mut self) {
        let ok = match self.fabric.as_mut() {
            Some(fabric) => {
                info!("waiting for in-band connection");
                match fabric.accept() {
                    Err(err) => {
                        error!(
                            "in-band accept failed (status = {}): {:?}",
                            Status::FatalConn.to_u32(),
                            err
                        );
                        false
                    }
                    Ok(()) => {
                        info!("in-band connection established");
                        match fabric.process_start() {
                            Err(err) => {
                                error!(
                                    "starting in-band processing failed (status = {}): {:?}",
                                    Status::FatalConn.to_u32(),
                                    err
                                );
                                if let Err(err) = fabric.close() {
                                    error!("closing the fabric: {:?}", err);
                                }
                                false
                            }
                            Ok(()) => true,
                        }
                    }
                }
            }
            None => false,
        };

        if !ok {
            self.fabric = None;
            self.drop_pool();
            self.closing = true;
        }
    }

    fn drop_pool(&mut self) {
        if let Some(pool) = self.pool.take() {
            self.db.close(pool);
        }
    }

    fn remove_pool(&mut self, desc: &str) {
        if let Err(err) = self.db.remove(desc) {
            error!("removing pool '{}': {}", desc, err);
        }
    }

    fn log_info(&self) {
        info!(
            "ssh connection: {}",
            env::var("SSH_CONNECTION").unwrap_or_else(|_| String::from("(none)"))
        );
        info!("user: {}", env::var("USER").unwrap_or_else(|_| String::from("(none)")));
        info!("configuration:");
        info!(
            "\tpool set directory: '{}'",
            self.config.poolset_dir.as_deref().unwrap_or("(none)")
        );
        info!("\tpersist method: {:?}", self.persist_method);
        info!("\tnumber of threads: {}", self.nthreads);
    }
}

fn log_req_attr(req: &ReqAttr) {
    info!("\tpool descriptor: '{}'", req.pool_desc);
    info!("\tpool size: {}", req.pool_size);
    info!("\tnlanes: {}", req.nlanes);
    info!("\tprovider: {:?}", req.provider);
}

fn log_pool_attr(attr: &PoolAttr) {
    info!("\tsignature: '{}'", String::from_utf8_lossy(&attr.signature));
    info!("\tmajor: {}", attr.major);
    info!("\tcompat features: {:#x}", attr.compat_features);
    info!("\tincompat features: {:#x}", attr.incompat_features);
    info!("\tro compat features: {:#x}", attr.ro_compat_features);
    info!("\tpoolset uuid: {}", uuid_to_string(&attr.poolset_uuid));
    info!("\tuuid: {}", uuid_to_string(&attr.uuid));
    info!("\tprev uuid: {}", uuid_to_string(&attr.prev_uuid));
    info!("\tnext uuid: {}", uuid_to_string(&attr.next_uuid));
}

fn log_resp_attr(resp: &RespAttr) {
    info!("\tport: {}", resp.port);
    info!("\trkey: {:#x}", resp.rkey);
    info!("\traddr: {:#x}", resp.raddr);
    info!("\tnlanes: {}", resp.nlanes);
    info!("\tpersist method: {:?}", resp.persist_method);
}
