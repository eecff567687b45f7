//! Daemon startup and teardown.
//!
//! The out-of-band endpoint is brought up before anything else so that even
//! the earliest startup failure can still push a non-zero status word back
//! through the tunnel to the waiting client.

use std::io;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context};
use tracing::{error, info};

use crate::db::{self, Db};
use crate::fabric::PersistFn;
use crate::logging;
use crate::oob::Oob;

pub mod config;
pub mod session;

use config::Config;
use session::Session;

/// Command line settings layered over the config file.
#[derive(Debug, Default, Clone)]
pub struct Options {
    pub config_file: Option<String>,
    pub poolset_dir: Option<String>,
    pub persist_apm: bool,
    pub use_syslog: bool,
    pub log_file: Option<String>,
    pub verbose: u8,
}

pub fn run(opts: Options) -> anyhow::Result<()> {
    let mut oob = Oob::stdio();

    match startup(&opts) {
        Ok((db, config, nthreads)) => {
            info!("\n\n======================== STARTING DAEMON ============================\n\n");
            let persist: PersistFn = Arc::new(db::persist);
            let mut session = Session::new(oob, db, config, persist, nthreads);
            session.run()
        }
        Err(err) => {
            let errno = startup_errno(&err);
            if let Err(status_err) = oob.status(errno as u32) {
                error!("writing the startup status failed: {:?}", status_err);
            }
            Err(err)
        }
    }
}

fn startup(opts: &Options) -> anyhow::Result<(Db, Config, usize)> {
    let mut config = config::read_config(&opts.config_file).context("reading configuration")?;
    if let Some(dir) = &opts.poolset_dir {
        config.poolset_dir = Some(dir.clone());
    }
    if opts.persist_apm {
        config.persist_apm = Some(true);
    }
    if opts.use_syslog {
        config.use_syslog = Some(true);
    }
    if let Some(path) = &opts.log_file {
        config.log_file = Some(path.clone());
    }

    let level = match (opts.verbose, &config.log_level) {
        (1, _) => tracing::Level::DEBUG,
        (v, _) if v >= 2 => tracing::Level::TRACE,
        (_, Some(level)) => logging::parse_level(level)?,
        (_, None) => tracing::Level::INFO,
    };
    logging::init(level, config.log_file.as_deref(), config.use_syslog.unwrap_or(false))
        .context("logging subsystem initialization")?;

    let nthreads = thread::available_parallelism()
        .context("getting the number of online CPUs")?
        .get();

    let dir = config
        .poolset_dir
        .clone()
        .ok_or_else(|| anyhow!("no pool set directory configured"))?;
    let db = Db::new(&dir, 0o666).context("pool set db initialization")?;

    Ok((db, config, nthreads))
}

/// Dig the first raw OS error out of the chain; that is what rides in the
/// startup status word. Anything without one reports as an I/O error.
fn startup_errno(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if let Some(errno) = io_err.raw_os_error() {
                return errno;
            }
        }
    }
    libc::EIO
}
