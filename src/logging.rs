//! Log sink selection: a file when configured, syslog when asked for,
//! stderr otherwise.

use std::fs;
use std::io::{self, Write};
use std::process;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use tracing_subscriber::fmt::MakeWriter;

pub fn parse_level(level: &str) -> anyhow::Result<tracing::Level> {
    match level {
        "error" => Ok(tracing::Level::ERROR),
        "warn" => Ok(tracing::Level::WARN),
        "info" => Ok(tracing::Level::INFO),
        "debug" => Ok(tracing::Level::DEBUG),
        "trace" => Ok(tracing::Level::TRACE),
        level => Err(anyhow!("unknown log level '{}'", level)),
    }
}

/// Install the global subscriber. Call once, early in startup.
pub fn init(
    level: tracing::Level,
    log_file: Option<&str>,
    use_syslog: bool,
) -> anyhow::Result<()> {
    if let Some(log_file) = log_file {
        let file = fs::File::create(log_file)
            .context(format!("creating log file '{}'", log_file))?;
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_thread_ids(true)
            .with_target(false)
            .with_writer(Mutex::new(file))
            .init();
    } else if use_syslog {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process: String::from("rpmemd"),
            pid: process::id(),
        };
        let logger: UnixLogger =
            syslog::unix(formatter).map_err(|e| anyhow!("connecting to syslog: {}", e))?;
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .with_ansi(false)
            .without_time()
            .with_writer(SyslogMakeWriter::new(logger))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_thread_ids(true)
            .with_target(false)
            .with_writer(io::stderr)
            .init();
    }

    Ok(())
}

type UnixLogger = syslog::Logger<syslog::LoggerBackend, syslog::Formatter3164>;

/// Bridges the fmt layer to syslog: each formatted record is buffered and
/// shipped line by line when the writer is dropped at the end of the event.
struct SyslogMakeWriter {
    logger: Arc<Mutex<UnixLogger>>,
}

impl SyslogMakeWriter {
    fn new(logger: UnixLogger) -> SyslogMakeWriter {
        SyslogMakeWriter { logger: Arc::new(Mutex::new(logger)) }
    }
}

impl<'a> MakeWriter<'a> for SyslogMakeWriter {
    type Writer = SyslogWriter;

    fn make_writer(&'a self) -> SyslogWriter {
        SyslogWriter { logger: Arc::clone(&self.logger), buf: Vec::new() }
    }
}

struct SyslogWriter {
    logger: Arc<Mutex<UnixLogger>>,
    buf: Vec<u8>,
}

impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogWriter {
    fn drop(&mut self) {
        let text = String::from_utf8_lossy(&self.buf);
        // unwrap to propagate lock poisoning as an unwind
        let mut logger = self.logger.lock().unwrap();
        for line in text.lines() {
            if !line.is_empty() {
                let _ = logger.info(line.to_string());
            }
        }
    }
}
