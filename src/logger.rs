//! [`log`] facade backend.
//!
//! The crate logs through the standard `log` macros everywhere; this module
//! provides the sink installed at startup. Three config keys drive it:
//! `log.level` (off/error/warn/info/debug/trace), `log.target` (a
//! comma-separated list containing `stdout` and/or a file path) and
//! `log.sync` (flush after every record).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::clock;
use crate::config::Config;
use crate::error::{Error, Result};

struct SinkLogger {
    level: LevelFilter,
    sync: bool,
    stdout: bool,
    file: Option<Mutex<File>>,
}

impl SinkLogger {
    fn format(record: &Record) -> String {
        let now = clock::realtime_secs();
        format!(
            "{} {:5} [{}] {}\n",
            now,
            record.level(),
            record.target(),
            record.args()
        )
    }
}

impl Log for SinkLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = Self::format(record);
        if self.stdout {
            let out = std::io::stdout();
            let mut out = out.lock();
            let _ = out.write_all(line.as_bytes());
            if self.sync {
                let _ = out.flush();
            }
        }
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap();
            let _ = file.write_all(line.as_bytes());
            if self.sync {
                let _ = file.sync_data();
            }
        }
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
        if let Some(file) = &self.file {
            let _ = file.lock().unwrap().sync_data();
        }
    }
}

fn parse_level(s: &str) -> LevelFilter {
    match s.to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        other => {
            eprintln!("unknown log level {:?}, defaulting to info", other);
            LevelFilter::Info
        }
    }
}

/// Build the sink from config and install it. May only succeed once per
/// process; a second call reports the `log` crate's error as
/// [`Error::ConfigInvalid`].
pub fn init(cfg: &Config) -> Result<()> {
    let level = parse_level(&cfg.lookup_str("log.level", "info"));
    let sync = cfg.lookup::<bool>("log.sync", true);
    let target = cfg.lookup_str("log.target", "stdout");

    let mut stdout = false;
    let mut file = None;
    for part in target.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if part == "stdout" {
            stdout = true;
        } else {
            let f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(part)
                .map_err(|e| Error::ConfigInvalid(format!("log.target {}: {}", part, e)))?;
            file = Some(Mutex::new(f));
        }
    }

    let logger = SinkLogger {
        level,
        sync,
        stdout,
        file,
    };
    log::set_logger(Box::leak(Box::new(logger)))
        .map_err(|e| Error::ConfigInvalid(format!("logger already installed: {}", e)))?;
    log::set_max_level(level);
    Ok(())
}

/// Level at which datagram hex dumps are produced by the UDP service.
pub const DUMP_LEVEL: Level = Level::Debug;

/// Render a buffer as the 16-bytes-per-line hex dump used in debug logs.
pub fn hex_dump(buf: &[u8]) -> String {
    let mut out = String::with_capacity(buf.len() * 5 + buf.len() / 16 * 2 + 2);
    for (i, b) in buf.iter().enumerate() {
        if i % 16 == 0 {
            out.push_str("\n\t");
        }
        out.push_str(&format!("{:02x} ", b));
    }
    out
}
