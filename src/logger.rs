use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};

static FLUSH: AtomicBool = AtomicBool::new(false);
static LOGGER: LineLogger = LineLogger;

/// Line-oriented stdout sink: one record per line, prefixed with a
/// microsecond local timestamp.
struct LineLogger;

impl Log for LineLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let stdout = io::stdout();
        let mut out = stdout.lock();
        let _ = writeln!(
            out,
            "{} {}",
            Local::now().format("%Y-%b-%d %H:%M:%S%.6f"),
            record.args()
        );
        if FLUSH.load(Ordering::Relaxed) {
            let _ = out.flush();
        }
    }

    fn flush(&self) {
        let _ = io::stdout().flush();
    }
}

/// Installs the stdout line logger. `flush` forces a flush after every
/// line (`-f`).
pub fn init(flush: bool) {
    FLUSH.store(flush, Ordering::Relaxed);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}

/// Writes one line with no timestamp prefix. Used for the periodic
/// reporter's continuation lines between its framing markers.
pub fn plain(line: &str) {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let _ = writeln!(out, "{}", line);
    if FLUSH.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}
