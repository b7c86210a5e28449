use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Log file kept in every observation directory
pub const LOG_FILE_NAME: &str = "acquire.log";

/// Logs to stdout and appends to `acquire.log` in `dir`
pub fn init(dir: &Path, level: Level) -> io::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE_NAME))?;

    tracing_subscriber::registry()
        .with(LevelFilter::from_level(level))
        .with(fmt::layer().with_thread_names(true))
        .with(
            fmt::layer()
                .with_thread_names(true)
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}
