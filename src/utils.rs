use anyhow::Result;
use chrono::{DateTime, Local};
use log::{LevelFilter, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

// Logging setup and small terminal helpers for the CLI

/// Appends `[time] LEVEL [file:line] message` lines to a log file.
pub struct SimpleLogger {
    log_file: Mutex<File>,
}

impl SimpleLogger {
    pub fn new(log_file_path: &Path) -> Result<Self> {
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file_path)?;
        Ok(SimpleLogger {
            log_file: Mutex::new(log_file),
        })
    }
}

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now: DateTime<Local> = Local::now();
        let line = format!(
            "[{}] {} [{}:{}] {}\n",
            now.format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        );
        if let Ok(mut file) = self.log_file.lock() {
            let _ = file.write_all(line.as_bytes());
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.log_file.lock() {
            let _ = file.flush();
        }
    }
}

/// Read a line of input from stdin, trimming whitespace
pub fn read_line() -> Result<String> {
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

/// File logging when a path is given, otherwise env_logger on stderr (RUST_LOG applies).
pub fn setup_logging(log_file: Option<&Path>, level: LevelFilter) -> Result<()> {
    match log_file {
        Some(path) => {
            let logger = SimpleLogger::new(path)?;
            log::set_boxed_logger(Box::new(logger)).map(|()| log::set_max_level(level))?;
        }
        None => {
            env_logger::Builder::new()
                .filter_level(level)
                .parse_default_env()
                .try_init()?;
        }
    }

    log::info!("Logging initialized at level: {}", level);
    log::info!(
        "App version: {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("CARGO_PKG_NAME")
    );
    Ok(())
}
