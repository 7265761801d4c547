use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;

use crate::config::LoggingConfig;

pub const LOG_FILE_NAME: &str = "solver.log";

/// Install the global subscriber. Writes to `solver.log` in the configured
/// directory, or to stderr when there is none. Keep the returned guard alive
/// until exit so buffered lines are flushed.
pub fn init_tracing(config: &LoggingConfig) -> Option<WorkerGuard> {
    if !config.enabled {
        return None;
    }

    let builder = tracing_subscriber::fmt()
        .with_target(true)
        .with_max_level(config.max_level());

    match config.directory.as_deref() {
        Some(dir) if fs::create_dir_all(dir).is_ok() => {
            let file_appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(file_appender);
            let subscriber = builder.with_writer(writer).with_ansi(false).finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
            Some(guard)
        }
        _ => {
            let subscriber = builder.with_writer(std::io::stderr).finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
            None
        }
    }
}

/// Human-readable transcript of each exchange, one file per session.
/// Write failures are ignored: the transcript never breaks a solve.
#[derive(Debug, Default)]
pub struct SessionLog {
    path: Option<PathBuf>,
}

impl SessionLog {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Start a transcript when the config asks for one and names a directory.
    pub fn from_config(config: &LoggingConfig) -> Self {
        match config.directory.as_deref() {
            Some(dir) if config.enabled && config.transcript => Self::create(dir),
            _ => Self::disabled(),
        }
    }

    pub fn create(dir: &Path) -> Self {
        let path = (|| {
            fs::create_dir_all(dir).ok()?;
            let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
            let path = dir.join(format!("session_{timestamp}.txt"));

            let mut file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&path)
                .ok()?;
            let header = format!(
                "=== Snapsolve - Session Log ===\nDate: {}\n===============================\n\n",
                Local::now().format("%Y-%m-%d %H:%M:%S")
            );
            file.write_all(header.as_bytes()).ok()?;
            Some(path)
        })();

        Self { path }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one finished exchange.
    pub fn log_exchange(&self, title: &str, images: usize, reply: &str) {
        let Some(path) = &self.path else { return };
        let Ok(mut file) = OpenOptions::new().append(true).open(path) else {
            return;
        };

        let now = Local::now().format("%H:%M:%S");
        let entry = format!("[{now}] {title} ({images} screenshot(s)):\n{reply}\n\n");
        let _ = file.write_all(entry.as_bytes());
    }

    pub fn log_failure(&self, title: &str, message: &str) {
        let Some(path) = &self.path else { return };
        let Ok(mut file) = OpenOptions::new().append(true).open(path) else {
            return;
        };

        let now = Local::now().format("%H:%M:%S");
        let _ = file.write_all(format!("[{now}] {title} failed: {message}\n\n").as_bytes());
    }
}
