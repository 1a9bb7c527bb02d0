use std::{path::PathBuf, sync::Mutex};

use tokio::sync::RwLock;
use tracing::Level;
use tracing::{debug, info, metadata::LevelFilter, trace};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{prelude::*, EnvFilter};

// Lines written to the log file are buffered until this is dropped.
static FILE_GUARD: Mutex<Option<WorkerGuard>> = Mutex::new(None);

fn do_init(stdout_level: Level, file_level: Option<(Level, PathBuf)>) {
    let mut message = String::from("Logging with:");

    // stdout, `RUST_LOG` wins over the given level if set
    let stdout_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => {
            message += " stdout (from RUST_LOG)";
            filter
        }
        Err(_) => {
            message += " stdout";
            EnvFilter::new(stdout_level.to_string())
        }
    };

    let stdout_layer = tracing_subscriber::fmt::layer().with_filter(stdout_filter);

    let registry = tracing_subscriber::registry().with(stdout_layer);

    let maybe_file_layer = if let Some((level, output_dir)) = file_level {
        message += &format!(", file (in dir {output_dir:?})");

        let file_appender = RollingFileAppender::new(Rotation::DAILY, output_dir, "sms-gateway.log");
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
        *FILE_GUARD.lock().unwrap_or_else(|e| e.into_inner()) = Some(guard);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_filter(LevelFilter::from(level));
        Some(file_layer)
    } else {
        None
    };

    // Another subscriber may already be set, e.g. by a test harness.
    if registry.with(maybe_file_layer).try_init().is_err() {
        message += " (a global subscriber was already set)";
    }

    debug!(message);
}

/// Initialize tracing.
///
/// Will only initialize once, so tests may call this.
pub async fn init(stdout_level: Level, file_logging: Option<(Level, PathBuf)>) {
    static TRACING_IS_INITIALIZED: RwLock<bool> = RwLock::const_new(false);

    let initialized = { *TRACING_IS_INITIALIZED.read().await };

    if !initialized {
        let mut initialized = TRACING_IS_INITIALIZED.write().await;

        // To avoid race condition between the `.read()` and the
        // `.write()`.
        if *initialized {
            return;
        }

        do_init(stdout_level, file_logging);

        *initialized = true;
    }

    info!("Logging initialized");
}

/// Called right before exiting.
///
/// Flushes the log file, if there is one.
/// Nothing is written to it afterwards.
pub fn shutdown() {
    trace!("Shutting down");

    let guard = FILE_GUARD.lock().unwrap_or_else(|e| e.into_inner()).take();
    drop(guard);
}
