mod config;
mod common;
mod entry;
mod fstats;
mod hash;
mod iter;
mod keydir;
mod page;

use std::fs;
use std::path;

use tracing_subscriber::prelude::*;

pub use common::KeydirError;
pub use entry::{Entry, PutEntry};
pub use fstats::{FileStats, FstatsDelta};
pub use keydir::{GetOutcome, Keydir, KeydirOptions, PutOutcome};

/// Initializes the global `tracing` subscriber: a colored layer on stdout
/// plus a daily-rolling, non-blocking file layer under `config::LOG_PATH`.
/// A no-op if a subscriber is already installed (e.g. by the consuming
/// application), rather than panicking on the global registry.
pub fn init_log() {
    let log_dir = path::Path::new(config::LOG_PATH).parent().unwrap();
    let log_filename = path::Path::new(config::LOG_PATH)
        .file_name()
        .unwrap()
        .to_str()
        .unwrap();
    fs::create_dir_all(log_dir).unwrap();

    let stdout_log = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_thread_names(true)
        .with_level(true);

    let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    Box::leak(Box::new(guard));

    let file_log = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_thread_names(true)
        .with_level(true);

    let result = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config::LOG_LEVEL))
        .with(stdout_log)
        .with(file_log)
        .try_init();
    if let Err(e) = result {
        tracing::warn!(error = %e, "init_log: a tracing subscriber is already installed, skipping");
    }
}
