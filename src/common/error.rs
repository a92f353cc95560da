use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while constructing a [`crate::Keydir`].
///
/// Once a keydir is open, individual operations never fail with one of
/// these: `get`/`put`/`remove` report `NOT_FOUND`/`MODIFIED`/`OUT_OF_MEMORY`
/// as plain outcomes (see [`crate::GetOutcome`], [`crate::PutOutcome`]),
/// since those are expected control flow, not exceptional conditions.
#[derive(Error, Debug)]
pub enum KeydirError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("basedir path too long: {basedir:?} exceeds {limit} bytes including the swap file suffix")]
    PathTooLong { basedir: PathBuf, limit: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
