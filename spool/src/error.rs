//! Error types for spool.

use spool_common::{DriverError, OptionError};
use thiserror::Error;

/// Main error type for spool operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An option or callback binding was refused.
    #[error("option error: {0}")]
    Option(#[from] OptionError),

    /// The driver refused an operation.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// The scheduler a transfer was bound to no longer exists.
    #[error("scheduler was dropped")]
    SchedulerGone,

    /// The driver is in the middle of a step on this thread.
    #[error("scheduler is busy inside a driver step")]
    Busy,

    /// Configuration could not be loaded.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using spool's Error.
pub type Result<T> = std::result::Result<T, Error>;
