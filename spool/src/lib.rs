//! Spool Library
//!
//! Runs many concurrent transfers of a multiplexed, callback-driven transfer
//! engine inside a single-threaded tokio event loop.
//!
//! - [`Scheduler`] owns the engine's multiplexer, watches the sockets it asks
//!   for, drives its timer and delivers finished-transfer messages
//! - [`Transfer`] owns one engine handle, its options, request headers and
//!   data closures, and raises [`TransferEvent`]s
//!
//! The engine is abstracted behind [`Driver`](spool_common::Driver); the
//! `curl` feature provides a libcurl backend in [`libcurl`].

pub mod config;
pub mod error;
#[cfg(feature = "curl")]
pub mod libcurl;
pub mod logging;
pub mod scheduler;
pub mod transfer;

pub use config::SchedulerConfig;
pub use error::{Error, Result};
pub use scheduler::{Scheduler, SchedulerEvent};
pub use transfer::{AbortHandle, Transfer, TransferEvent, TransferState};

pub use spool_common::{
    DriverError, DriverSettings, EngineOption, EventMask, OptionError, OptionValue, Progress,
    ReadError, ResultCode, SeekResult, Socket, SocketInterest, Token,
};
