//! Spool Common Library
//!
//! Engine contract shared by the spool scheduler and the transfer engine
//! backends: identifiers, socket interest and readiness types, option and
//! result codes, the driver/handle traits, and the request header codec.

pub mod engine;
pub mod headers;
mod options;
mod result;

pub use engine::{
    ActionTarget, Callback, CallbackSlot, CallbackTable, Completion, Driver, DriverError,
    DriverHooks, DriverRequest, DriverSettings, EngineHandle, EventMask, HeaderFn, Progress,
    ProgressFn, ReadError, ReadFn, SeekFn, SeekResult, Socket, SocketInterest, SocketToken, Token,
    WriteFn,
};
pub use headers::HeaderMap;
pub use options::{EngineOption, OptionError, OptionValue, ValueKind};
pub use result::ResultCode;

/// Largest timer the engine may request, in milliseconds
///
/// Engine timeouts beyond this are clamped; the host loop's timer is not
/// expected to handle longer single waits.
pub const MAX_TIMER_MS: u64 = i32::MAX as u64;
