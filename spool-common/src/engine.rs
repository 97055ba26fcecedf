//! Transfer engine contract
//!
//! The engine is an external library that performs the protocol work. It is
//! split in two halves:
//!
//! - [`EngineHandle`]: one transfer's configuration and callback slots
//! - [`Driver`]: the multiplexed, non-blocking coordinator keyed by socket
//!   descriptors and a single timeout
//!
//! The driver asks its owner to watch sockets and to arm a timer through
//! [`DriverHooks`]. Requests are queued rather than delivered in-line because
//! they arrive while the driver is in the middle of a call; the owner applies
//! them once the call returns.
//!
//! Engine callbacks are plain function pointers plus a [`Token`], mirroring an
//! engine API with no closure support. [`CallbackTable`] stores the bound
//! pointers for backends and applies the default behavior for unbound slots.

use std::collections::VecDeque;
use std::fmt;
use std::io::SeekFrom;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{EngineOption, OptionError, OptionValue, ResultCode};

// =============================================================================
// Identifiers
// =============================================================================

/// Socket descriptor as seen by the engine
pub type Socket = RawFd;

/// Opaque per-transfer correlation token
///
/// Stored on the engine handle so callbacks and finished-transfer messages can
/// be routed back to the owning transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(u64);

impl Token {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque per-socket correlation token assigned by the driver's owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketToken(u64);

impl SocketToken {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

// =============================================================================
// Socket interest and events
// =============================================================================

/// Interest change requested by the driver for one socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketInterest {
    /// Keep the socket registered but watch nothing
    None,
    /// Watch for readability only
    In,
    /// Watch for writability only
    Out,
    /// Watch for both
    InOut,
    /// Stop watching and forget the socket
    Remove,
}

impl SocketInterest {
    pub fn wants_read(&self) -> bool {
        matches!(self, Self::In | Self::InOut)
    }

    pub fn wants_write(&self) -> bool {
        matches!(self, Self::Out | Self::InOut)
    }
}

/// Readiness bits passed to [`Driver::socket_action`]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u8);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const IN: EventMask = EventMask(1);
    pub const OUT: EventMask = EventMask(2);
    pub const ERR: EventMask = EventMask(4);

    pub fn contains(&self, other: EventMask) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let names: Vec<&str> = [(Self::IN, "IN"), (Self::OUT, "OUT"), (Self::ERR, "ERR")]
            .into_iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| name)
            .collect();
        f.write_str(&names.join("|"))
    }
}

/// What a driver action is performed for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionTarget {
    /// A watched socket became ready
    Socket(Socket),
    /// The shared timer expired
    Timeout,
}

/// A finished transfer reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub token: Token,
    pub result: ResultCode,
}

// =============================================================================
// Driver hooks
// =============================================================================

/// Request made by the driver to its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverRequest {
    /// Create, change or remove interest in a socket
    ///
    /// `token` is the value previously passed to [`Driver::assign`] for this
    /// socket, if any.
    Socket {
        socket: Socket,
        interest: SocketInterest,
        token: Option<SocketToken>,
    },
    /// Re-arm (`Some`) or disarm (`None`) the shared timer
    Timer(Option<Duration>),
}

/// Queue through which the driver talks back to its owner
///
/// Cloned into the engine's socket and timer callbacks. The queue is behind a
/// mutex because engine callbacks may be required to be `Send`; it is only
/// ever touched from the owning thread.
#[derive(Debug, Clone, Default)]
pub struct DriverHooks {
    queue: Arc<Mutex<VecDeque<DriverRequest>>>,
}

impl DriverHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Socket-interest-change callback
    pub fn socket(&self, socket: Socket, interest: SocketInterest, token: Option<SocketToken>) {
        self.push(DriverRequest::Socket {
            socket,
            interest,
            token,
        });
    }

    /// Timer-change callback
    pub fn timer(&self, timeout: Option<Duration>) {
        self.push(DriverRequest::Timer(timeout));
    }

    /// Take every queued request, oldest first
    pub fn drain(&self) -> Vec<DriverRequest> {
        self.queue
            .lock()
            .expect("driver hook queue poisoned")
            .drain(..)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue
            .lock()
            .expect("driver hook queue poisoned")
            .is_empty()
    }

    fn push(&self, request: DriverRequest) {
        self.queue
            .lock()
            .expect("driver hook queue poisoned")
            .push_back(request);
    }
}

/// Driver-wide tuning, applied when the driver is opened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverSettings {
    /// Cap on simultaneously open connections (unlimited if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_total_connections: Option<u32>,

    /// Cap on connections to a single host (unlimited if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_host_connections: Option<u32>,

    /// Size of the idle connection cache (engine default if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connects: Option<u32>,

    /// Multiplex transfers over a shared connection when the protocol allows
    #[serde(default = "default_multiplex")]
    pub multiplex: bool,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            max_total_connections: None,
            max_host_connections: None,
            max_connects: None,
            multiplex: default_multiplex(),
        }
    }
}

fn default_multiplex() -> bool {
    true
}

/// Driver-level failure not tied to a single transfer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// The driver or a handle could not be created
    #[error("engine initialization failed: {0}")]
    Init(String),

    /// The socket is unknown to the driver
    #[error("bad socket {0}")]
    BadSocket(Socket),

    /// The handle is not attached to this driver
    #[error("handle {0} is not attached to this driver")]
    NotAttached(Token),

    /// The engine reported a failure
    #[error("engine driver error {code}: {message}")]
    Engine { code: i32, message: String },
}

// =============================================================================
// Callbacks
// =============================================================================

/// Upload data source failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// Abort the transfer
    Abort,
    /// Pause the transfer until it is resumed
    Pause,
}

/// Outcome of a seek request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekResult {
    Ok,
    Fail,
    /// The source cannot seek; the engine may work around it
    CantSeek,
}

/// Transfer progress counters in bytes (totals are 0 when unknown)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub download_total: u64,
    pub download_now: u64,
    pub upload_total: u64,
    pub upload_now: u64,
}

pub type ReadFn = fn(Token, &mut [u8]) -> Result<usize, ReadError>;
pub type WriteFn = fn(Token, &[u8]) -> usize;
pub type HeaderFn = fn(Token, &[u8]) -> usize;
pub type SeekFn = fn(Token, SeekFrom) -> SeekResult;
/// Returns false to abort the transfer
pub type ProgressFn = fn(Token, Progress) -> bool;

/// Low-level callback entry point for one slot
#[derive(Debug, Clone, Copy)]
pub enum Callback {
    Read(ReadFn),
    Write(WriteFn),
    Header(HeaderFn),
    Seek(SeekFn),
    Progress(ProgressFn),
}

impl Callback {
    pub fn slot(&self) -> CallbackSlot {
        match self {
            Self::Read(_) => CallbackSlot::Read,
            Self::Write(_) => CallbackSlot::Write,
            Self::Header(_) => CallbackSlot::Header,
            Self::Seek(_) => CallbackSlot::Seek,
            Self::Progress(_) => CallbackSlot::Progress,
        }
    }
}

/// Callback slot of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CallbackSlot {
    Read,
    Write,
    Header,
    Seek,
    Progress,
}

impl CallbackSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Header => "header",
            Self::Seek => "seek",
            Self::Progress => "progress",
        }
    }
}

impl fmt::Display for CallbackSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bound callback entry points of one handle
///
/// Unbound slots fall back to the engine defaults: accept all written bytes,
/// signal end of upload data, refuse to seek, keep going on progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallbackTable {
    read: Option<(ReadFn, Token)>,
    write: Option<(WriteFn, Token)>,
    header: Option<(HeaderFn, Token)>,
    seek: Option<(SeekFn, Token)>,
    progress: Option<(ProgressFn, Token)>,
}

impl CallbackTable {
    pub fn bind(&mut self, callback: Callback, token: Token) {
        match callback {
            Callback::Read(f) => self.read = Some((f, token)),
            Callback::Write(f) => self.write = Some((f, token)),
            Callback::Header(f) => self.header = Some((f, token)),
            Callback::Seek(f) => self.seek = Some((f, token)),
            Callback::Progress(f) => self.progress = Some((f, token)),
        }
    }

    pub fn unbind(&mut self, slot: CallbackSlot) {
        match slot {
            CallbackSlot::Read => self.read = None,
            CallbackSlot::Write => self.write = None,
            CallbackSlot::Header => self.header = None,
            CallbackSlot::Seek => self.seek = None,
            CallbackSlot::Progress => self.progress = None,
        }
    }

    pub fn is_bound(&self, slot: CallbackSlot) -> bool {
        match slot {
            CallbackSlot::Read => self.read.is_some(),
            CallbackSlot::Write => self.write.is_some(),
            CallbackSlot::Header => self.header.is_some(),
            CallbackSlot::Seek => self.seek.is_some(),
            CallbackSlot::Progress => self.progress.is_some(),
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, ReadError> {
        match self.read {
            Some((f, token)) => f(token, buf),
            None => Ok(0),
        }
    }

    pub fn write(&self, data: &[u8]) -> usize {
        match self.write {
            Some((f, token)) => f(token, data),
            None => data.len(),
        }
    }

    pub fn header(&self, data: &[u8]) -> usize {
        match self.header {
            Some((f, token)) => f(token, data),
            None => data.len(),
        }
    }

    pub fn seek(&self, target: SeekFrom) -> SeekResult {
        match self.seek {
            Some((f, token)) => f(token, target),
            None => SeekResult::CantSeek,
        }
    }

    pub fn progress(&self, progress: Progress) -> bool {
        match self.progress {
            Some((f, token)) => f(token, progress),
            None => true,
        }
    }
}

// =============================================================================
// Engine traits
// =============================================================================

/// One engine-native transfer handle
pub trait EngineHandle: Sized {
    /// Create a fresh, unconfigured handle
    fn create() -> Result<Self, DriverError>;

    /// Apply one option
    fn set_option(&mut self, option: EngineOption, value: &OptionValue)
    -> Result<(), OptionError>;

    /// Arm a callback slot with an entry point and the token it passes back
    fn bind(&mut self, callback: Callback, token: Token) -> Result<(), OptionError>;

    /// Disarm a callback slot, restoring the engine default
    fn unbind(&mut self, slot: CallbackSlot) -> Result<(), OptionError>;
}

/// Multiplexed non-blocking engine driver
pub trait Driver: Sized + 'static {
    type Handle: EngineHandle;

    /// A handle while it is registered with the driver
    type Attached;

    /// Create a driver that reports socket and timer requests to `hooks`
    fn open(hooks: DriverHooks, settings: &DriverSettings) -> Result<Self, DriverError>;

    /// Register a handle; finished-transfer messages will carry `token`
    ///
    /// On failure the handle is consumed.
    fn add_handle(&mut self, handle: Self::Handle, token: Token)
    -> Result<Self::Attached, DriverError>;

    /// Deregister a handle and give it back
    ///
    /// On failure the handle is consumed.
    fn remove_handle(&mut self, attached: Self::Attached) -> Result<Self::Handle, DriverError>;

    /// Associate a per-socket token with a socket the driver asked to watch
    fn assign(&mut self, socket: Socket, token: SocketToken) -> Result<(), DriverError>;

    /// Make as much progress as the ready socket (or expired timer) allows
    ///
    /// Returns the number of transfers still running.
    fn socket_action(&mut self, target: ActionTarget, events: EventMask)
    -> Result<u32, DriverError>;

    /// Take every finished-transfer message, in the order the engine produced them
    fn drain_messages(&mut self) -> Vec<Completion>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_half(_token: Token, data: &[u8]) -> usize {
        data.len() / 2
    }

    fn read_ones(token: Token, buf: &mut [u8]) -> Result<usize, ReadError> {
        buf.fill(token.as_u64() as u8);
        Ok(buf.len())
    }

    #[test]
    fn test_event_mask() {
        let mask = EventMask::IN | EventMask::ERR;
        assert!(mask.contains(EventMask::IN));
        assert!(mask.contains(EventMask::ERR));
        assert!(!mask.contains(EventMask::OUT));
        assert!(!mask.contains(EventMask::NONE));
        assert!(EventMask::NONE.is_empty());
        assert_eq!(format!("{mask:?}"), "IN|ERR");
        assert_eq!(format!("{:?}", EventMask::NONE), "NONE");
    }

    #[test]
    fn test_interest() {
        assert!(SocketInterest::In.wants_read());
        assert!(!SocketInterest::In.wants_write());
        assert!(SocketInterest::Out.wants_write());
        assert!(!SocketInterest::Out.wants_read());
        assert!(SocketInterest::InOut.wants_read() && SocketInterest::InOut.wants_write());
        assert!(!SocketInterest::Remove.wants_read() && !SocketInterest::Remove.wants_write());
    }

    #[test]
    fn test_hooks_preserve_order() {
        let hooks = DriverHooks::new();
        let engine_side = hooks.clone();

        engine_side.socket(7, SocketInterest::In, None);
        engine_side.timer(Some(Duration::from_millis(5)));
        engine_side.socket(7, SocketInterest::Remove, Some(SocketToken::new(1)));

        let requests = hooks.drain();
        assert_eq!(requests.len(), 3);
        assert!(matches!(
            requests[0],
            DriverRequest::Socket {
                socket: 7,
                interest: SocketInterest::In,
                token: None
            }
        ));
        assert_eq!(
            requests[1],
            DriverRequest::Timer(Some(Duration::from_millis(5)))
        );
        assert!(hooks.is_empty());
    }

    #[test]
    fn test_callback_table_defaults() {
        let table = CallbackTable::default();
        let mut buf = [0u8; 8];

        assert_eq!(table.write(b"hello"), 5);
        assert_eq!(table.header(b"X: y\r\n"), 6);
        assert_eq!(table.read(&mut buf), Ok(0));
        assert_eq!(table.seek(SeekFrom::Start(0)), SeekResult::CantSeek);
        assert!(table.progress(Progress::default()));
    }

    #[test]
    fn test_callback_table_dispatch() {
        let mut table = CallbackTable::default();
        table.bind(Callback::Write(write_half), Token::new(1));
        table.bind(Callback::Read(read_ones), Token::new(1));

        let mut buf = [0u8; 4];
        assert_eq!(table.write(b"abcd"), 2);
        assert_eq!(table.read(&mut buf), Ok(4));
        assert_eq!(buf, [1, 1, 1, 1]);
        assert!(table.is_bound(CallbackSlot::Write));

        table.unbind(CallbackSlot::Write);
        assert!(!table.is_bound(CallbackSlot::Write));
        assert_eq!(table.write(b"abcd"), 4);
    }

    #[test]
    fn test_driver_settings_defaults() {
        let settings: DriverSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, DriverSettings::default());
        assert!(settings.multiplex);

        let settings: DriverSettings =
            serde_json::from_str(r#"{"max_host_connections": 4, "multiplex": false}"#).unwrap();
        assert_eq!(settings.max_host_connections, Some(4));
        assert!(!settings.multiplex);
    }
}
