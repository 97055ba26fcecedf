//! Engine result codes reported when a transfer finishes
//!
//! Codes follow libcurl's `CURLcode` numbering so a backend can map the
//! engine's native value with [`ResultCode::from_code`] and callers can compare
//! against well-known failures without depending on the engine crate.

use std::fmt;

/// Outcome of one finished transfer as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// Transfer finished successfully
    Ok,
    /// URL scheme is not supported by the engine
    UnsupportedProtocol,
    /// Engine failed to initialize the transfer
    FailedInit,
    /// URL could not be parsed
    UrlMalformat,
    /// Proxy host name could not be resolved
    CouldntResolveProxy,
    /// Remote host name could not be resolved
    CouldntResolveHost,
    /// Connection to the remote host was refused or failed
    CouldntConnect,
    /// Server sent a reply the engine could not understand
    WeirdServerReply,
    /// Server denied access to the resource
    RemoteAccessDenied,
    /// Transfer ended before the announced size was received
    PartialFile,
    /// Server answered with an HTTP error status (with fail-on-error set)
    HttpReturnedError,
    /// Write callback accepted fewer bytes than it was given
    WriteError,
    /// Upload could not be started
    UploadFailed,
    /// Read callback reported an error
    ReadError,
    /// Engine ran out of memory
    OutOfMemory,
    /// Engine-side timeout expired
    OperationTimedOut,
    /// Server does not support the requested range
    RangeError,
    /// TLS handshake failed
    SslConnectError,
    /// Resume offset could not be honored
    BadDownloadResume,
    /// A callback asked the engine to abort
    AbortedByCallback,
    /// Engine rejected a function argument
    BadFunctionArgument,
    /// Redirect limit reached
    TooManyRedirects,
    /// Engine does not know an option
    UnknownOption,
    /// Server closed the connection without replying
    GotNothing,
    /// Sending network data failed
    SendError,
    /// Receiving network data failed
    RecvError,
    /// Peer certificate verification failed
    PeerFailedVerification,
    /// Content encoding could not be decoded
    BadContentEncoding,
    /// Any other engine code
    Other(i32),
}

impl ResultCode {
    /// Map a native engine code to a result code
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::UnsupportedProtocol,
            2 => Self::FailedInit,
            3 => Self::UrlMalformat,
            5 => Self::CouldntResolveProxy,
            6 => Self::CouldntResolveHost,
            7 => Self::CouldntConnect,
            8 => Self::WeirdServerReply,
            9 => Self::RemoteAccessDenied,
            18 => Self::PartialFile,
            22 => Self::HttpReturnedError,
            23 => Self::WriteError,
            25 => Self::UploadFailed,
            26 => Self::ReadError,
            27 => Self::OutOfMemory,
            28 => Self::OperationTimedOut,
            33 => Self::RangeError,
            35 => Self::SslConnectError,
            36 => Self::BadDownloadResume,
            42 => Self::AbortedByCallback,
            43 => Self::BadFunctionArgument,
            47 => Self::TooManyRedirects,
            48 => Self::UnknownOption,
            52 => Self::GotNothing,
            55 => Self::SendError,
            56 => Self::RecvError,
            60 => Self::PeerFailedVerification,
            61 => Self::BadContentEncoding,
            other => Self::Other(other),
        }
    }

    /// Native engine code for this result
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::UnsupportedProtocol => 1,
            Self::FailedInit => 2,
            Self::UrlMalformat => 3,
            Self::CouldntResolveProxy => 5,
            Self::CouldntResolveHost => 6,
            Self::CouldntConnect => 7,
            Self::WeirdServerReply => 8,
            Self::RemoteAccessDenied => 9,
            Self::PartialFile => 18,
            Self::HttpReturnedError => 22,
            Self::WriteError => 23,
            Self::UploadFailed => 25,
            Self::ReadError => 26,
            Self::OutOfMemory => 27,
            Self::OperationTimedOut => 28,
            Self::RangeError => 33,
            Self::SslConnectError => 35,
            Self::BadDownloadResume => 36,
            Self::AbortedByCallback => 42,
            Self::BadFunctionArgument => 43,
            Self::TooManyRedirects => 47,
            Self::UnknownOption => 48,
            Self::GotNothing => 52,
            Self::SendError => 55,
            Self::RecvError => 56,
            Self::PeerFailedVerification => 60,
            Self::BadContentEncoding => 61,
            Self::Other(code) => *code,
        }
    }

    /// Returns true if the transfer finished successfully
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Returns true for failures caused by the network path rather than the
    /// request itself (resolution, connection, timeouts, socket errors)
    #[must_use]
    pub fn is_network_failure(&self) -> bool {
        matches!(
            self,
            Self::CouldntResolveProxy
                | Self::CouldntResolveHost
                | Self::CouldntConnect
                | Self::OperationTimedOut
                | Self::SendError
                | Self::RecvError
                | Self::GotNothing
        )
    }

    /// Short machine-readable name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::UnsupportedProtocol => "unsupported_protocol",
            Self::FailedInit => "failed_init",
            Self::UrlMalformat => "url_malformat",
            Self::CouldntResolveProxy => "couldnt_resolve_proxy",
            Self::CouldntResolveHost => "couldnt_resolve_host",
            Self::CouldntConnect => "couldnt_connect",
            Self::WeirdServerReply => "weird_server_reply",
            Self::RemoteAccessDenied => "remote_access_denied",
            Self::PartialFile => "partial_file",
            Self::HttpReturnedError => "http_returned_error",
            Self::WriteError => "write_error",
            Self::UploadFailed => "upload_failed",
            Self::ReadError => "read_error",
            Self::OutOfMemory => "out_of_memory",
            Self::OperationTimedOut => "operation_timed_out",
            Self::RangeError => "range_error",
            Self::SslConnectError => "ssl_connect_error",
            Self::BadDownloadResume => "bad_download_resume",
            Self::AbortedByCallback => "aborted_by_callback",
            Self::BadFunctionArgument => "bad_function_argument",
            Self::TooManyRedirects => "too_many_redirects",
            Self::UnknownOption => "unknown_option",
            Self::GotNothing => "got_nothing",
            Self::SendError => "send_error",
            Self::RecvError => "recv_error",
            Self::PeerFailedVerification => "peer_failed_verification",
            Self::BadContentEncoding => "bad_content_encoding",
            Self::Other(_) => "other",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "engine error {code}"),
            _ => f.write_str(self.as_str()),
        }
    }
}

impl From<i32> for ResultCode {
    fn from(code: i32) -> Self {
        Self::from_code(code)
    }
}
