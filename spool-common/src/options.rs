//! Transfer handle options
//!
//! A handle is configured through generic key/typed-value pairs. Every
//! [`EngineOption`] declares the [`ValueKind`] it accepts so a mismatched value
//! is rejected before it reaches the engine.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::ResultCode;

// =============================================================================
// Options
// =============================================================================

/// Option identifiers understood by transfer handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EngineOption {
    /// Target URL
    Url,
    /// User-Agent request header
    UserAgent,
    /// Referer request header
    Referer,
    /// Custom request method (e.g. "DELETE")
    CustomRequest,
    /// Byte range to request ("0-499")
    Range,
    /// Accepted content encodings ("" for all supported)
    AcceptEncoding,
    /// Proxy URL
    Proxy,
    /// Authentication user name
    Username,
    /// Authentication password
    Password,
    /// Raw request header lines ("Name: value")
    HttpHeaders,
    /// Follow redirects
    FollowLocation,
    /// Maximum number of redirects to follow
    MaxRedirects,
    /// Report HTTP error statuses as transfer failures
    FailOnError,
    /// Request headers only (HEAD)
    NoBody,
    /// Upload using the read callback
    Upload,
    /// Send a POST request using the read callback
    Post,
    /// Size of the upload in bytes
    InFileSize,
    /// Resume offset in bytes
    ResumeFrom,
    /// Connection phase timeout in milliseconds
    ConnectTimeout,
    /// Whole transfer timeout in milliseconds
    Timeout,
    /// Abort when slower than this many bytes per second...
    LowSpeedLimit,
    /// ...for this many seconds
    LowSpeedTime,
    /// Download rate cap in bytes per second
    MaxRecvSpeed,
    /// Upload rate cap in bytes per second
    MaxSendSpeed,
    /// Verify the peer's TLS certificate
    SslVerifyPeer,
    /// Emit engine debug output
    Verbose,
}

impl EngineOption {
    /// All options, in declaration order
    pub const ALL: &'static [EngineOption] = &[
        Self::Url,
        Self::UserAgent,
        Self::Referer,
        Self::CustomRequest,
        Self::Range,
        Self::AcceptEncoding,
        Self::Proxy,
        Self::Username,
        Self::Password,
        Self::HttpHeaders,
        Self::FollowLocation,
        Self::MaxRedirects,
        Self::FailOnError,
        Self::NoBody,
        Self::Upload,
        Self::Post,
        Self::InFileSize,
        Self::ResumeFrom,
        Self::ConnectTimeout,
        Self::Timeout,
        Self::LowSpeedLimit,
        Self::LowSpeedTime,
        Self::MaxRecvSpeed,
        Self::MaxSendSpeed,
        Self::SslVerifyPeer,
        Self::Verbose,
    ];

    /// Kind of value this option accepts
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Url | Self::Proxy => ValueKind::Url,
            Self::UserAgent
            | Self::Referer
            | Self::CustomRequest
            | Self::Range
            | Self::AcceptEncoding
            | Self::Username
            | Self::Password => ValueKind::Text,
            Self::HttpHeaders => ValueKind::List,
            Self::FollowLocation
            | Self::FailOnError
            | Self::NoBody
            | Self::Upload
            | Self::Post
            | Self::SslVerifyPeer
            | Self::Verbose => ValueKind::Flag,
            Self::MaxRedirects
            | Self::InFileSize
            | Self::ResumeFrom
            | Self::ConnectTimeout
            | Self::Timeout
            | Self::LowSpeedLimit
            | Self::LowSpeedTime
            | Self::MaxRecvSpeed
            | Self::MaxSendSpeed => ValueKind::Int,
        }
    }

    /// Validate a value for this option
    ///
    /// URL options also accept plain text, which is checked the same way.
    /// Integer options reject negative values.
    pub fn check(&self, value: &OptionValue) -> Result<(), OptionError> {
        let expected = self.kind();
        let actual = value.kind();

        match (expected, value) {
            (ValueKind::Url, OptionValue::Url(url) | OptionValue::Text(url)) => {
                if url.is_empty() {
                    return Err(OptionError::InvalidValue {
                        option: *self,
                        reason: "URL is empty".to_string(),
                    });
                }
                if url.chars().any(|c| c.is_whitespace() || c.is_control()) {
                    return Err(OptionError::InvalidValue {
                        option: *self,
                        reason: "URL contains whitespace or control characters".to_string(),
                    });
                }
                Ok(())
            }
            (ValueKind::Int, OptionValue::Int(n)) if *n < 0 => Err(OptionError::InvalidValue {
                option: *self,
                reason: format!("negative value {n}"),
            }),
            _ if expected == actual => Ok(()),
            _ => Err(OptionError::TypeMismatch {
                option: *self,
                expected,
                actual,
            }),
        }
    }

    /// Machine-readable name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Url => "url",
            Self::UserAgent => "user_agent",
            Self::Referer => "referer",
            Self::CustomRequest => "custom_request",
            Self::Range => "range",
            Self::AcceptEncoding => "accept_encoding",
            Self::Proxy => "proxy",
            Self::Username => "username",
            Self::Password => "password",
            Self::HttpHeaders => "http_headers",
            Self::FollowLocation => "follow_location",
            Self::MaxRedirects => "max_redirects",
            Self::FailOnError => "fail_on_error",
            Self::NoBody => "no_body",
            Self::Upload => "upload",
            Self::Post => "post",
            Self::InFileSize => "in_file_size",
            Self::ResumeFrom => "resume_from",
            Self::ConnectTimeout => "connect_timeout",
            Self::Timeout => "timeout",
            Self::LowSpeedLimit => "low_speed_limit",
            Self::LowSpeedTime => "low_speed_time",
            Self::MaxRecvSpeed => "max_recv_speed",
            Self::MaxSendSpeed => "max_send_speed",
            Self::SslVerifyPeer => "ssl_verify_peer",
            Self::Verbose => "verbose",
        }
    }
}

impl fmt::Display for EngineOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Values
// =============================================================================

/// Kind of an option value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Text,
    Int,
    Flag,
    Url,
    List,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::Int => "integer",
            Self::Flag => "flag",
            Self::Url => "url",
            Self::List => "list",
        })
    }
}

/// Typed option value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Text(String),
    Int(i64),
    Flag(bool),
    /// Already-encoded URL
    Url(String),
    List(Vec<String>),
}

impl OptionValue {
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Text(_) => ValueKind::Text,
            Self::Int(_) => ValueKind::Int,
            Self::Flag(_) => ValueKind::Flag,
            Self::Url(_) => ValueKind::Url,
            Self::List(_) => ValueKind::List,
        }
    }

    /// Text payload of a text or URL value
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) | Self::Url(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Flag(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for OptionValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

/// Durations are passed as whole milliseconds
impl From<Duration> for OptionValue {
    fn from(value: Duration) -> Self {
        Self::Int(i64::try_from(value.as_millis()).unwrap_or(i64::MAX))
    }
}

impl From<Vec<String>> for OptionValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// A rejected option-set or callback-binding call
///
/// Configuration failures never abort a running transfer; they are returned
/// to the caller of the setter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionError {
    /// The engine does not implement this option
    #[error("option {0} is not supported by the engine")]
    Unsupported(EngineOption),

    /// Value kind does not match the option
    #[error("option {option} expects {expected}, got {actual}")]
    TypeMismatch {
        option: EngineOption,
        expected: ValueKind,
        actual: ValueKind,
    },

    /// Value has the right kind but is unusable
    #[error("invalid value for option {option}: {reason}")]
    InvalidValue { option: EngineOption, reason: String },

    /// The engine refused the value
    #[error("engine rejected option {option}: {code}")]
    Rejected { option: EngineOption, code: ResultCode },

    /// The handle is attached to a running transfer
    #[error("transfer is running; reconfigure it after it completes or is aborted")]
    Running,

    /// The engine refused a callback binding
    #[error("engine rejected the {0} callback")]
    Callback(&'static str),
}
