//! Script instructions for the simulated engine.
//!
//! A script is attached to a URL. When a handle with that URL is added to a
//! [`SimDriver`](crate::SimDriver), the driver plays the script back one step
//! at a time during `socket_action`, invoking the handle's callbacks exactly
//! like a real engine would.

use std::io::SeekFrom;
use std::time::Duration;

use spool_common::{Progress, ResultCode, Socket, SocketInterest};

/// One instruction in a transfer script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Deliver a header line to the header callback.
    ///
    /// A short count completes the transfer with `WriteError`.
    Header(Vec<u8>),
    /// Deliver body data to the write callback.
    ///
    /// A short count completes the transfer with `WriteError`.
    Write(Vec<u8>),
    /// Ask the read callback for up to this many bytes of upload data.
    Read(usize),
    /// Ask the seek callback to reposition the upload source.
    Seek(SeekFrom),
    /// Report progress; a `false` answer completes with `AbortedByCallback`.
    Progress(Progress),
    /// Ask the owner to change interest in a socket.
    Watch(Socket, SocketInterest),
    /// Ask the owner to re-arm or disarm the timer.
    Timer(Option<Duration>),
    /// Stop until the next driver action.
    Yield,
    /// Stop until a driver action is performed for this socket.
    AwaitSocket(Socket),
    /// Finish the transfer with a result.
    Done(ResultCode),
}

impl Step {
    /// Header step from a line of text (CRLF appended).
    pub fn header(line: &str) -> Self {
        Self::Header(format!("{line}\r\n").into_bytes())
    }

    /// Write step of `len` filler bytes.
    pub fn write(len: usize) -> Self {
        Self::Write(vec![b'x'; len])
    }

    /// Write step with explicit content.
    pub fn bytes(data: &[u8]) -> Self {
        Self::Write(data.to_vec())
    }

    /// Progress step for a download.
    pub fn download_progress(now: u64, total: u64) -> Self {
        Self::Progress(Progress {
            download_total: total,
            download_now: now,
            ..Progress::default()
        })
    }

    /// Successful completion.
    pub fn ok() -> Self {
        Self::Done(ResultCode::Ok)
    }

    /// Whether this step stops playback until a later action.
    pub(crate) fn is_pause(&self) -> bool {
        matches!(self, Self::Yield | Self::AwaitSocket(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_appends_crlf() {
        assert_eq!(
            Step::header("Content-Length: 3"),
            Step::Header(b"Content-Length: 3\r\n".to_vec())
        );
    }

    #[test]
    fn test_write_filler() {
        match Step::write(4) {
            Step::Write(data) => assert_eq!(data, b"xxxx"),
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_pauses() {
        assert!(Step::Yield.is_pause());
        assert!(Step::AwaitSocket(3).is_pause());
        assert!(!Step::ok().is_pause());
    }
}
