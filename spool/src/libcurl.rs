//! libcurl backend
//!
//! [`CurlDriver`] wraps a libcurl multi handle in socket mode: its socket and
//! timer functions push requests onto the [`DriverHooks`] queue and every
//! driver action is a `curl_multi_socket_action` call. [`CurlHandle`] is an
//! easy handle whose handler forwards to a [`CallbackTable`].

use std::io::SeekFrom;
use std::time::Duration;

use curl::easy::{Easy2, Handler, List, WriteError};
use curl::multi::{Easy2Handle, Events, Multi, MultiError};
use spool_common::{
    ActionTarget, Callback, CallbackSlot, CallbackTable, Completion, Driver, DriverError,
    DriverHooks, DriverSettings, EngineHandle, EngineOption, EventMask, OptionError, OptionValue,
    Progress, ReadError, ResultCode, SeekResult, Socket, SocketInterest, SocketToken, Token,
};
use tracing::trace;

use crate::scheduler::Scheduler;
use crate::transfer::Transfer;

/// Scheduler running libcurl transfers
pub type CurlScheduler = Scheduler<CurlDriver>;

/// Transfer run by libcurl
pub type CurlTransfer = Transfer<CurlDriver>;

// =============================================================================
// Easy handle
// =============================================================================

/// Easy handle callbacks, forwarded to the bound trampolines
#[derive(Debug, Default)]
pub struct CurlHandler {
    callbacks: CallbackTable,
}

impl Handler for CurlHandler {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        Ok(self.callbacks.write(data))
    }

    fn header(&mut self, data: &[u8]) -> bool {
        self.callbacks.header(data) == data.len()
    }

    fn read(&mut self, data: &mut [u8]) -> Result<usize, curl::easy::ReadError> {
        self.callbacks.read(data).map_err(|e| match e {
            ReadError::Abort => curl::easy::ReadError::Abort,
            ReadError::Pause => curl::easy::ReadError::Pause,
        })
    }

    fn seek(&mut self, whence: SeekFrom) -> curl::easy::SeekResult {
        match self.callbacks.seek(whence) {
            SeekResult::Ok => curl::easy::SeekResult::Ok,
            SeekResult::Fail => curl::easy::SeekResult::Fail,
            SeekResult::CantSeek => curl::easy::SeekResult::CantSeek,
        }
    }

    fn progress(&mut self, dltotal: f64, dlnow: f64, ultotal: f64, ulnow: f64) -> bool {
        self.callbacks.progress(Progress {
            download_total: dltotal as u64,
            download_now: dlnow as u64,
            upload_total: ultotal as u64,
            upload_now: ulnow as u64,
        })
    }
}

/// libcurl easy handle
pub struct CurlHandle {
    easy: Easy2<CurlHandler>,
}

impl CurlHandle {
    fn apply(&mut self, option: EngineOption, value: &OptionValue) -> Result<(), OptionError> {
        let easy = &mut self.easy;
        let applied = match option {
            EngineOption::Url => easy.url(text(option, value)?),
            EngineOption::UserAgent => easy.useragent(text(option, value)?),
            EngineOption::Referer => easy.referer(text(option, value)?),
            EngineOption::CustomRequest => easy.custom_request(text(option, value)?),
            EngineOption::Range => easy.range(text(option, value)?),
            EngineOption::AcceptEncoding => easy.accept_encoding(text(option, value)?),
            EngineOption::Proxy => easy.proxy(text(option, value)?),
            EngineOption::Username => easy.username(text(option, value)?),
            EngineOption::Password => easy.password(text(option, value)?),
            EngineOption::HttpHeaders => {
                let mut list = List::new();
                for line in value.as_list().unwrap_or_default() {
                    list.append(line).map_err(|e| rejected(option, &e))?;
                }
                easy.http_headers(list)
            }
            EngineOption::FollowLocation => easy.follow_location(flag(value)),
            EngineOption::MaxRedirects => easy.max_redirections(int(option, value)?),
            EngineOption::FailOnError => easy.fail_on_error(flag(value)),
            EngineOption::NoBody => easy.nobody(flag(value)),
            EngineOption::Upload => easy.upload(flag(value)),
            EngineOption::Post => easy.post(flag(value)),
            EngineOption::InFileSize => easy.in_filesize(int(option, value)?),
            EngineOption::ResumeFrom => easy.resume_from(int(option, value)?),
            EngineOption::ConnectTimeout => easy.connect_timeout(millis(option, value)?),
            EngineOption::Timeout => easy.timeout(millis(option, value)?),
            EngineOption::LowSpeedLimit => easy.low_speed_limit(int(option, value)?),
            EngineOption::LowSpeedTime => {
                easy.low_speed_time(Duration::from_secs(int(option, value)?))
            }
            EngineOption::MaxRecvSpeed => easy.max_recv_speed(int(option, value)?),
            EngineOption::MaxSendSpeed => easy.max_send_speed(int(option, value)?),
            EngineOption::SslVerifyPeer => easy.ssl_verify_peer(flag(value)),
            EngineOption::Verbose => easy.verbose(flag(value)),
        };
        applied.map_err(|e| rejected(option, &e))
    }
}

impl EngineHandle for CurlHandle {
    fn create() -> Result<Self, DriverError> {
        Ok(Self {
            easy: Easy2::new(CurlHandler::default()),
        })
    }

    fn set_option(&mut self, option: EngineOption, value: &OptionValue) -> Result<(), OptionError> {
        option.check(value)?;
        self.apply(option, value)
    }

    fn bind(&mut self, callback: Callback, token: Token) -> Result<(), OptionError> {
        if callback.slot() == CallbackSlot::Progress {
            self.easy
                .progress(true)
                .map_err(|_| OptionError::Callback(CallbackSlot::Progress.as_str()))?;
        }
        self.easy.get_mut().callbacks.bind(callback, token);
        Ok(())
    }

    fn unbind(&mut self, slot: CallbackSlot) -> Result<(), OptionError> {
        if slot == CallbackSlot::Progress {
            self.easy
                .progress(false)
                .map_err(|_| OptionError::Callback(slot.as_str()))?;
        }
        self.easy.get_mut().callbacks.unbind(slot);
        Ok(())
    }
}

fn rejected(option: EngineOption, error: &curl::Error) -> OptionError {
    OptionError::Rejected {
        option,
        code: ResultCode::from_code(error.code()),
    }
}

fn text(option: EngineOption, value: &OptionValue) -> Result<&str, OptionError> {
    value.as_text().ok_or(OptionError::TypeMismatch {
        option,
        expected: option.kind(),
        actual: value.kind(),
    })
}

fn flag(value: &OptionValue) -> bool {
    value.as_flag().unwrap_or(false)
}

/// Integer value converted to the width libcurl takes
fn int<T: TryFrom<i64>>(option: EngineOption, value: &OptionValue) -> Result<T, OptionError> {
    let n = value.as_int().ok_or(OptionError::TypeMismatch {
        option,
        expected: option.kind(),
        actual: value.kind(),
    })?;
    T::try_from(n).map_err(|_| OptionError::InvalidValue {
        option,
        reason: format!("{n} is out of range"),
    })
}

fn millis(option: EngineOption, value: &OptionValue) -> Result<Duration, OptionError> {
    int(option, value).map(Duration::from_millis)
}

// =============================================================================
// Multi handle
// =============================================================================

/// Easy handle registered with the multi handle
pub struct CurlAttached(Easy2Handle<CurlHandler>);

/// libcurl multi handle in socket mode
pub struct CurlDriver {
    multi: Multi,
}

fn engine_error(error: MultiError) -> DriverError {
    DriverError::Engine {
        code: error.code(),
        message: error.to_string(),
    }
}

fn interest_of(events: &curl::multi::SocketEvents) -> SocketInterest {
    if events.remove() {
        SocketInterest::Remove
    } else if events.input_and_output() {
        SocketInterest::InOut
    } else if events.input() {
        SocketInterest::In
    } else if events.output() {
        SocketInterest::Out
    } else {
        SocketInterest::None
    }
}

impl Driver for CurlDriver {
    type Handle = CurlHandle;
    type Attached = CurlAttached;

    fn open(hooks: DriverHooks, settings: &DriverSettings) -> Result<Self, DriverError> {
        let mut multi = Multi::new();

        let socket_hooks = hooks.clone();
        multi
            .socket_function(move |socket, events, token| {
                let token = (token != 0).then(|| SocketToken::new(token as u64));
                socket_hooks.socket(socket, interest_of(&events), token);
            })
            .map_err(engine_error)?;
        multi
            .timer_function(move |timeout| {
                hooks.timer(timeout);
                true
            })
            .map_err(engine_error)?;

        if let Some(max) = settings.max_total_connections {
            multi
                .set_max_total_connections(max as usize)
                .map_err(engine_error)?;
        }
        if let Some(max) = settings.max_host_connections {
            multi
                .set_max_host_connections(max as usize)
                .map_err(engine_error)?;
        }
        if let Some(max) = settings.max_connects {
            multi.set_max_connects(max as usize).map_err(engine_error)?;
        }
        multi
            .pipelining(false, settings.multiplex)
            .map_err(engine_error)?;

        Ok(Self { multi })
    }

    fn add_handle(&mut self, handle: CurlHandle, token: Token) -> Result<CurlAttached, DriverError> {
        let mut attached = self.multi.add2(handle.easy).map_err(engine_error)?;
        if let Err(e) = attached.set_token(token.as_u64() as usize) {
            let _ = self.multi.remove2(attached);
            return Err(DriverError::Engine {
                code: e.code(),
                message: e.to_string(),
            });
        }
        Ok(CurlAttached(attached))
    }

    fn remove_handle(&mut self, attached: CurlAttached) -> Result<CurlHandle, DriverError> {
        self.multi
            .remove2(attached.0)
            .map(|easy| CurlHandle { easy })
            .map_err(engine_error)
    }

    fn assign(&mut self, socket: Socket, token: SocketToken) -> Result<(), DriverError> {
        self.multi
            .assign(socket, token.as_u64() as usize)
            .map_err(engine_error)
    }

    fn socket_action(&mut self, target: ActionTarget, events: EventMask) -> Result<u32, DriverError> {
        match target {
            ActionTarget::Socket(socket) => {
                let mut mask = Events::new();
                mask.input(events.contains(EventMask::IN))
                    .output(events.contains(EventMask::OUT))
                    .error(events.contains(EventMask::ERR));
                self.multi.action(socket, &mask).map_err(engine_error)
            }
            ActionTarget::Timeout => self.multi.timeout().map_err(engine_error),
        }
    }

    fn drain_messages(&mut self) -> Vec<Completion> {
        let mut completions = Vec::new();
        self.multi.messages(|message| {
            let (Ok(token), Some(result)) = (message.token(), message.result()) else {
                return;
            };
            let result = match result {
                Ok(()) => ResultCode::Ok,
                Err(e) => ResultCode::from_code(e.code()),
            };
            trace!(token, %result, "engine message");
            completions.push(Completion {
                token: Token::new(token as u64),
                result,
            });
        });
        completions
    }
}
