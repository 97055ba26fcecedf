//! Scripted multiplexed driver.
//!
//! Plays back a [`Step`] script for every attached handle. Each
//! `socket_action` advances every unfinished handle until it reaches a pause
//! step ([`Step::Yield`] or a non-matching [`Step::AwaitSocket`]) or the end
//! of its script. Socket and timer steps are reported through the
//! [`DriverHooks`] exactly like a real engine would report them.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::rc::Rc;
use std::time::Duration;

use spool_common::{
    ActionTarget, Completion, Driver, DriverError, DriverHooks, DriverSettings, EventMask,
    ReadError, ResultCode, SeekResult, Socket, SocketInterest, SocketToken, Token,
};
use tracing::debug;

use crate::script::Step;
use crate::sim_handle::SimHandle;

/// Result code used when the seek callback fails (libcurl's SEND_FAIL_REWIND).
const SEEK_FAILED: i32 = 65;

/// Ticket for a handle registered with a [`SimDriver`].
#[derive(Debug)]
pub struct SimAttached {
    token: Token,
}

impl SimAttached {
    pub fn token(&self) -> Token {
        self.token
    }
}

/// Shared state between a driver and its test-side controls.
#[derive(Debug, Default)]
struct SimState {
    scripts: HashMap<String, Vec<Step>>,
    actions: Vec<(ActionTarget, EventMask)>,
    added: Vec<Token>,
    removed: Vec<Token>,
    assigned: HashMap<Socket, SocketToken>,
    uploaded: HashMap<Token, Vec<u8>>,
    seeks: Vec<(Token, SeekFrom, SeekResult)>,
    fail_add: Option<DriverError>,
    fail_remove: Option<DriverError>,
    fail_action: Option<DriverError>,
    kick_on_add: bool,
    running: usize,
    settings: DriverSettings,
}

/// Test-side control of a [`SimDriver`].
///
/// Cheap to clone; every clone observes the same driver.
#[derive(Debug, Clone)]
pub struct SimControl {
    state: Rc<RefCell<SimState>>,
}

impl SimControl {
    /// Attach a script to every handle configured with `url`.
    pub fn script(&self, url: &str, steps: impl IntoIterator<Item = Step>) {
        self.state
            .borrow_mut()
            .scripts
            .insert(url.to_string(), steps.into_iter().collect());
    }

    /// Every `socket_action` call, oldest first.
    pub fn actions(&self) -> Vec<(ActionTarget, EventMask)> {
        self.state.borrow().actions.clone()
    }

    /// Tokens passed to `add_handle`, oldest first (including failed adds).
    pub fn added(&self) -> Vec<Token> {
        self.state.borrow().added.clone()
    }

    /// Tokens of handles successfully removed, oldest first.
    pub fn removed(&self) -> Vec<Token> {
        self.state.borrow().removed.clone()
    }

    /// Socket token assigned for a descriptor, if any.
    pub fn assigned(&self, socket: Socket) -> Option<SocketToken> {
        self.state.borrow().assigned.get(&socket).copied()
    }

    /// Upload data pulled through the read callback of a transfer.
    pub fn uploaded(&self, token: Token) -> Vec<u8> {
        self.state
            .borrow()
            .uploaded
            .get(&token)
            .cloned()
            .unwrap_or_default()
    }

    /// Seek requests made and their outcomes, oldest first.
    pub fn seeks(&self) -> Vec<(Token, SeekFrom, SeekResult)> {
        self.state.borrow().seeks.clone()
    }

    /// Number of unfinished handles after the last action.
    pub fn running(&self) -> usize {
        self.state.borrow().running
    }

    /// Settings the driver was opened with.
    pub fn settings(&self) -> DriverSettings {
        self.state.borrow().settings.clone()
    }

    /// Make the next `add_handle` fail.
    pub fn fail_next_add(&self, error: DriverError) {
        self.state.borrow_mut().fail_add = Some(error);
    }

    /// Make the next `remove_handle` fail.
    pub fn fail_next_remove(&self, error: DriverError) {
        self.state.borrow_mut().fail_remove = Some(error);
    }

    /// Make the next `socket_action` fail without doing any work.
    pub fn fail_next_action(&self, error: DriverError) {
        self.state.borrow_mut().fail_action = Some(error);
    }

    /// Request an immediate timeout whenever a handle is added.
    pub fn set_kick_on_add(&self, kick: bool) {
        self.state.borrow_mut().kick_on_add = kick;
    }
}

/// Playback position of one attached handle.
#[derive(Debug)]
struct Playback {
    token: Token,
    handle: SimHandle,
    steps: VecDeque<Step>,
    finished: bool,
}

/// Scripted driver implementing the engine contract.
#[derive(Debug)]
pub struct SimDriver {
    hooks: DriverHooks,
    control: SimControl,
    playing: Vec<Playback>,
    messages: VecDeque<Completion>,
}

impl SimDriver {
    /// Test-side control for this driver.
    pub fn control(&self) -> SimControl {
        self.control.clone()
    }

    /// Attached handle for a token, if registered.
    pub fn handle(&self, token: Token) -> Option<&SimHandle> {
        self.playing
            .iter()
            .find(|playback| playback.token == token)
            .map(|playback| &playback.handle)
    }

    fn play(&mut self, target: ActionTarget) {
        let Self {
            hooks,
            control,
            playing,
            messages,
        } = self;

        for playback in playing.iter_mut() {
            while !playback.finished {
                let Some(step) = playback.steps.pop_front() else {
                    break;
                };
                if step.is_pause() {
                    if step == Step::AwaitSocket(socket_of(target)) {
                        continue;
                    }
                    if matches!(step, Step::AwaitSocket(_)) {
                        playback.steps.push_front(step);
                    }
                    break;
                }
                if let Some(result) = run_step(playback, step, hooks, control) {
                    debug!(token = %playback.token, %result, "simulated transfer finished");
                    playback.finished = true;
                    messages.push_back(Completion {
                        token: playback.token,
                        result,
                    });
                }
            }
        }
    }
}

/// Descriptor an action targets, or -1 for timeouts.
fn socket_of(target: ActionTarget) -> Socket {
    match target {
        ActionTarget::Socket(socket) => socket,
        ActionTarget::Timeout => -1,
    }
}

/// Execute one non-pause step. Returns the result if the transfer finished.
fn run_step(
    playback: &mut Playback,
    step: Step,
    hooks: &DriverHooks,
    control: &SimControl,
) -> Option<ResultCode> {
    let callbacks = *playback.handle.callbacks();
    match step {
        Step::Header(line) => {
            (callbacks.header(&line) != line.len()).then_some(ResultCode::WriteError)
        }
        Step::Write(data) => {
            (callbacks.write(&data) != data.len()).then_some(ResultCode::WriteError)
        }
        Step::Read(len) => {
            let mut buf = vec![0u8; len];
            match callbacks.read(&mut buf) {
                Ok(count) => {
                    let count = count.min(len);
                    control
                        .state
                        .borrow_mut()
                        .uploaded
                        .entry(playback.token)
                        .or_default()
                        .extend_from_slice(&buf[..count]);
                    None
                }
                Err(ReadError::Abort) => Some(ResultCode::AbortedByCallback),
                Err(ReadError::Pause) => {
                    playback.steps.push_front(Step::Read(len));
                    playback.steps.push_front(Step::Yield);
                    None
                }
            }
        }
        Step::Seek(target) => {
            let outcome = callbacks.seek(target);
            control
                .state
                .borrow_mut()
                .seeks
                .push((playback.token, target, outcome));
            (outcome == SeekResult::Fail).then_some(ResultCode::from_code(SEEK_FAILED))
        }
        Step::Progress(progress) => {
            (!callbacks.progress(progress)).then_some(ResultCode::AbortedByCallback)
        }
        Step::Watch(socket, interest) => {
            let token = if interest == SocketInterest::Remove {
                control.state.borrow_mut().assigned.remove(&socket)
            } else {
                control.state.borrow().assigned.get(&socket).copied()
            };
            hooks.socket(socket, interest, token);
            None
        }
        Step::Timer(timeout) => {
            hooks.timer(timeout);
            None
        }
        Step::Done(result) => Some(result),
        Step::Yield | Step::AwaitSocket(_) => None,
    }
}

impl Driver for SimDriver {
    type Handle = SimHandle;
    type Attached = SimAttached;

    fn open(hooks: DriverHooks, settings: &DriverSettings) -> Result<Self, DriverError> {
        let state = SimState {
            settings: settings.clone(),
            ..SimState::default()
        };
        Ok(Self {
            hooks,
            control: SimControl {
                state: Rc::new(RefCell::new(state)),
            },
            playing: Vec::new(),
            messages: VecDeque::new(),
        })
    }

    fn add_handle(
        &mut self,
        handle: SimHandle,
        token: Token,
    ) -> Result<SimAttached, DriverError> {
        let kick = {
            let mut state = self.control.state.borrow_mut();
            state.added.push(token);
            if let Some(error) = state.fail_add.take() {
                return Err(error);
            }
            state.running += 1;
            state.kick_on_add
        };

        let steps = handle
            .url()
            .and_then(|url| self.control.state.borrow().scripts.get(url).cloned())
            .unwrap_or_default();
        self.playing.push(Playback {
            token,
            handle,
            steps: steps.into(),
            finished: false,
        });

        if kick {
            self.hooks.timer(Some(Duration::ZERO));
        }
        Ok(SimAttached { token })
    }

    fn remove_handle(&mut self, attached: SimAttached) -> Result<SimHandle, DriverError> {
        let token = attached.token;
        if let Some(error) = self.control.state.borrow_mut().fail_remove.take() {
            self.playing.retain(|playback| playback.token != token);
            return Err(error);
        }

        let index = self
            .playing
            .iter()
            .position(|playback| playback.token == token)
            .ok_or(DriverError::NotAttached(token))?;
        let playback = self.playing.remove(index);
        self.messages.retain(|message| message.token != token);

        let mut state = self.control.state.borrow_mut();
        state.removed.push(token);
        state.running = self.playing.iter().filter(|p| !p.finished).count();
        Ok(playback.handle)
    }

    fn assign(&mut self, socket: Socket, token: SocketToken) -> Result<(), DriverError> {
        self.control.state.borrow_mut().assigned.insert(socket, token);
        Ok(())
    }

    fn socket_action(
        &mut self,
        target: ActionTarget,
        events: EventMask,
    ) -> Result<u32, DriverError> {
        {
            let mut state = self.control.state.borrow_mut();
            state.actions.push((target, events));
            if let Some(error) = state.fail_action.take() {
                return Err(error);
            }
        }

        self.play(target);

        let running = self.playing.iter().filter(|p| !p.finished).count();
        self.control.state.borrow_mut().running = running;
        Ok(u32::try_from(running).unwrap_or(u32::MAX))
    }

    fn drain_messages(&mut self) -> Vec<Completion> {
        self.messages.drain(..).collect()
    }
}
