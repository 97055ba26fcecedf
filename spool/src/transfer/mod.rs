//! Transfer: one logical request run by the engine
//!
//! A [`Transfer`] owns one engine handle, its option journal, header set and
//! callback closures, and a small state machine:
//!
//! ```text
//! Idle --start--> Running --completion--> Idle
//!                 Running --abort-------> Idle
//! ```
//!
//! Terminal outcomes are delivered as [`TransferEvent`]s to every subscriber.
//! Data callbacks (read, write, header, seek) run synchronously inside the
//! scheduler's driver step.

mod bindings;

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::SeekFrom;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use spool_common::{
    CallbackSlot, Driver, EngineHandle, EngineOption, HeaderMap, OptionError, OptionValue,
    Progress, ReadError, ResultCode, SeekResult, Token,
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::scheduler::{Scheduler, Shared};
use bindings::{Bindings, trampoline};

/// Source of process-unique transfer tokens
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Data slots a user closure can be bound to
const DATA_SLOTS: [CallbackSlot; 4] = [
    CallbackSlot::Read,
    CallbackSlot::Write,
    CallbackSlot::Header,
    CallbackSlot::Seek,
];

// =============================================================================
// State and events
// =============================================================================

/// Lifecycle state of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Not registered with any scheduler
    Idle,
    /// Registered with a scheduler; the engine owns the handle
    Running,
}

impl TransferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event raised by a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// Progress counters from inside the driver step
    Progress { token: Token, progress: Progress },

    /// The engine finished the transfer (successfully or not)
    Completed { token: Token, result: ResultCode },

    /// The transfer was aborted before the engine finished it
    Aborted { token: Token },
}

impl TransferEvent {
    pub fn token(&self) -> Token {
        match self {
            Self::Progress { token, .. }
            | Self::Completed { token, .. }
            | Self::Aborted { token } => *token,
        }
    }

    /// Returns true for completion and abort
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

// =============================================================================
// Core
// =============================================================================

/// Engine handle in its current form
pub(crate) enum HandleSlot<D: Driver> {
    Detached(D::Handle),
    Attached(D::Attached),
}

/// Shared state of a transfer
///
/// Owned by the [`Transfer`]; schedulers and abort handles only hold weak
/// references.
pub(crate) struct TransferCore<D: Driver> {
    token: Token,
    state: Cell<TransferState>,
    /// `None` while a deferred removal holds the handle, or after the driver
    /// consumed it on failure
    handle: RefCell<Option<HandleSlot<D>>>,
    scheduler: RefCell<Weak<Shared<D>>>,
    preferred: Option<Weak<Shared<D>>>,
    headers: RefCell<HeaderMap>,
    options: RefCell<BTreeMap<EngineOption, OptionValue>>,
    /// Slots whose closure changed while running; re-armed at the next start
    pending_slots: RefCell<BTreeSet<CallbackSlot>>,
    bindings: Rc<Bindings>,
    result: Cell<Option<ResultCode>>,
}

impl<D: Driver> TransferCore<D> {
    fn new(preferred: Option<Weak<Shared<D>>>) -> Result<Rc<Self>> {
        let token = Token::new(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed));
        let bindings = Bindings::register(token);
        let mut handle = D::Handle::create()?;
        handle.bind(trampoline(CallbackSlot::Progress), token)?;

        Ok(Rc::new(Self {
            token,
            state: Cell::new(TransferState::Idle),
            handle: RefCell::new(Some(HandleSlot::Detached(handle))),
            scheduler: RefCell::new(Weak::new()),
            preferred,
            headers: RefCell::new(HeaderMap::new()),
            options: RefCell::new(BTreeMap::new()),
            pending_slots: RefCell::new(BTreeSet::new()),
            bindings,
            result: Cell::new(None),
        }))
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.get() == TransferState::Running
    }

    pub(crate) fn take_handle(&self) -> Option<HandleSlot<D>> {
        self.handle.borrow_mut().take()
    }

    pub(crate) fn put_handle(&self, slot: HandleSlot<D>) {
        *self.handle.borrow_mut() = Some(slot);
    }

    /// Give back a handle returned by a late removal
    ///
    /// Dropped if the transfer already rebuilt or re-attached a handle.
    pub(crate) fn restore_handle(&self, handle: D::Handle) {
        let mut slot = self.handle.borrow_mut();
        if slot.is_none() {
            *slot = Some(HandleSlot::Detached(handle));
        }
    }

    /// Mark the transfer running on a scheduler
    pub(crate) fn attach(&self, scheduler: Weak<Shared<D>>) {
        *self.scheduler.borrow_mut() = scheduler;
        self.state.set(TransferState::Running);
        self.bindings.set_live(true);
    }

    /// Mark the transfer idle and raise its terminal event
    ///
    /// `None` means aborted.
    pub(crate) fn finish(&self, result: Option<ResultCode>) {
        self.state.set(TransferState::Idle);
        self.bindings.set_live(false);
        *self.scheduler.borrow_mut() = Weak::new();

        let event = match result {
            Some(result) => {
                self.result.set(Some(result));
                TransferEvent::Completed {
                    token: self.token,
                    result,
                }
            }
            None => TransferEvent::Aborted { token: self.token },
        };
        self.bindings.emit(event);
    }

    /// Create a fresh handle from the option journal and bound closures
    fn rebuild(&self) -> Result<D::Handle> {
        debug!(token = %self.token, "rebuilding engine handle");
        let mut handle = D::Handle::create()?;
        for (option, value) in self.options.borrow().iter() {
            handle.set_option(*option, value)?;
        }
        handle.bind(trampoline(CallbackSlot::Progress), self.token)?;
        for slot in DATA_SLOTS {
            if self.bindings.has(slot) {
                handle.bind(trampoline(slot), self.token)?;
            }
        }
        self.pending_slots.borrow_mut().clear();
        Ok(handle)
    }

    /// Bring the handle up to date and take it out for registration
    fn prepare(&self) -> Result<D::Handle> {
        let mut handle = match self.take_handle() {
            Some(HandleSlot::Detached(handle)) => handle,
            Some(attached @ HandleSlot::Attached(_)) => {
                self.put_handle(attached);
                return Err(Error::Busy);
            }
            None => self.rebuild()?,
        };

        let pending: Vec<CallbackSlot> = std::mem::take(&mut *self.pending_slots.borrow_mut())
            .into_iter()
            .collect();
        for (applied, &slot) in pending.iter().enumerate() {
            let outcome = if self.bindings.has(slot) {
                handle.bind(trampoline(slot), self.token)
            } else {
                handle.unbind(slot)
            };
            if let Err(e) = outcome {
                // The refused slot and everything after it stay queued
                self.pending_slots
                    .borrow_mut()
                    .extend(&pending[applied..]);
                self.put_handle(HandleSlot::Detached(handle));
                return Err(e.into());
            }
        }

        let lines = self.headers.borrow_mut().take_lines();
        if let Some(lines) = lines {
            let value = OptionValue::List(lines);
            if let Err(e) = handle.set_option(EngineOption::HttpHeaders, &value) {
                self.headers.borrow_mut().touch();
                self.put_handle(HandleSlot::Detached(handle));
                return Err(e.into());
            }
            self.options
                .borrow_mut()
                .insert(EngineOption::HttpHeaders, value);
        }

        Ok(handle)
    }

    fn set_option(&self, option: EngineOption, value: OptionValue) -> std::result::Result<(), OptionError> {
        if self.is_running() {
            return Err(OptionError::Running);
        }
        match self.handle.borrow_mut().as_mut() {
            Some(HandleSlot::Detached(handle)) => handle.set_option(option, &value)?,
            Some(HandleSlot::Attached(_)) => return Err(OptionError::Running),
            None => option.check(&value)?,
        }
        self.options.borrow_mut().insert(option, value);
        Ok(())
    }

    /// Arm or disarm a slot to match the installed closure
    fn sync_slot(&self, slot: CallbackSlot) -> std::result::Result<(), OptionError> {
        if self.is_running() {
            self.pending_slots.borrow_mut().insert(slot);
            return Ok(());
        }
        match self.handle.borrow_mut().as_mut() {
            Some(HandleSlot::Detached(handle)) if self.bindings.has(slot) => {
                handle.bind(trampoline(slot), self.token)
            }
            Some(HandleSlot::Detached(handle)) => handle.unbind(slot),
            _ => Ok(()),
        }
    }

    fn current_scheduler(&self) -> Option<Rc<Shared<D>>> {
        self.scheduler.borrow().upgrade()
    }
}

impl<D: Driver> Drop for TransferCore<D> {
    fn drop(&mut self) {
        debug!(token = %self.token, "transfer released");
    }
}

/// Deregister a running transfer and raise `Aborted`
fn abort_core<D: Driver>(core: &Rc<TransferCore<D>>) {
    if !core.is_running() {
        return;
    }
    if let Some(shared) = core.current_scheduler() {
        shared.remove_transfer(core);
    }
    debug!(token = %core.token(), "transfer aborted");
    core.finish(None);
}

// =============================================================================
// Transfer
// =============================================================================

/// One logical request against the engine
///
/// Not `Send`: a transfer lives on the thread of the scheduler that runs it.
pub struct Transfer<D: Driver> {
    core: Rc<TransferCore<D>>,
}

impl<D: Driver> Transfer<D> {
    /// Create a transfer that runs on the thread-default scheduler
    pub fn new() -> Result<Self> {
        Ok(Self {
            core: TransferCore::new(None)?,
        })
    }

    /// Create a transfer that always runs on `scheduler`
    ///
    /// The transfer does not keep the scheduler alive; starting it after the
    /// scheduler is dropped fails with [`Error::SchedulerGone`].
    pub fn with_scheduler(scheduler: &Scheduler<D>) -> Result<Self> {
        Ok(Self {
            core: TransferCore::new(Some(scheduler.downgrade()))?,
        })
    }

    pub fn token(&self) -> Token {
        self.core.token
    }

    pub fn state(&self) -> TransferState {
        self.core.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// Result of the last completion, if the engine ever finished this transfer
    pub fn result(&self) -> Option<ResultCode> {
        self.core.result.get()
    }

    /// Scheduler the transfer is currently running on
    pub fn scheduler(&self) -> Option<Scheduler<D>> {
        self.core.current_scheduler().map(Scheduler::from_shared)
    }

    /// Receive progress and terminal events
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransferEvent> {
        self.core.bindings.subscribe()
    }

    /// Forward events into an existing channel
    ///
    /// Lets one receiver follow many transfers; events carry the token.
    pub fn subscribe_with(&self, tx: mpsc::UnboundedSender<TransferEvent>) {
        self.core.bindings.add_subscriber(tx);
    }

    /// Handle that can abort this transfer without borrowing it
    pub fn abort_handle(&self) -> AbortHandle<D> {
        AbortHandle {
            core: Rc::downgrade(&self.core),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Register with the scheduler and let the engine run the transfer
    ///
    /// No-op if already running. Completion is reported asynchronously through
    /// [`TransferEvent::Completed`]. On error the transfer stays idle.
    pub fn start(&self) -> Result<()> {
        if self.core.is_running() {
            return Ok(());
        }

        let shared = match &self.core.preferred {
            Some(preferred) => preferred.upgrade().ok_or(Error::SchedulerGone)?,
            None => Scheduler::<D>::thread_default()?.into_shared(),
        };

        let handle = self.core.prepare()?;
        shared.add_transfer(&self.core, handle)
    }

    /// Stop a running transfer and raise [`TransferEvent::Aborted`]
    ///
    /// No-op if idle. No data or progress callback fires for this transfer
    /// after `abort` returns.
    pub fn abort(&self) {
        abort_core(&self.core);
    }

    // =========================================================================
    // Options
    // =========================================================================

    /// Set an engine option
    ///
    /// Rejected with [`OptionError::Running`] while the transfer runs.
    pub fn set(
        &self,
        option: EngineOption,
        value: impl Into<OptionValue>,
    ) -> std::result::Result<(), OptionError> {
        self.core.set_option(option, value.into())
    }

    /// Set the target URL
    pub fn set_url(&self, url: &str) -> std::result::Result<(), OptionError> {
        self.core
            .set_option(EngineOption::Url, OptionValue::Url(url.to_string()))
    }

    /// Value last accepted for an option
    pub fn option(&self, option: EngineOption) -> Option<OptionValue> {
        self.core.options.borrow().get(&option).cloned()
    }

    // =========================================================================
    // Callbacks
    // =========================================================================

    /// Install the upload data source
    ///
    /// Returning `Ok(0)` signals the end of the upload data.
    pub fn set_read_function(
        &self,
        function: impl FnMut(&mut [u8]) -> std::result::Result<usize, ReadError> + 'static,
    ) -> std::result::Result<(), OptionError> {
        self.core.bindings.set_read(Some(Box::new(function)));
        self.sync_or_clear(CallbackSlot::Read)
    }

    pub fn clear_read_function(&self) -> std::result::Result<(), OptionError> {
        self.core.bindings.set_read(None);
        self.core.sync_slot(CallbackSlot::Read)
    }

    /// Install the body data sink
    ///
    /// Returning fewer bytes than given fails the transfer.
    pub fn set_write_function(
        &self,
        function: impl FnMut(&[u8]) -> usize + 'static,
    ) -> std::result::Result<(), OptionError> {
        self.core.bindings.set_write(Some(Box::new(function)));
        self.sync_or_clear(CallbackSlot::Write)
    }

    pub fn clear_write_function(&self) -> std::result::Result<(), OptionError> {
        self.core.bindings.set_write(None);
        self.core.sync_slot(CallbackSlot::Write)
    }

    /// Install the response header line sink
    pub fn set_header_function(
        &self,
        function: impl FnMut(&[u8]) -> usize + 'static,
    ) -> std::result::Result<(), OptionError> {
        self.core.bindings.set_header(Some(Box::new(function)));
        self.sync_or_clear(CallbackSlot::Header)
    }

    pub fn clear_header_function(&self) -> std::result::Result<(), OptionError> {
        self.core.bindings.set_header(None);
        self.core.sync_slot(CallbackSlot::Header)
    }

    /// Install the upload source repositioning function
    pub fn set_seek_function(
        &self,
        function: impl FnMut(SeekFrom) -> SeekResult + 'static,
    ) -> std::result::Result<(), OptionError> {
        self.core.bindings.set_seek(Some(Box::new(function)));
        self.sync_or_clear(CallbackSlot::Seek)
    }

    pub fn clear_seek_function(&self) -> std::result::Result<(), OptionError> {
        self.core.bindings.set_seek(None);
        self.core.sync_slot(CallbackSlot::Seek)
    }

    /// Arm a freshly installed slot; uninstall the closure if the engine refuses
    fn sync_or_clear(&self, slot: CallbackSlot) -> std::result::Result<(), OptionError> {
        let outcome = self.core.sync_slot(slot);
        if outcome.is_err() {
            let bindings = &self.core.bindings;
            match slot {
                CallbackSlot::Read => bindings.set_read(None),
                CallbackSlot::Write => bindings.set_write(None),
                CallbackSlot::Header => bindings.set_header(None),
                CallbackSlot::Seek => bindings.set_seek(None),
                CallbackSlot::Progress => {}
            }
        }
        outcome
    }

    // =========================================================================
    // Headers
    // =========================================================================

    /// Decoded value of a request header
    pub fn http_header(&self, name: &str) -> Option<String> {
        self.core.headers.borrow().get(name)
    }

    /// Set a request header; the value is percent-encoded
    ///
    /// Takes effect at the next start.
    pub fn set_http_header(&self, name: &str, value: &str) {
        self.core.headers.borrow_mut().set(name, value);
    }

    pub fn has_http_header(&self, name: &str) -> bool {
        self.core.headers.borrow().contains(name)
    }

    /// Remove a request header; removing an absent header changes nothing
    pub fn remove_http_header(&self, name: &str) {
        self.core.headers.borrow_mut().remove(name);
    }

    /// Encoded value exactly as sent
    pub fn http_header_raw(&self, name: &str) -> Option<String> {
        self.core.headers.borrow().get_raw(name).map(str::to_string)
    }

    /// Set an already-encoded request header value
    pub fn set_http_header_raw(&self, name: &str, encoded: &str) {
        self.core.headers.borrow_mut().set_raw(name, encoded);
    }
}

impl<D: Driver> fmt::Debug for Transfer<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("token", &self.core.token)
            .field("state", &self.core.state.get())
            .field("result", &self.core.result.get())
            .field("headers", &self.core.headers.borrow().len())
            .finish()
    }
}

impl<D: Driver> Drop for Transfer<D> {
    /// Deregister silently; subscribers see their channel close
    fn drop(&mut self) {
        if !self.core.is_running() {
            return;
        }
        if let Some(shared) = self.core.current_scheduler() {
            shared.remove_transfer(&self.core);
        }
        self.core.state.set(TransferState::Idle);
        self.core.bindings.set_live(false);
    }
}

// =============================================================================
// Abort handle
// =============================================================================

/// Weak handle that aborts a transfer from a callback or signal handler
pub struct AbortHandle<D: Driver> {
    core: Weak<TransferCore<D>>,
}

impl<D: Driver> AbortHandle<D> {
    /// Abort the transfer if it still exists and is running
    pub fn abort(&self) {
        if let Some(core) = self.core.upgrade() {
            abort_core(&core);
        }
    }

    pub fn is_running(&self) -> bool {
        self.core.upgrade().is_some_and(|core| core.is_running())
    }
}

impl<D: Driver> Clone for AbortHandle<D> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}
