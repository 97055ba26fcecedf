//! Scheduler: drives the multiplexed engine from the host event loop
//!
//! A [`Scheduler`] owns one [`Driver`] and the set of transfers registered
//! with it. The driver reports which sockets to watch and when to fire the
//! shared timer through [`DriverHooks`]; the scheduler mirrors those requests
//! into its reactor and runs a driver action whenever a watched socket becomes
//! ready or the timer expires.
//!
//! Every driver action ends at a flush point:
//!
//! 1. Deferred handle additions and removals (requested from inside engine
//!    callbacks while the driver was busy) are performed
//! 2. Socket and timer requests are applied
//! 3. Pending-destroy socket records are released
//!
//! Finished-transfer messages are then drained in one pass and delivered in
//! the order the engine produced them.
//!
//! Everything here is single-threaded (`Rc`/`RefCell`). Socket readiness and
//! the timer are serviced by the future returned from [`Scheduler::run`],
//! which the embedder awaits or spawns with `spawn_local`. Without it,
//! readiness is injected through [`Scheduler::socket_ready`] and
//! [`Scheduler::timeout_elapsed`].

mod default;
mod reactor;

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::task::Poll;
use std::time::Duration;

use spool_common::{
    ActionTarget, Completion, Driver, DriverError, DriverHooks, DriverRequest, EventMask,
    ResultCode, Socket, SocketInterest, SocketToken, Token,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::transfer::{HandleSlot, TransferCore};
use reactor::{Reactor, Readiness, SocketChange};

// =============================================================================
// Events
// =============================================================================

/// Scheduler-level diagnostic with no owning transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A driver operation failed
    DriverError { error: DriverError },

    /// The driver failed to give back a transfer's handle; the transfer will
    /// rebuild it from its options at the next start
    HandleLost { token: Token, error: DriverError },
}

// =============================================================================
// Shared state
// =============================================================================

/// Driver work postponed until the end of the current driver step
enum Deferred<D: Driver> {
    Add {
        token: Token,
        core: Weak<TransferCore<D>>,
    },
    Remove {
        token: Token,
        attached: D::Attached,
        core: Weak<TransferCore<D>>,
    },
}

pub(crate) struct Shared<D: Driver> {
    me: Weak<Shared<D>>,
    config: SchedulerConfig,
    driver: RefCell<D>,
    hooks: DriverHooks,
    members: RefCell<BTreeMap<Token, Weak<TransferCore<D>>>>,
    reactor: RefCell<Reactor>,
    deferred: RefCell<VecDeque<Deferred<D>>>,
    diagnostics: RefCell<Vec<mpsc::UnboundedSender<SchedulerEvent>>>,
    next_socket_token: Cell<u64>,
    /// Already warned that work is waiting with nothing running the pump
    undriven_warned: Cell<bool>,
}

impl<D: Driver> Shared<D> {
    // =========================================================================
    // Membership
    // =========================================================================

    /// Register a prepared handle with the driver and mark the transfer running
    pub(crate) fn add_transfer(
        &self,
        core: &Rc<TransferCore<D>>,
        handle: D::Handle,
    ) -> Result<()> {
        let token = core.token();
        let attached = match self.driver.try_borrow_mut() {
            Ok(mut driver) => match driver.add_handle(handle, token) {
                Ok(attached) => {
                    core.put_handle(HandleSlot::Attached(attached));
                    true
                }
                Err(e) => {
                    warn!(%token, error = %e, "driver refused transfer");
                    return Err(e.into());
                }
            },
            Err(_) => {
                core.put_handle(HandleSlot::Detached(handle));
                self.deferred.borrow_mut().push_back(Deferred::Add {
                    token,
                    core: Rc::downgrade(core),
                });
                false
            }
        };

        self.members.borrow_mut().insert(token, Rc::downgrade(core));
        core.attach(self.me.clone());
        debug!(%token, deferred = !attached, "transfer registered");

        if attached {
            self.flush();
        }
        Ok(())
    }

    /// Deregister a transfer; no-op if it is not a member
    ///
    /// From inside a driver step the driver removal is queued for the flush
    /// point; the transfer stops receiving data immediately either way.
    pub(crate) fn remove_transfer(&self, core: &Rc<TransferCore<D>>) {
        let token = core.token();
        if self.members.borrow_mut().remove(&token).is_none() {
            return;
        }

        match core.take_handle() {
            Some(HandleSlot::Attached(attached)) => {
                let busy = self.driver.try_borrow_mut().is_err();
                if busy {
                    trace!(%token, "driver busy; removal deferred");
                    self.deferred.borrow_mut().push_back(Deferred::Remove {
                        token,
                        attached,
                        core: Rc::downgrade(core),
                    });
                } else {
                    self.detach(core, attached);
                    self.flush();
                }
            }
            Some(detached @ HandleSlot::Detached(_)) => {
                // Never reached the driver; drop the queued addition
                core.put_handle(detached);
                self.deferred
                    .borrow_mut()
                    .retain(|op| !matches!(op, Deferred::Add { token: t, .. } if *t == token));
            }
            None => {}
        }
        debug!(%token, "transfer deregistered");
    }

    /// Remove an attached handle from the driver and give it back
    fn detach(&self, core: &TransferCore<D>, attached: D::Attached) {
        let removed = match self.driver.try_borrow_mut() {
            Ok(mut driver) => driver.remove_handle(attached),
            Err(_) => {
                error!(token = %core.token(), "driver busy during detach");
                return;
            }
        };
        match removed {
            Ok(handle) => core.restore_handle(handle),
            Err(error) => self.handle_lost(core.token(), error),
        }
    }

    /// Deliver one finished-transfer message
    fn complete(&self, completion: Completion) {
        let Completion { token, result } = completion;
        let core = self
            .members
            .borrow_mut()
            .remove(&token)
            .and_then(|core| core.upgrade());
        let Some(core) = core else {
            trace!(%token, %result, "completion for unknown transfer ignored");
            return;
        };

        match core.take_handle() {
            Some(HandleSlot::Attached(attached)) => self.detach(&core, attached),
            Some(detached) => core.put_handle(detached),
            None => {}
        }

        debug!(%token, %result, "transfer finished");
        core.finish(Some(result));
    }

    // =========================================================================
    // Driver actions
    // =========================================================================

    /// Run one driver action and everything that follows it
    fn drive(&self, target: ActionTarget, events: EventMask) {
        trace!(?target, ?events, "driver action");
        let outcome = match self.driver.try_borrow_mut() {
            Ok(mut driver) => driver.socket_action(target, events),
            Err(_) => {
                warn!(?target, "driver action requested from inside a driver step; ignored");
                return;
            }
        };
        match outcome {
            Ok(running) => trace!(running, "driver action done"),
            Err(error) => self.report(error),
        }

        self.flush();

        let completions = match self.driver.try_borrow_mut() {
            Ok(mut driver) => driver.drain_messages(),
            Err(_) => Vec::new(),
        };
        for completion in completions {
            self.complete(completion);
        }

        self.flush();
    }

    fn dispatch(&self, readiness: Readiness) {
        if let ActionTarget::Socket(socket) = readiness.target {
            if !self.reactor.borrow().is_watching(socket) {
                return;
            }
        }
        self.drive(readiness.target, readiness.events);
    }

    /// Perform deferred work, apply driver requests, release dead records
    fn flush(&self) {
        loop {
            let op = self.deferred.borrow_mut().pop_front();
            match op {
                Some(op) => self.run_deferred(op),
                None => break,
            }
        }

        self.apply_requests();

        let released = self.reactor.borrow_mut().purge();
        if released > 0 {
            trace!(released, "socket records released");
        }
        self.wake_pump();
    }

    fn run_deferred(&self, op: Deferred<D>) {
        match op {
            Deferred::Add { token, core } => {
                let Some(core) = core.upgrade() else {
                    return;
                };
                if !self.members.borrow().contains_key(&token) {
                    return;
                }
                let handle = match core.take_handle() {
                    Some(HandleSlot::Detached(handle)) => handle,
                    Some(attached) => {
                        core.put_handle(attached);
                        return;
                    }
                    None => return,
                };
                let added = match self.driver.try_borrow_mut() {
                    Ok(mut driver) => driver.add_handle(handle, token),
                    Err(_) => {
                        error!(%token, "driver busy during flush");
                        return;
                    }
                };
                match added {
                    Ok(attached) => core.put_handle(HandleSlot::Attached(attached)),
                    Err(error) => {
                        // The handle is gone; report a failed start
                        self.report(error);
                        self.members.borrow_mut().remove(&token);
                        core.finish(Some(ResultCode::FailedInit));
                    }
                }
            }
            Deferred::Remove {
                token,
                attached,
                core,
            } => {
                let removed = match self.driver.try_borrow_mut() {
                    Ok(mut driver) => driver.remove_handle(attached),
                    Err(_) => {
                        error!(%token, "driver busy during flush");
                        return;
                    }
                };
                match (removed, core.upgrade()) {
                    (Ok(handle), Some(core)) => core.restore_handle(handle),
                    (Ok(_), None) => {}
                    (Err(error), _) => self.handle_lost(token, error),
                }
            }
        }
    }

    /// Mirror queued socket and timer requests into the reactor
    fn apply_requests(&self) {
        for request in self.hooks.drain() {
            match request {
                DriverRequest::Socket {
                    socket, interest, ..
                } => self.apply_socket(socket, interest),
                DriverRequest::Timer(timeout) => self.apply_timer(timeout),
            }
        }
    }

    fn apply_socket(&self, socket: Socket, interest: SocketInterest) {
        let change = self
            .reactor
            .borrow_mut()
            .update(socket, interest, || self.allocate_socket_token());
        trace!(socket, ?interest, ?change, "socket request");

        // A revived record is a new socket to the engine, which dropped the
        // old assignment on remove
        if let SocketChange::Created(token) | SocketChange::Revived(token) = change {
            let assigned = match self.driver.try_borrow_mut() {
                Ok(mut driver) => driver.assign(socket, token),
                Err(_) => {
                    error!(socket, "driver busy during socket assignment");
                    return;
                }
            };
            if let Err(error) = assigned {
                self.report(error);
            }
        }
    }

    fn apply_timer(&self, timeout: Option<Duration>) {
        let deadline = timeout.map(|timeout| Instant::now() + self.config.clamp_timer(timeout));
        trace!(?timeout, "timer request");
        self.reactor.borrow_mut().set_timer(deadline);
    }

    fn allocate_socket_token(&self) -> SocketToken {
        let next = self.next_socket_token.get() + 1;
        self.next_socket_token.set(next);
        SocketToken::new(next)
    }

    /// Let the pump pick up new sockets and timer changes
    fn wake_pump(&self) {
        let mut reactor = self.reactor.borrow_mut();
        if reactor.is_driven() {
            reactor.wake();
            return;
        }
        if reactor.is_idle() || tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        if !self.undriven_warned.replace(true) {
            warn!("scheduler has sockets or a timer to wait for but is not being run");
        }
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    fn report(&self, error: DriverError) {
        warn!(error = %error, "driver error");
        self.emit(SchedulerEvent::DriverError { error });
    }

    fn handle_lost(&self, token: Token, error: DriverError) {
        error!(%token, error = %error, "driver lost a transfer handle");
        self.emit(SchedulerEvent::HandleLost { token, error });
    }

    fn emit(&self, event: SchedulerEvent) {
        self.diagnostics
            .borrow_mut()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl<D: Driver> Drop for Shared<D> {
    /// Abort every registered transfer in token order, then release the driver
    fn drop(&mut self) {
        let members = std::mem::take(self.members.get_mut());
        if !members.is_empty() {
            debug!(count = members.len(), "scheduler dropped with active transfers");
        }
        let driver = self.driver.get_mut();

        for (token, core) in members {
            let Some(core) = core.upgrade() else {
                continue;
            };
            match core.take_handle() {
                Some(HandleSlot::Attached(attached)) => match driver.remove_handle(attached) {
                    Ok(handle) => core.restore_handle(handle),
                    Err(error) => warn!(%token, error = %error, "handle lost at shutdown"),
                },
                Some(detached) => core.put_handle(detached),
                None => {}
            }
            core.finish(None);
        }

        for op in self.deferred.get_mut().drain(..) {
            if let Deferred::Remove { attached, core, .. } = op {
                if let (Ok(handle), Some(core)) = (driver.remove_handle(attached), core.upgrade()) {
                    core.restore_handle(handle);
                }
            }
        }

        self.reactor.get_mut().shutdown();
    }
}

/// Releases the reactor when the pump stops or is cancelled
struct PumpClaim<D: Driver>(Weak<Shared<D>>);

impl<D: Driver> PumpClaim<D> {
    fn acquire(shared: &Weak<Shared<D>>) -> Option<Self> {
        let claimed = shared.upgrade()?.reactor.borrow_mut().claim();
        claimed.then(|| Self(shared.clone()))
    }
}

impl<D: Driver> Drop for PumpClaim<D> {
    fn drop(&mut self) {
        if let Some(shared) = self.0.upgrade() {
            shared.reactor.borrow_mut().release();
        }
    }
}

/// Wait for socket readiness or the timer and run driver actions
///
/// Holds only a weak reference between polls; exits when the scheduler is
/// dropped.
async fn pump<D: Driver>(shared: Weak<Shared<D>>) {
    let Some(_claim) = PumpClaim::acquire(&shared) else {
        warn!("scheduler is already being run");
        return;
    };
    trace!("pump started");

    loop {
        let ready = std::future::poll_fn(|cx| match shared.upgrade() {
            Some(shared) => {
                let mut reactor = shared.reactor.borrow_mut();
                reactor.poll_ready(cx).map(Some)
            }
            None => Poll::Ready(None),
        })
        .await;

        let (Some(ready), Some(shared)) = (ready, shared.upgrade()) else {
            break;
        };
        for readiness in ready {
            shared.dispatch(readiness);
        }
    }
    trace!("pump stopped");
}

// =============================================================================
// Scheduler
// =============================================================================

/// Cheap, clonable handle to a scheduler
///
/// Dropping the last handle aborts every registered transfer. Not `Send`.
pub struct Scheduler<D: Driver> {
    shared: Rc<Shared<D>>,
}

impl<D: Driver> Scheduler<D> {
    /// Create a scheduler with default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(SchedulerConfig::default())
    }

    /// Create a scheduler and open its driver
    pub fn with_config(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let hooks = DriverHooks::new();
        let driver = D::open(hooks.clone(), &config.driver)?;

        let shared = Rc::new_cyclic(|me| Shared {
            me: me.clone(),
            config,
            driver: RefCell::new(driver),
            hooks,
            members: RefCell::new(BTreeMap::new()),
            reactor: RefCell::new(Reactor::new()),
            deferred: RefCell::new(VecDeque::new()),
            diagnostics: RefCell::new(Vec::new()),
            next_socket_token: Cell::new(0),
            undriven_warned: Cell::new(false),
        });
        debug!("scheduler created");
        Ok(Self { shared })
    }

    /// The scheduler shared by every transfer on this thread that was not
    /// given one explicitly; created on first use
    pub fn thread_default() -> Result<Self> {
        default::thread_default()
    }

    /// Drop this thread's default scheduler, aborting its transfers
    ///
    /// Returns false if none was created. Clones held elsewhere keep it alive.
    pub fn reset_thread_default() -> bool {
        default::reset_thread_default::<D>()
    }

    pub(crate) fn from_shared(shared: Rc<Shared<D>>) -> Self {
        Self { shared }
    }

    pub(crate) fn into_shared(self) -> Rc<Shared<D>> {
        self.shared
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared<D>> {
        Rc::downgrade(&self.shared)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Number of registered transfers
    pub fn active_count(&self) -> usize {
        self.shared.members.borrow().len()
    }

    /// Whether a transfer is registered with this scheduler
    pub fn is_registered(&self, token: Token) -> bool {
        self.shared.members.borrow().contains_key(&token)
    }

    /// Tokens of registered transfers, in token order
    pub fn tokens(&self) -> Vec<Token> {
        self.shared.members.borrow().keys().copied().collect()
    }

    /// Service watched sockets and the engine timer until the scheduler is
    /// dropped
    ///
    /// The future is not `Send`: spawn it with `tokio::task::spawn_local`
    /// inside a `LocalSet`, or await it alongside other work on the current
    /// task. Only one may run per scheduler; another returns immediately.
    pub fn run(&self) -> impl Future<Output = ()> + 'static {
        pump(self.downgrade())
    }

    /// Report readiness of a watched socket and run a driver action
    pub fn socket_ready(&self, socket: Socket, events: EventMask) {
        self.shared.drive(ActionTarget::Socket(socket), events);
    }

    /// Report that the engine's timer expired and run a driver action
    pub fn timeout_elapsed(&self) {
        self.shared.drive(ActionTarget::Timeout, EventMask::NONE);
    }

    /// Current interest in a socket, as last requested by the driver
    pub fn socket_interest(&self, socket: Socket) -> Option<SocketInterest> {
        self.shared.reactor.borrow().interest(socket)
    }

    /// Token assigned to a watched socket
    pub fn socket_token(&self, socket: Socket) -> Option<SocketToken> {
        self.shared.reactor.borrow().socket_token(socket)
    }

    /// Time left until the shared timer fires, if armed
    pub fn timer_remaining(&self) -> Option<Duration> {
        self.shared
            .reactor
            .borrow()
            .timer_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Receive driver-level diagnostics
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SchedulerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.diagnostics.borrow_mut().push(tx);
        rx
    }

    /// Run a closure with exclusive access to the driver
    ///
    /// Fails with [`Error::Busy`] from inside a driver step.
    pub fn with_driver<R>(&self, f: impl FnOnce(&mut D) -> R) -> Result<R> {
        let mut driver = self.shared.driver.try_borrow_mut().map_err(|_| Error::Busy)?;
        let result = f(&mut *driver);
        drop(driver);
        self.shared.apply_requests();
        self.shared.wake_pump();
        Ok(result)
    }
}

impl<D: Driver> Clone for Scheduler<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<D: Driver> fmt::Debug for Scheduler<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reactor = self.shared.reactor.borrow();
        f.debug_struct("Scheduler")
            .field("active", &self.active_count())
            .field("sockets", &reactor.socket_count())
            .field("timer", &reactor.timer_deadline())
            .finish()
    }
}
