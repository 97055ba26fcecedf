//! Callback bindings and engine trampolines
//!
//! The engine only knows plain function pointers plus a [`Token`]. Each
//! transfer registers its [`Bindings`] in a thread-local table keyed by token;
//! the trampolines below resolve the token and forward to the bound closure.
//!
//! A token that no longer resolves to a live (running) transfer gets its data
//! refused: write and header sinks report 0 bytes taken, the read source
//! aborts and progress asks the engine to stop. The engine then fails the
//! transfer on its own.
//!
//! Closures are taken out of their slot while they run, so a closure may call
//! back into its own transfer (abort, rebind) without a double borrow.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::rc::{Rc, Weak};

use spool_common::{Callback, CallbackSlot, Progress, ReadError, SeekResult, Token};
use tokio::sync::mpsc;

use super::TransferEvent;

pub(crate) type ReadClosure = Box<dyn FnMut(&mut [u8]) -> Result<usize, ReadError>>;
pub(crate) type WriteClosure = Box<dyn FnMut(&[u8]) -> usize>;
pub(crate) type SeekClosure = Box<dyn FnMut(SeekFrom) -> SeekResult>;

thread_local! {
    static REGISTRY: RefCell<HashMap<Token, Weak<Bindings>>> = RefCell::new(HashMap::new());
}

// =============================================================================
// Bindings
// =============================================================================

/// User closures and event subscribers of one transfer
pub(crate) struct Bindings {
    token: Token,
    live: Cell<bool>,
    read: Slot<dyn FnMut(&mut [u8]) -> Result<usize, ReadError>>,
    write: Slot<dyn FnMut(&[u8]) -> usize>,
    header: Slot<dyn FnMut(&[u8]) -> usize>,
    seek: Slot<dyn FnMut(SeekFrom) -> SeekResult>,
    subscribers: RefCell<Vec<mpsc::UnboundedSender<TransferEvent>>>,
}

impl Bindings {
    /// Create bindings and make them reachable from the trampolines
    pub(crate) fn register(token: Token) -> Rc<Self> {
        let bindings = Rc::new(Self {
            token,
            live: Cell::new(false),
            read: Slot::default(),
            write: Slot::default(),
            header: Slot::default(),
            seek: Slot::default(),
            subscribers: RefCell::new(Vec::new()),
        });
        REGISTRY.with(|registry| {
            registry
                .borrow_mut()
                .insert(token, Rc::downgrade(&bindings))
        });
        bindings
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live.get()
    }

    pub(crate) fn set_live(&self, live: bool) {
        self.live.set(live);
    }

    pub(crate) fn set_read(&self, closure: Option<ReadClosure>) {
        self.read.set(closure);
    }

    pub(crate) fn set_write(&self, closure: Option<WriteClosure>) {
        self.write.set(closure);
    }

    pub(crate) fn set_header(&self, closure: Option<WriteClosure>) {
        self.header.set(closure);
    }

    pub(crate) fn set_seek(&self, closure: Option<SeekClosure>) {
        self.seek.set(closure);
    }

    /// Whether a closure is installed for a slot (progress is always bound)
    pub(crate) fn has(&self, slot: CallbackSlot) -> bool {
        match slot {
            CallbackSlot::Read => self.read.is_set(),
            CallbackSlot::Write => self.write.is_set(),
            CallbackSlot::Header => self.header.is_set(),
            CallbackSlot::Seek => self.seek.is_set(),
            CallbackSlot::Progress => true,
        }
    }

    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<TransferEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.borrow_mut().push(tx);
        rx
    }

    pub(crate) fn add_subscriber(&self, tx: mpsc::UnboundedSender<TransferEvent>) {
        self.subscribers.borrow_mut().push(tx);
    }

    /// Send an event to every subscriber, forgetting closed ones
    pub(crate) fn emit(&self, event: TransferEvent) {
        self.subscribers
            .borrow_mut()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, ReadError> {
        self.read.call(|f| f(buf)).unwrap_or(Ok(0))
    }

    fn write(&self, data: &[u8]) -> usize {
        self.write.call(|f| f(data)).unwrap_or(data.len())
    }

    fn header(&self, data: &[u8]) -> usize {
        self.header.call(|f| f(data)).unwrap_or(data.len())
    }

    fn seek(&self, target: SeekFrom) -> SeekResult {
        self.seek.call(|f| f(target)).unwrap_or(SeekResult::CantSeek)
    }
}

impl Drop for Bindings {
    fn drop(&mut self) {
        let token = self.token;
        let _ = REGISTRY.try_with(|registry| {
            if let Ok(mut registry) = registry.try_borrow_mut() {
                registry.remove(&token);
            }
        });
    }
}

/// One closure slot
///
/// The closure is taken out while it runs. Every `set` bumps the epoch, so a
/// closure that replaces or clears its own slot is not put back afterwards.
struct Slot<F: ?Sized> {
    closure: RefCell<Option<Box<F>>>,
    epoch: Cell<u64>,
}

impl<F: ?Sized> Default for Slot<F> {
    fn default() -> Self {
        Self {
            closure: RefCell::new(None),
            epoch: Cell::new(0),
        }
    }
}

impl<F: ?Sized> Slot<F> {
    fn set(&self, closure: Option<Box<F>>) {
        *self.closure.borrow_mut() = closure;
        self.epoch.set(self.epoch.get().wrapping_add(1));
    }

    fn is_set(&self) -> bool {
        self.closure.borrow().is_some()
    }

    fn call<R>(&self, call: impl FnOnce(&mut F) -> R) -> Option<R> {
        let mut closure = self.closure.borrow_mut().take()?;
        let epoch = self.epoch.get();
        let result = call(&mut *closure);
        if self.epoch.get() == epoch {
            *self.closure.borrow_mut() = Some(closure);
        }
        Some(result)
    }
}

// =============================================================================
// Trampolines
// =============================================================================

/// Resolve a token to live bindings
fn resolve(token: Token) -> Option<Rc<Bindings>> {
    REGISTRY
        .try_with(|registry| {
            registry
                .try_borrow()
                .ok()
                .and_then(|registry| registry.get(&token).and_then(Weak::upgrade))
        })
        .ok()
        .flatten()
        .filter(|bindings| bindings.is_live())
}

fn read_trampoline(token: Token, buf: &mut [u8]) -> Result<usize, ReadError> {
    resolve(token).map_or(Err(ReadError::Abort), |b| b.read(buf))
}

fn write_trampoline(token: Token, data: &[u8]) -> usize {
    resolve(token).map_or(0, |b| b.write(data))
}

fn header_trampoline(token: Token, data: &[u8]) -> usize {
    resolve(token).map_or(0, |b| b.header(data))
}

fn seek_trampoline(token: Token, target: SeekFrom) -> SeekResult {
    resolve(token).map_or(SeekResult::Fail, |b| b.seek(target))
}

fn progress_trampoline(token: Token, progress: Progress) -> bool {
    match resolve(token) {
        Some(bindings) => {
            bindings.emit(TransferEvent::Progress { token, progress });
            bindings.is_live()
        }
        None => false,
    }
}

/// Engine entry point for a slot
pub(crate) fn trampoline(slot: CallbackSlot) -> Callback {
    match slot {
        CallbackSlot::Read => Callback::Read(read_trampoline),
        CallbackSlot::Write => Callback::Write(write_trampoline),
        CallbackSlot::Header => Callback::Header(header_trampoline),
        CallbackSlot::Seek => Callback::Seek(seek_trampoline),
        CallbackSlot::Progress => Callback::Progress(progress_trampoline),
    }
}
