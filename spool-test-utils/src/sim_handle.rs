//! Simulated transfer handle.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};

use spool_common::{
    Callback, CallbackSlot, CallbackTable, DriverError, EngineHandle, EngineOption, OptionError,
    OptionValue, ResultCode, Token,
};

thread_local! {
    static REJECTED: RefCell<BTreeSet<EngineOption>> = const { RefCell::new(BTreeSet::new()) };
    static REFUSED: RefCell<BTreeSet<CallbackSlot>> = const { RefCell::new(BTreeSet::new()) };
    static CREATED: Cell<u64> = const { Cell::new(0) };
}

/// In-memory transfer handle.
///
/// Options are validated against their declared kind and stored; callbacks
/// are kept in a [`CallbackTable`] that the driver invokes during playback.
#[derive(Debug, Default)]
pub struct SimHandle {
    options: BTreeMap<EngineOption, OptionValue>,
    callbacks: CallbackTable,
    tokens: BTreeMap<CallbackSlot, Token>,
}

impl SimHandle {
    /// Make handles on this thread refuse an option from now on.
    pub fn reject_option(option: EngineOption) {
        REJECTED.with(|rejected| rejected.borrow_mut().insert(option));
    }

    /// Make handles on this thread refuse to arm a callback slot.
    pub fn refuse_bind(slot: CallbackSlot) {
        REFUSED.with(|refused| refused.borrow_mut().insert(slot));
    }

    /// Undo every [`reject_option`](Self::reject_option) and
    /// [`refuse_bind`](Self::refuse_bind) on this thread.
    pub fn accept_all_options() {
        REJECTED.with(|rejected| rejected.borrow_mut().clear());
        REFUSED.with(|refused| refused.borrow_mut().clear());
    }

    /// Number of handles created on this thread so far.
    pub fn created() -> u64 {
        CREATED.with(Cell::get)
    }

    /// Value last applied for an option.
    pub fn option(&self, option: EngineOption) -> Option<&OptionValue> {
        self.options.get(&option)
    }

    /// URL the handle is configured for.
    pub fn url(&self) -> Option<&str> {
        self.options.get(&EngineOption::Url).and_then(OptionValue::as_text)
    }

    /// Token a slot was armed with, if it is armed.
    pub fn bound_token(&self, slot: CallbackSlot) -> Option<Token> {
        self.tokens.get(&slot).copied()
    }

    pub fn callbacks(&self) -> &CallbackTable {
        &self.callbacks
    }
}

impl EngineHandle for SimHandle {
    fn create() -> Result<Self, DriverError> {
        CREATED.with(|created| created.set(created.get() + 1));
        Ok(Self::default())
    }

    fn set_option(
        &mut self,
        option: EngineOption,
        value: &OptionValue,
    ) -> Result<(), OptionError> {
        option.check(value)?;
        if REJECTED.with(|rejected| rejected.borrow().contains(&option)) {
            return Err(OptionError::Rejected {
                option,
                code: ResultCode::UnknownOption,
            });
        }
        self.options.insert(option, value.clone());
        Ok(())
    }

    fn bind(&mut self, callback: Callback, token: Token) -> Result<(), OptionError> {
        if REFUSED.with(|refused| refused.borrow().contains(&callback.slot())) {
            return Err(OptionError::Callback(callback.slot().as_str()));
        }
        self.callbacks.bind(callback, token);
        self.tokens.insert(callback.slot(), token);
        Ok(())
    }

    fn unbind(&mut self, slot: CallbackSlot) -> Result<(), OptionError> {
        self.callbacks.unbind(slot);
        self.tokens.remove(&slot);
        Ok(())
    }
}
