//! Per-thread default scheduler
//!
//! One default scheduler per driver type and thread, created lazily by the
//! first transfer that starts without an explicit scheduler. It lives until
//! the thread exits or it is reset.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;

use spool_common::Driver;
use tracing::debug;

use super::Scheduler;
use crate::error::Result;

thread_local! {
    static DEFAULTS: RefCell<HashMap<TypeId, Box<dyn Any>>> = RefCell::new(HashMap::new());
}

pub(super) fn thread_default<D: Driver>() -> Result<Scheduler<D>> {
    let existing = DEFAULTS.with(|defaults| {
        defaults
            .borrow()
            .get(&TypeId::of::<D>())
            .and_then(|scheduler| scheduler.downcast_ref::<Scheduler<D>>())
            .cloned()
    });
    if let Some(scheduler) = existing {
        return Ok(scheduler);
    }

    let scheduler = Scheduler::<D>::new()?;
    debug!("thread default scheduler created");
    DEFAULTS.with(|defaults| {
        defaults
            .borrow_mut()
            .insert(TypeId::of::<D>(), Box::new(scheduler.clone()));
    });
    Ok(scheduler)
}

pub(super) fn reset_thread_default<D: Driver>() -> bool {
    let removed = DEFAULTS.with(|defaults| defaults.borrow_mut().remove(&TypeId::of::<D>()));
    // Dropped outside the borrow: tearing down a scheduler aborts transfers
    match removed {
        Some(scheduler) => {
            drop(scheduler);
            true
        }
        None => false,
    }
}
