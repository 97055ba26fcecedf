//! spool-test-utils: Test infrastructure for spool.
//!
//! Provides:
//! - SimDriver: Scripted multiplexed driver implementing the engine contract
//! - SimHandle: In-memory transfer handle that records its options
//! - SimControl: Test-side view of a driver (scripts, call log, failure injection)
//! - Step: Script instructions played back by the driver

mod script;
mod sim_driver;
mod sim_handle;

pub use script::Step;
pub use sim_driver::{SimAttached, SimControl, SimDriver};
pub use sim_handle::SimHandle;
