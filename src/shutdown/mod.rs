//! Shutdown coordination.
//!
//! [`ShutdownCoordinator`] owns the cleanup handlers and runs them exactly
//! once, in priority order, escalating to emergency cleanup on a critical
//! failure, a second signal, or the global deadline. `signals` feeds OS
//! events into it and [`ExitGuard`] covers exits that never went through it.

mod coordinator;
mod guard;
pub mod signals;

pub use coordinator::{
    CleanupAction, CleanupHandler, ExitPolicy, ShutdownCoordinator, ShutdownOutcome, ShutdownPhase,
    PRIORITY_PROCESSES, PRIORITY_RESOURCES,
};
pub use guard::ExitGuard;
