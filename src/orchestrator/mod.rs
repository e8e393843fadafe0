//! The orchestration context.
//!
//! [`Orchestrator`] owns the port allocator, registry, process supervisor,
//! health monitor, crash recovery and shutdown coordinator, and is passed
//! explicitly to whatever needs them.

mod builder;
mod cleanup;
mod core;

pub use builder::OrchestratorBuilder;
pub use cleanup::{
    PRIORITY_BACKGROUND, PRIORITY_KILL_TREES, PRIORITY_PERSIST, PRIORITY_RELEASE_PORTS,
    PRIORITY_STOP_SERVICES,
};
pub use core::Orchestrator;
