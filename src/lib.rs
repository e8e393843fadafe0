#![allow(unused_assignments)]

//! # devfleet
//!
//! A local orchestrator for fleets of development services.
//!
//! ## Features
//!
//! - **Port Allocation**: exclusive per-service ports, checked and reserved on the
//!   interface the service will bind, with class-specific fallback ranges
//! - **Service Registry**: durable JSON registry with atomic writes, corruption
//!   recovery and staleness reaping
//! - **Dependency Ordering**: topological startup order, cycles are fatal
//! - **Health Monitoring**: per-service HTTP probe loops driving a health state machine
//! - **Crash Recovery**: three crash detectors, a four-stage recovery protocol with
//!   backoff and one crash report per incident
//! - **Shutdown Coordination**: prioritised cleanup handlers, emergency cleanup and a
//!   last-resort exit hook
//!
//! ## Quick Start
//!
//! ```no_run
//! use devfleet::{Orchestrator, Parser};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), devfleet::Error> {
//! let parser = Parser::new();
//! let config = parser.load_config("devfleet.yaml")?;
//!
//! let orchestrator = Arc::new(Orchestrator::builder().config(config).build()?);
//! orchestrator.install_cleanup_handlers()?;
//!
//! // Start all services (respects dependency order)
//! orchestrator.start_all(&[]).await?;
//! orchestrator.run_background_tasks();
//!
//! // Runs cleanup handlers exactly once
//! orchestrator.shutdown().initiate_shutdown("done").await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Model
//!
//! - The port table and the registry are the only shared mutable state, each
//!   behind one short-lived lock that is never held across an `.await`
//! - Every service gets its own probe task and its own crash detection task
//! - Every external wait (probe, recovery stage, cleanup handler) carries a timeout

pub mod config;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod port;
pub mod process;
pub mod recovery;
pub mod registry;
pub mod retry;
pub mod shutdown;

// Re-export commonly used types
pub use config::{Config, Parser, ServiceConfig};
pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
pub use port::PortAllocator;
pub use registry::{ServiceRecord, ServiceRegistry, ServiceStatus};
pub use shutdown::{ExitPolicy, ShutdownCoordinator};
