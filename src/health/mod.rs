//! Health probing.
//!
//! - `checker` - probe seam and result type
//! - `http` - HTTP implementation against each service's health path
//! - `monitor` - per-service probe loops and the health state machine

mod checker;
pub mod http;
mod monitor;

pub use checker::{HealthChecker, ProbeResult};
pub use http::HttpChecker;
pub use monitor::{apply_probe, HealthMonitor, Transition};
