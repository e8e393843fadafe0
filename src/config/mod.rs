//! Configuration parsing and types.
//!
//! - `types` - Root config and the per-subsystem settings sections
//! - `service` - Per-service launch and networking config
//! - `duration` - Human-readable duration strings and serde adapters
//! - `parser` - YAML config discovery and parsing
//! - `validation` - Config validation

mod duration;
mod parser;
mod service;
mod types;
mod validation;

pub use duration::*;
pub use parser::*;
pub use service::*;
pub use types::*;
