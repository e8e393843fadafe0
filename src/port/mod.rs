//! Port allocation.
//!
//! [`PortAllocator`] hands out exclusive ports per service. A port is only
//! considered reserved once a bind on the allocator's interface succeeded, and
//! the listener is held until the owning service is about to start
//! ([`PortAllocator::handoff`]).

mod allocator;
pub mod conflict;

pub use allocator::PortAllocator;
pub use conflict::{find_owning_processes, ProcessInfo};

use crate::config::ServiceClass;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u32, end: u32) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidPortRange {
            start,
            end,
            reason: reason.to_string(),
        };
        if start == 0 || end == 0 {
            return Err(invalid("port 0 is reserved for OS assignment"));
        }
        if start > u16::MAX as u32 || end > u16::MAX as u32 {
            return Err(invalid("ports must not exceed 65535"));
        }
        if start > end {
            return Err(invalid("start must not be greater than end"));
        }
        Ok(Self {
            start: start as u16,
            end: end as u16,
        })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Fallback range scanned after a service's own range is exhausted.
pub fn class_range(class: ServiceClass) -> PortRange {
    let (start, end) = match class {
        ServiceClass::Frontend => (3000, 3099),
        ServiceClass::Backend => (8000, 8099),
        ServiceClass::Auth => (9000, 9099),
        ServiceClass::Infrastructure => (6000, 6099),
        ServiceClass::Other => (10000, 10099),
    };
    PortRange { start, end }
}

/// An in-memory claim on a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortReservation {
    pub port: u16,
    pub owner_service: String,
    pub reserved_at: DateTime<Utc>,
    /// Hard reservation: backed by a successful bind on the allocator's
    /// interface. Soft reservations come from persisted state and were never
    /// bind-checked by this process.
    pub reserved: bool,
}
