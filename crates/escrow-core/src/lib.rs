//! # escrow-core
//!
//! Shared primitives for the escrow deposit staging pipeline.
//!
//! - **Storage**: object storage contract with conditional (CAS) writes
//! - **Locks**: CAS + TTL distributed locks on top of the storage contract
//! - **Clock**: injectable time source for schedule and cooldown arithmetic
//! - **Identifiers**: ULID-backed job identifiers
//! - **Observability**: logging initialisation and span helpers
//!
//! ## Example
//!
//! ```rust
//! use escrow_core::prelude::*;
//!
//! let clock = FakeClock::at_rfc3339("2024-01-02T01:00:00Z").unwrap();
//! assert_eq!(clock.now().to_rfc3339(), "2024-01-02T01:00:00+00:00");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod error;
pub mod id;
pub mod lock;
pub mod observability;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::clock::{Clock, FakeClock, SystemClock};
    pub use crate::error::{Error, Result};
    pub use crate::id::JobId;
    pub use crate::lock::{DistributedLock, LockGuard, LockInfo};
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
}

pub use clock::{Clock, FakeClock, SystemClock};
pub use error::{Error, Result};
pub use id::JobId;
pub use lock::{DistributedLock, LockGuard, LockInfo};
pub use observability::{LogFormat, init_logging};
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
