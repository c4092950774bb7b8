//! # escrow-test-utils
//!
//! Shared test utilities for the escrow staging pipeline.
//!
//! - [`storage::TracingMemoryBackend`]: storage that records operations and
//!   injects failures
//! - [`fixtures::RegistryFixture`]: a small registry plus a fully wired
//!   [`escrow_staging::StagingConfig`]

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::expect_used, clippy::unwrap_used)]

pub mod fixtures;
pub mod storage;

use escrow_core::{LogFormat, init_logging};

pub use fixtures::{RegistryFixture, jan};
pub use storage::{StorageOp, TracingMemoryBackend};

/// Initializes test logging once per process.
///
/// Honours `RUST_LOG`; `ESCROW_LOG_FORMAT=json` switches to JSON output.
pub fn init_test_logging() {
    let format = std::env::var("ESCROW_LOG_FORMAT").unwrap_or_default();
    init_logging(LogFormat::from_name(&format));
}
