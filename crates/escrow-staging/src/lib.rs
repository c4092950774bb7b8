//! # escrow-staging
//!
//! Produces encrypted, point-in-time escrow deposits of registry data.
//!
//! A run finds the deposits that are due from per-TLD cursors, fans every
//! resource out to the deposits containing it in a shard-parallel map phase,
//! and assembles each deposit in a reduce phase. A deposit's cursor advances
//! only after its artifacts are durably written, exactly once per watermark.
//!
//! ## Components
//!
//! - [`cursor`]: durable progress cursors with an upload outbox
//! - [`resource`]: versioned registry resources and point-in-time reads
//! - [`pending`]: which deposits are due
//! - [`mapper`] / [`shuffle`]: the map phase and its output
//! - [`reducer`]: marshalling, encryption and the cursor commit
//! - [`idempotency`]: per-deposit lock
//! - [`action`] / [`job`]: run orchestration
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use escrow_core::MemoryBackend;
//! use escrow_staging::prelude::*;
//!
//! # async fn example() -> escrow_staging::error::Result<()> {
//! let config = StagingConfig::new(
//!     StagingSettings::from_env()?,
//!     Arc::new(MemoryResourceStore::default()),
//!     Arc::new(MemoryBackend::new()),
//!     Arc::new(XChaChaEncryptor::new([0u8; 32])?),
//!     Arc::new(InMemoryUploadQueue::new()),
//! );
//! if let StagingOutcome::JobLaunched(handle) = StagingAction::new(config).run().await? {
//!     let report = handle.wait().await?;
//!     assert!(report.is_success());
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod action;
pub mod config;
pub mod crypto;
pub mod cursor;
pub mod deposit;
pub mod error;
pub mod idempotency;
pub mod job;
pub mod mapper;
pub mod marshal;
pub mod metrics;
pub mod mode;
pub mod pending;
pub mod reducer;
pub mod resource;
pub mod shuffle;
pub mod upload;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::action::{StagingAction, StagingOutcome};
    pub use crate::config::{StagingConfig, StagingSettings};
    pub use crate::crypto::{Encryptor, XChaChaEncryptor};
    pub use crate::cursor::CursorStore;
    pub use crate::deposit::DepositKey;
    pub use crate::error::{Error, Result};
    pub use crate::job::{DepositOutcome, JobHandle, JobReport};
    pub use crate::mode::{CursorType, DepositMode};
    pub use crate::pending::PendingDeposit;
    pub use crate::resource::memory::MemoryResourceStore;
    pub use crate::resource::{ResourceSnapshot, ResourceStore};
    pub use crate::upload::memory::InMemoryUploadQueue;
    pub use crate::upload::{UploadQueue, UploadRequest};
}

pub use action::{StagingAction, StagingOutcome};
pub use config::{StagingConfig, StagingSettings};
pub use error::{Error, Result};
