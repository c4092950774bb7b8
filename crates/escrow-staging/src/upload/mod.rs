//! Follow-on upload tasks for staged deposits.
//!
//! - [`UploadQueue`]: the queue contract, deduplicated by idempotency key
//! - [`UploadRequest`]: the serializable task payload
//! - [`memory::InMemoryUploadQueue`]: in-process queue
//!
//! Requests are staged in the cursor record in the same write that advances
//! the cursor, then relayed here. Relaying may repeat, so every enqueue is
//! keyed by the deposit it uploads.

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::mode::DepositMode;

/// What to do with a staged deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadAction {
    /// Upload a full deposit to the escrow agent.
    RdeUpload,
    /// Copy a thin deposit to the bulk-access bucket.
    BrdaCopy,
}

impl UploadAction {
    /// Action that follows a deposit of `mode`.
    #[must_use]
    pub const fn for_mode(mode: DepositMode) -> Self {
        match mode {
            DepositMode::Full => Self::RdeUpload,
            DepositMode::Thin => Self::BrdaCopy,
        }
    }

    /// Snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RdeUpload => "rde_upload",
            Self::BrdaCopy => "brda_copy",
        }
    }
}

impl fmt::Display for UploadAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upload task payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    /// TLD of the deposit.
    pub tld: String,
    /// Deposit mode.
    pub mode: DepositMode,
    /// Deposit watermark.
    pub watermark: DateTime<Utc>,
    /// Follow-on action.
    pub action: UploadAction,
    /// Storage path of the encrypted deposit document.
    pub document_path: String,
}

impl UploadRequest {
    /// Returns the deduplication key: one upload per deposit and action.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.action,
            self.tld,
            self.mode,
            self.watermark.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

/// Result of enqueuing an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    /// The task was enqueued.
    Enqueued {
        /// Queue-specific message ID.
        message_id: String,
    },
    /// A task with the same idempotency key was already enqueued.
    Deduplicated {
        /// The existing message ID.
        existing_message_id: String,
    },
}

impl EnqueueResult {
    /// Returns the message ID either way.
    #[must_use]
    pub fn message_id(&self) -> &str {
        match self {
            Self::Enqueued { message_id }
            | Self::Deduplicated {
                existing_message_id: message_id,
            } => message_id,
        }
    }
}

/// Queue receiving follow-on upload tasks.
#[async_trait]
pub trait UploadQueue: Send + Sync + 'static {
    /// Enqueues `request`, deduplicating on [`UploadRequest::idempotency_key`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Enqueue` if the queue rejected the task.
    async fn enqueue(&self, request: UploadRequest) -> Result<EnqueueResult>;
}
