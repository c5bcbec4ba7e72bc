//! clinsync - offline synchronization core for a clinical records client.
//!
//! Buffers mutations made while disconnected, keeps an encrypted,
//! size-bounded snapshot in local durable storage, and replays the queue
//! against a remote data service with bounded exponential backoff once
//! connectivity returns.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod action;
pub mod cache;
pub mod crypto;
pub mod notify;
pub mod remote;
pub mod scheduler;
pub mod storage;
pub mod sync;

use serde::{Deserialize, Serialize};

pub use action::{ActionId, ActionKind, PendingAction, TableName};
pub use cache::{OfflineCache, RecordCollection};
pub use crypto::RecordCipher;
pub use notify::{LogNotifier, Notice, Notifier, RecordingNotifier, Severity};
pub use remote::{ErrorCategory, RemoteDataService, RemoteError};
pub use scheduler::{Clock, ManualClock, RetryScheduler, SystemClock};
pub use storage::{CacheStorage, FileStorage, MemoryStorage, StorageError};
pub use sync::{MetricsSnapshot, SyncConfig, SyncEngine, SyncError, SyncReport};

/// An opaque domain record (one row of patient data, vitals, or medications).
pub type Record = serde_json::Map<String, serde_json::Value>;

pub const CACHE_STORAGE_KEY: &str = "clinsync_offline_cache";

pub const MAX_PENDING_ACTIONS: usize = 100;
pub const MAX_PATIENT_RECORDS: usize = 50;
pub const MAX_VITALS_RECORDS: usize = 100;
pub const MAX_MEDICATION_RECORDS: usize = 50;

/// Hard ceiling on the serialized snapshot; anything larger is treated as
/// corrupt on load and progressively trimmed on save.
pub const MAX_CACHE_BYTES: usize = 2 * 1024 * 1024;
/// Per-action ceiling; a single oversized mutation is rejected at enqueue.
pub const MAX_ACTION_BYTES: usize = 100 * 1024;

/// Emergency caps applied when the serialized snapshot exceeds the ceiling.
pub const TRIM_PATIENT_RECORDS: usize = 25;
pub const TRIM_VITALS_RECORDS: usize = 50;
pub const TRIM_MEDICATION_RECORDS: usize = 25;
pub const TRIM_PENDING_ACTIONS: usize = 50;
/// Actions preserved when the storage backend itself reports quota exhaustion.
pub const QUOTA_FALLBACK_PENDING_ACTIONS: usize = 20;

pub const MAX_RETRY_ATTEMPTS: u32 = 3;
pub const INITIAL_RETRY_DELAY_MS: u64 = 1_000;

/// Unix timestamp in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(get_current_time_ms())
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    #[must_use]
    pub fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

#[must_use]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Delay before the next retry given the number of attempts already made.
///
/// The first retry waits the initial delay, each subsequent retry doubles it.
#[must_use]
pub fn retry_delay_ms(initial_delay_ms: u64, prior_attempts: u32) -> u64 {
    initial_delay_ms.saturating_mul(2u64.saturating_pow(prior_attempts))
}

/// Aggregate state of the offline queue as persisted alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// At least one queued action has not been replayed yet.
    Pending,
    /// Every queued action from the last pass succeeded and the queue is empty
    /// or untouched since.
    #[default]
    Synced,
    /// The last sync pass left at least one action unreplayed.
    Error,
}

impl SyncStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub const fn is_synced(self) -> bool {
        matches!(self, Self::Synced)
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
