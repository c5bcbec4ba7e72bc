use async_trait::async_trait;
use thiserror::Error;

use crate::Record;

/// Rough classification of a remote failure; informational only, the retry
/// policy treats every failure the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Timeout,
    RateLimited,
    Server,
    Client,
    Unknown,
}

impl ErrorCategory {
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimited | Self::Server | Self::Unknown
        )
    }
}

#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct RemoteError {
    pub category: ErrorCategory,
    pub message: String,
}

impl RemoteError {
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Network,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Timeout,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn server(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Server,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn client(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Client,
            message: message.into(),
        }
    }
}

/// The three-verb contract the replay queue depends on. Implemented by the
/// host against its real backend; faked in tests.
#[async_trait]
pub trait RemoteDataService: Send + Sync {
    async fn insert(&self, table: &str, record: &Record) -> Result<(), RemoteError>;
    async fn update(&self, table: &str, id: &str, record: &Record) -> Result<(), RemoteError>;
    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError>;
}
