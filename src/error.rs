// Error taxonomy for the sync engine.
//
// Every failure is classified into a stable category before it crosses the
// UI boundary, so the UI layer never sees raw transport error text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The profile's transport is offline. Retried on the next reconnect
    /// signal, never by a timer.
    #[error("transport disconnected")]
    Disconnected,

    /// The chat or profile no longer exists server-side. Surfaced once; the
    /// local entity is only removed by an explicit backend removal event.
    #[error("{0} not found on backend")]
    NotFound(String),

    /// A network operation did not resolve within its bounded window.
    #[error("{0} timed out")]
    Timeout(String),

    /// Transient transport failure, retried with backoff until the retry
    /// budget is exhausted.
    #[error("transport error: {0}")]
    Transport(String),

    /// A send was rejected before reaching the network (duplicate guard,
    /// unknown chat).
    #[error("send rejected: {0}")]
    RejectedSend(String),

    /// The boundary update channel has been dropped by the consumer.
    #[error("update channel closed")]
    ChannelClosed,
}

/// Stable error category handed to the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Disconnected,
    NotFound,
    Transient,
    SendFailed,
}

impl SyncError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::Disconnected => ErrorCategory::Disconnected,
            SyncError::NotFound(_) => ErrorCategory::NotFound,
            SyncError::Timeout(_) | SyncError::Transport(_) | SyncError::ChannelClosed => {
                ErrorCategory::Transient
            }
            SyncError::RejectedSend(_) => ErrorCategory::SendFailed,
        }
    }

    /// Transient errors are worth retrying; the other categories are not.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}
