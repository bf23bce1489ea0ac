use shared::domain::NotificationCategory;
use thiserror::Error;

use crate::conversation::Message;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("realtime credential rejected: {0}")]
    AuthRejected(String),
    #[error("realtime transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("failed to send message: {reason}")]
    SendFailed {
        content: String,
        failed: Box<Message>,
        reason: String,
    },
    #[error("fetch cancelled")]
    FetchCancelled,
    #[error("{category} counter mismatch: local={local} server={server}")]
    CounterReconciliationMismatch {
        category: NotificationCategory,
        local: u32,
        server: u32,
    },
    #[error("not logged in")]
    NotLoggedIn,
    #[error("no open conversation with peer {0}")]
    NoConversation(i64),
    #[error("request failed: {0}")]
    Request(String),
}

impl SyncError {
    pub fn request(err: impl std::fmt::Display) -> Self {
        Self::Request(err.to_string())
    }

    /// Benign errors are dropped by the engine instead of being surfaced.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::FetchCancelled)
    }
}

impl From<crate::transport::TransportError> for SyncError {
    fn from(err: crate::transport::TransportError) -> Self {
        match err {
            crate::transport::TransportError::AuthRejected(reason) => Self::AuthRejected(reason),
            crate::transport::TransportError::Unavailable(reason) => {
                Self::TransportUnavailable(reason)
            }
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
