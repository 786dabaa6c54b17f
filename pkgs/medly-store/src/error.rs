//! Error types for conversation and message storage

use sea_orm::DbErr;
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

/// Errors returned by store operations
#[derive(Error, Debug)]
pub enum DmError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Conversation is no longer active: {0}")]
    ConversationInactive(String),
    #[error("{participant_id} is not a participant of conversation {conversation_id}")]
    NotAParticipant {
        conversation_id: String,
        participant_id: String,
    },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("No authenticated participant")]
    Unauthenticated,
    #[error("Invalid database path: {0}")]
    InvalidPath(PathBuf),
}

/// Coarse classification used by callers to pick a recovery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The store could not be reached or the query failed; retrying may help
    Transient,
    /// The addressed conversation does not exist
    NotFound,
    /// The request itself is not acceptable and will fail again as-is
    Rejected,
    /// No participant is signed in
    Unauthenticated,
}

impl DmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Database(_) => ErrorKind::Transient,
            Self::ConversationNotFound(_) => ErrorKind::NotFound,
            Self::ConversationInactive(_)
            | Self::NotAParticipant { .. }
            | Self::InvalidArgument(_)
            | Self::InvalidPath(_) => ErrorKind::Rejected,
            Self::Unauthenticated => ErrorKind::Unauthenticated,
        }
    }

    /// Whether a caller may retry the same request unchanged
    pub fn is_retriable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

pub type DmResult<T> = Result<T, DmError>;

/// Opt-in "log and show no data" handling for read paths
pub trait ResultExt<T> {
    /// Return the value, or log the error and fall back to `T::default()`
    fn or_default_logged(self, operation: &str) -> T
    where
        T: Default;
}

impl<T> ResultExt<T> for DmResult<T> {
    fn or_default_logged(self, operation: &str) -> T
    where
        T: Default,
    {
        match self {
            Ok(value) => value,
            Err(DmError::Unauthenticated) => T::default(),
            Err(e) => {
                warn!("{} failed, returning empty result: {}", operation, e);
                T::default()
            }
        }
    }
}
