//! Error handling for the poll vote ledger

use serde::{Deserialize, Serialize};

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A vote transaction failed with one of the typed vote errors
    #[error(transparent)]
    Vote(#[from] VoteError),

    /// The vote store rejected or failed an operation
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Local persistent storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Validation errors
    #[error("Validation failed: {field}: {reason}")]
    Validation { field: String, reason: String },

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a new internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The typed vote error, if this is one
    pub fn as_vote_error(&self) -> Option<&VoteError> {
        match self {
            Self::Vote(err) => Some(err),
            _ => None,
        }
    }
}

/// Typed failures of the vote transactions
///
/// Every variant is returned to the direct caller. None of them leaves the
/// ledger and the tallies out of step with each other.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteError {
    /// The voter already holds a vote in this poll
    #[error("voter has already voted in this poll")]
    AlreadyVoted,

    /// The stored vote no longer matches what the caller believed
    #[error("stored vote does not match the expected option")]
    StaleVoteState,

    /// The option does not belong to the poll (or the poll is gone)
    #[error("option does not belong to the poll")]
    InvalidOption,

    /// Bounded retries were exhausted under write contention
    #[error("write contention persisted after {attempts} attempts")]
    TransientContention { attempts: u32 },

    /// The store could not be reached or did not answer in time
    #[error("vote store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// A submission for this poll is already pending in this session
    #[error("a vote submission for this poll is already in flight")]
    SubmissionInFlight,
}

impl VoteError {
    /// Create a store-unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyVoted => "ALREADY_VOTED",
            Self::StaleVoteState => "STALE_VOTE_STATE",
            Self::InvalidOption => "INVALID_OPTION",
            Self::TransientContention { .. } => "TRANSIENT_CONTENTION",
            Self::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            Self::SubmissionInFlight => "SUBMISSION_IN_FLIGHT",
        }
    }

    /// Whether the caller can recover by re-reading and/or retrying
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::InvalidOption)
    }

    /// Whether the voter should be shown the "voted" display state
    pub fn implies_voted(&self) -> bool {
        matches!(self, Self::AlreadyVoted)
    }

    /// Plain-language text for a toast or banner
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::AlreadyVoted => "You have already voted in this poll.",
            Self::StaleVoteState => "Your vote changed elsewhere. Please check it and try again.",
            Self::InvalidOption => "That option is not part of this poll.",
            Self::TransientContention { .. } => "Lots of people are voting right now. Please try again.",
            Self::StoreUnavailable { .. } => "Failed to submit vote. Please try again.",
            Self::SubmissionInFlight => "Your vote is still being submitted.",
        }
    }
}

/// Convenience macros for creating specific error types
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::Error::config($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! storage_error {
    ($msg:expr) => {
        $crate::Error::storage($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::storage(format!($fmt, $($arg)*))
    };
}
