//! Vote ledger and tally store
//!
//! [`VoteStore`] is the seam to the durable store. Every mutating method is
//! a single atomic transaction: the ledger row, the option counters and the
//! outbox entries for the change commit together or not at all.

pub mod memory;

pub use memory::{InMemoryVoteStore, StoreStats};

use crate::types::{NewPoll, OptionId, Poll, PollId, TallySnapshot, TallyUpdate, Vote, VoterId};
use async_trait::async_trait;

/// Failures reported by a store transaction
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("poll {0} not found")]
    PollNotFound(PollId),

    #[error("option {option_id} does not belong to poll {poll_id}")]
    InvalidOption { poll_id: PollId, option_id: OptionId },

    /// `(poll_id, voter_id)` uniqueness constraint rejected the insert
    #[error("a vote already exists for this voter in poll {0}")]
    UniqueViolation(PollId),

    /// The stored vote is missing or references another option
    #[error("stored vote does not reference the expected option")]
    StaleVote { current: Option<OptionId> },

    /// Row busy or serialization failure; nothing was written
    #[error("transaction aborted due to contention")]
    Contention,

    #[error("operation not permitted: {0}")]
    Forbidden(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Safe to retry without re-reading state
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Contention)
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable store for polls, the vote ledger and option tallies
#[async_trait]
pub trait VoteStore: Send + Sync {
    /// Insert a poll and its options in one transaction
    async fn create_poll(&self, new_poll: NewPoll, creator: Option<VoterId>) -> StoreResult<Poll>;

    async fn get_poll(&self, poll_id: &PollId) -> StoreResult<Option<Poll>>;

    /// Delete a poll with its options and votes; creator only
    async fn delete_poll(&self, poll_id: &PollId, requester: &VoterId) -> StoreResult<()>;

    async fn current_vote(&self, poll_id: &PollId, voter_id: &VoterId) -> StoreResult<Option<Vote>>;

    async fn tallies(&self, poll_id: &PollId) -> StoreResult<TallySnapshot>;

    /// Number of ledger rows for the poll
    async fn ledger_count(&self, poll_id: &PollId) -> StoreResult<u64>;

    /// Insert the voter's ledger row and increment the option counter
    async fn cast_vote(
        &self,
        poll_id: &PollId,
        option_id: &OptionId,
        voter_id: &VoterId,
    ) -> StoreResult<Vote>;

    /// Move the voter's ledger row from `old_option_id` to `new_option_id`
    ///
    /// Decrements the old counter and increments the new one. Equal options
    /// are a no-op that still checks the stored vote.
    async fn change_vote(
        &self,
        poll_id: &PollId,
        old_option_id: &OptionId,
        new_option_id: &OptionId,
        voter_id: &VoterId,
    ) -> StoreResult<Vote>;

    /// Remove up to `limit` committed tally updates, oldest first
    async fn drain_outbox(&self, limit: usize) -> StoreResult<Vec<TallyUpdate>>;
}

impl From<StoreError> for crate::errors::VoteError {
    fn from(err: StoreError) -> Self {
        use crate::errors::VoteError;
        match err {
            StoreError::PollNotFound(_) | StoreError::InvalidOption { .. } => {
                VoteError::InvalidOption
            }
            StoreError::UniqueViolation(_) => VoteError::AlreadyVoted,
            StoreError::StaleVote { .. } => VoteError::StaleVoteState,
            StoreError::Contention => VoteError::TransientContention { attempts: 1 },
            StoreError::Forbidden(message) | StoreError::Unavailable(message) => {
                VoteError::StoreUnavailable { message }
            }
        }
    }
}
