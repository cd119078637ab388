//! Client-side voting session
//!
//! Wraps the engine with the resolved voter identity, a per-poll submission
//! lock and the optimistic "last voted option" cache. The cache only ever
//! seeds the display; every decision reads the store.

use crate::engine::{VoteEngine, VoteResult};
use crate::errors::VoteError;
use crate::identity::IdentityResolver;
use crate::realtime::{LiveTallies, TallySubscription, Unsubscribe};
use crate::types::{OptionId, PollId, TallySnapshot, VoterId};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// Display state of the voter's submission for one poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum VoteStatus {
    Idle,
    /// Submitted, waiting for the store to answer
    Pending,
    Confirmed(OptionId),
    Failed(VoteError),
}

/// Outcome of a successful vote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteState {
    pub poll_id: PollId,
    pub option_id: OptionId,
    /// Fresh tallies, when the follow-up read succeeded
    pub tallies: Option<TallySnapshot>,
}

/// Local storage key of the optimistic vote cache
pub fn vote_cache_key(poll_id: &PollId) -> String {
    format!("poll_{}_vote", poll_id)
}

/// One viewer's voting session
pub struct VoteSession {
    engine: Arc<VoteEngine>,
    identity: Arc<IdentityResolver>,
    statuses: Mutex<HashMap<PollId, VoteStatus>>,
}

impl VoteSession {
    pub fn new(engine: Arc<VoteEngine>, identity: Arc<IdentityResolver>) -> Self {
        Self {
            engine,
            identity,
            statuses: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<VoteEngine> {
        &self.engine
    }

    pub fn identity(&self) -> &Arc<IdentityResolver> {
        &self.identity
    }

    /// The identity votes are cast under
    pub fn voter_id(&self) -> VoterId {
        self.identity.resolve()
    }

    /// Cast a first vote
    ///
    /// `ALREADY_VOTED` is still returned, but the session moves to the voted
    /// state showing the option actually recorded.
    pub async fn cast_vote(&self, poll_id: &PollId, option_id: &OptionId) -> VoteResult<VoteState> {
        let pending = self.begin(poll_id)?;
        let voter = self.voter_id();

        match self.engine.cast_vote(poll_id, option_id, &voter).await {
            Ok(vote) => {
                self.remember(poll_id, Some(&vote.option_id));
                pending.settle(VoteStatus::Confirmed(vote.option_id));
                Ok(self.state_after(poll_id, vote.option_id).await)
            }
            Err(VoteError::AlreadyVoted) => {
                match self.engine.current_vote(poll_id, &voter).await {
                    Ok(Some(actual)) => {
                        self.remember(poll_id, Some(&actual));
                        pending.settle(VoteStatus::Confirmed(actual));
                    }
                    Ok(None) | Err(_) => {
                        pending.settle(VoteStatus::Failed(VoteError::AlreadyVoted));
                    }
                }
                Err(VoteError::AlreadyVoted)
            }
            Err(e) => {
                pending.settle(VoteStatus::Failed(e.clone()));
                Err(e)
            }
        }
    }

    /// Move the voter's vote to `new_option_id`
    ///
    /// The current option is re-read from the store, never taken from the
    /// local cache.
    pub async fn change_vote(
        &self,
        poll_id: &PollId,
        new_option_id: &OptionId,
    ) -> VoteResult<VoteState> {
        let pending = self.begin(poll_id)?;
        let voter = self.voter_id();

        let outcome = match self.engine.current_vote(poll_id, &voter).await {
            Ok(Some(current)) => {
                self.engine
                    .change_vote(poll_id, &current, new_option_id, &voter)
                    .await
            }
            Ok(None) => Err(VoteError::StaleVoteState),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(vote) => {
                self.remember(poll_id, Some(&vote.option_id));
                pending.settle(VoteStatus::Confirmed(vote.option_id));
                Ok(self.state_after(poll_id, vote.option_id).await)
            }
            Err(e) => {
                pending.settle(VoteStatus::Failed(e.clone()));
                Err(e)
            }
        }
    }

    /// Authoritative read of the voter's option; refreshes the cache
    pub async fn get_current_vote(&self, poll_id: &PollId) -> VoteResult<Option<OptionId>> {
        let current = self
            .engine
            .current_vote(poll_id, &self.voter_id())
            .await?;
        self.remember(poll_id, current.as_ref());
        Ok(current)
    }

    /// Last option this session saw confirmed, for optimistic rendering
    pub fn cached_vote(&self, poll_id: &PollId) -> Option<OptionId> {
        match self.identity.storage().get(&vote_cache_key(poll_id)) {
            Ok(Some(raw)) => OptionId::from_str(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("⚠️ Vote cache unavailable: {}", e);
                None
            }
        }
    }

    pub fn status(&self, poll_id: &PollId) -> VoteStatus {
        self.statuses
            .lock()
            .ok()
            .and_then(|statuses| statuses.get(poll_id).cloned())
            .unwrap_or(VoteStatus::Idle)
    }

    /// Current counts as `(option_id, vote_count)` in option order
    pub async fn get_tallies(&self, poll_id: &PollId) -> VoteResult<Vec<(OptionId, u64)>> {
        Ok(self.engine.tallies(poll_id).await?.counts())
    }

    /// Invoke `on_update(option_id, vote_count)` for every committed change
    pub fn subscribe_to_tallies<F>(&self, poll_id: &PollId, on_update: F) -> Result<Unsubscribe>
    where
        F: FnMut(OptionId, u64) + Send + 'static,
    {
        self.engine.subscribe_with(poll_id, on_update)
    }

    /// Seeded tallies plus the subscription that keeps them current
    ///
    /// Subscribes before reading so no committed change falls in between.
    pub async fn live_view(&self, poll_id: &PollId) -> Result<(LiveTallies, TallySubscription)> {
        let subscription = self.engine.subscribe(poll_id)?;
        let snapshot = self.engine.tallies(poll_id).await?;
        Ok((LiveTallies::from_snapshot(snapshot), subscription))
    }

    fn begin(&self, poll_id: &PollId) -> VoteResult<PendingSubmission<'_>> {
        let mut statuses = self
            .statuses
            .lock()
            .map_err(|_| VoteError::unavailable("session state poisoned"))?;
        let previous = statuses.get(poll_id).cloned().unwrap_or(VoteStatus::Idle);
        if previous == VoteStatus::Pending {
            return Err(VoteError::SubmissionInFlight);
        }
        statuses.insert(*poll_id, VoteStatus::Pending);

        Ok(PendingSubmission {
            statuses: &self.statuses,
            poll_id: *poll_id,
            previous: Some(previous),
        })
    }

    async fn state_after(&self, poll_id: &PollId, option_id: OptionId) -> VoteState {
        let tallies = match self.engine.tallies(poll_id).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!("⚠️ Tally refresh after vote failed: {}", e);
                None
            }
        };
        VoteState {
            poll_id: *poll_id,
            option_id,
            tallies,
        }
    }

    fn remember(&self, poll_id: &PollId, option_id: Option<&OptionId>) {
        let storage = self.identity.storage();
        let key = vote_cache_key(poll_id);
        let written = match option_id {
            Some(option_id) => storage.set(&key, &option_id.to_string()),
            None => storage.remove(&key),
        };
        if let Err(e) = written {
            tracing::warn!("⚠️ Failed to update vote cache: {}", e);
        }
    }
}

/// Pending marker for one poll; restores the prior status if dropped
/// unsettled (the submitting future was cancelled)
struct PendingSubmission<'a> {
    statuses: &'a Mutex<HashMap<PollId, VoteStatus>>,
    poll_id: PollId,
    previous: Option<VoteStatus>,
}

impl PendingSubmission<'_> {
    fn settle(mut self, status: VoteStatus) {
        self.previous = None;
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.insert(self.poll_id, status);
        }
    }
}

impl Drop for PendingSubmission<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            if let Ok(mut statuses) = self.statuses.lock() {
                statuses.insert(self.poll_id, previous);
            }
        }
    }
}
