//! Vote transaction engine
//!
//! This module drives the two vote transactions against a [`VoteStore`]:
//! 1. `cast_vote` inserts the ledger row and increments the option counter
//! 2. `change_vote` moves the ledger row and the counters by exactly one
//! 3. Write contention is retried with bounded, jittered exponential backoff
//! 4. Every call is bounded by the request timeout and never retried after it
//! 5. Committed changes are published through the outbox relay

use crate::config::{Config, EngineConfig};
use crate::errors::VoteError;
use crate::realtime::{OutboxRelay, OutboxRelayService, TallyHub, TallySubscription, Unsubscribe};
use crate::store::{StoreError, StoreResult, VoteStore};
use crate::types::{NewPoll, OptionId, Poll, PollId, TallySnapshot, Vote, VoterId};
use crate::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Result of a vote transaction
pub type VoteResult<T> = std::result::Result<T, VoteError>;

/// Engine statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub committed: u64,
    pub rejected: u64,
    pub contention_retries: u64,
    pub timeouts: u64,
}

/// Runs vote transactions and publishes their committed tally changes
pub struct VoteEngine {
    store: Arc<dyn VoteStore>,
    relay: Arc<OutboxRelay>,
    config: EngineConfig,
    flush_interval: Duration,
    committed: AtomicU64,
    rejected: AtomicU64,
    contention_retries: AtomicU64,
    timeouts: AtomicU64,
}

impl VoteEngine {
    /// Create an engine over `store` with validated configuration
    pub fn new(store: Arc<dyn VoteStore>, config: &Config) -> Result<Self> {
        config.validate()?;

        let hub = Arc::new(TallyHub::new(config.realtime.channel_capacity));
        let relay = Arc::new(OutboxRelay::new(
            store.clone(),
            hub,
            config.realtime.outbox_batch_size,
        ));

        tracing::info!(
            "⚙️ Vote engine ready (max_retries: {}, timeout: {:?})",
            config.engine.max_retries,
            config.engine.request_timeout()
        );

        Ok(Self {
            store,
            relay,
            config: config.engine.clone(),
            flush_interval: config.realtime.flush_interval(),
            committed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            contention_retries: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        })
    }

    /// Engine for tests using [`Config::for_testing`]
    pub fn for_testing(store: Arc<dyn VoteStore>) -> Result<Self> {
        Self::new(store, &Config::for_testing())
    }

    pub fn hub(&self) -> &Arc<TallyHub> {
        self.relay.hub()
    }

    pub fn relay(&self) -> &Arc<OutboxRelay> {
        &self.relay
    }

    /// Background service that republishes anything a cancelled caller left
    /// in the outbox
    pub fn relay_service(&self, stop_signal: tokio::sync::mpsc::Receiver<()>) -> OutboxRelayService {
        OutboxRelayService::new(self.relay.clone(), stop_signal, self.flush_interval)
    }

    /// Cast the voter's first vote in a poll
    pub async fn cast_vote(
        &self,
        poll_id: &PollId,
        option_id: &OptionId,
        voter_id: &VoterId,
    ) -> VoteResult<Vote> {
        let outcome = self
            .bounded(self.with_retries(|| self.store.cast_vote(poll_id, option_id, voter_id)))
            .await;
        self.settle("cast", poll_id, voter_id, outcome).await
    }

    /// Move the voter's vote from `old_option_id` to `new_option_id`
    ///
    /// Equal options succeed without touching the tallies, provided the
    /// stored vote still references that option.
    pub async fn change_vote(
        &self,
        poll_id: &PollId,
        old_option_id: &OptionId,
        new_option_id: &OptionId,
        voter_id: &VoterId,
    ) -> VoteResult<Vote> {
        let outcome = self
            .bounded(self.with_retries(|| {
                self.store
                    .change_vote(poll_id, old_option_id, new_option_id, voter_id)
            }))
            .await;
        self.settle("change", poll_id, voter_id, outcome).await
    }

    /// The option the voter currently holds in a poll
    pub async fn current_vote(
        &self,
        poll_id: &PollId,
        voter_id: &VoterId,
    ) -> VoteResult<Option<OptionId>> {
        Ok(self
            .current_vote_record(poll_id, voter_id)
            .await?
            .map(|vote| vote.option_id))
    }

    /// The voter's full ledger row, if any
    pub async fn current_vote_record(
        &self,
        poll_id: &PollId,
        voter_id: &VoterId,
    ) -> VoteResult<Option<Vote>> {
        self.bounded(async {
            self.store
                .current_vote(poll_id, voter_id)
                .await
                .map_err(VoteError::from)
        })
        .await
    }

    /// Fresh read of a poll's tallies
    pub async fn tallies(&self, poll_id: &PollId) -> VoteResult<TallySnapshot> {
        self.bounded(async { self.store.tallies(poll_id).await.map_err(VoteError::from) })
            .await
    }

    /// Create a poll from validated input
    pub async fn create_poll(&self, new_poll: NewPoll, creator: Option<VoterId>) -> Result<Poll> {
        self.bounded_admin(self.store.create_poll(new_poll, creator))
            .await
    }

    pub async fn get_poll(&self, poll_id: &PollId) -> Result<Option<Poll>> {
        self.bounded_admin(self.store.get_poll(poll_id)).await
    }

    /// Delete a poll; only its creator may do so
    pub async fn delete_poll(&self, poll_id: &PollId, requester: &VoterId) -> Result<()> {
        self.bounded_admin(self.store.delete_poll(poll_id, requester))
            .await
    }

    /// Subscribe to committed tally changes of a poll
    pub fn subscribe(&self, poll_id: &PollId) -> Result<TallySubscription> {
        self.hub().subscribe(poll_id)
    }

    /// Subscribe with a `(option_id, vote_count)` callback
    pub fn subscribe_with<F>(&self, poll_id: &PollId, on_update: F) -> Result<Unsubscribe>
    where
        F: FnMut(OptionId, u64) + Send + 'static,
    {
        self.hub().subscribe_with(poll_id, on_update)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            committed: self.committed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            contention_retries: self.contention_retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Retry a transaction while the store reports contention
    ///
    /// Contention guarantees nothing was written, so re-running the same
    /// transaction is safe for both cast and change.
    async fn with_retries<T, F, Fut>(&self, mut transaction: F) -> VoteResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match transaction().await {
                Ok(value) => return Ok(value),
                Err(StoreError::Contention) if attempt < max_attempts => {
                    self.contention_retries.fetch_add(1, Ordering::Relaxed);
                    let delay = self.jittered_backoff(attempt - 1);
                    tracing::debug!(
                        "🔁 Contention on attempt {}/{}, retrying in {:?}",
                        attempt,
                        max_attempts,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(StoreError::Contention) => {
                    return Err(VoteError::TransientContention { attempts: attempt });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Backoff plus up to the same amount again of random jitter
    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff(attempt);
        let spread = base.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=spread);
        base + Duration::from_millis(jitter)
    }

    async fn bounded<T>(&self, call: impl Future<Output = VoteResult<T>>) -> VoteResult<T> {
        match tokio::time::timeout(self.config.request_timeout(), call).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "⏱️ Vote store call timed out after {:?}",
                    self.config.request_timeout()
                );
                Err(VoteError::unavailable("timed out"))
            }
        }
    }

    /// Poll management keeps the store error kind so `Forbidden` stays distinct
    async fn bounded_admin<T>(&self, call: impl Future<Output = StoreResult<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.request_timeout(), call).await {
            Ok(outcome) => Ok(outcome?),
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "⏱️ Poll store call timed out after {:?}",
                    self.config.request_timeout()
                );
                Err(StoreError::Unavailable("timed out".to_string()).into())
            }
        }
    }

    /// Count, log and publish the outcome of a vote transaction
    async fn settle(
        &self,
        operation: &str,
        poll_id: &PollId,
        voter_id: &VoterId,
        outcome: VoteResult<Vote>,
    ) -> VoteResult<Vote> {
        match &outcome {
            Ok(vote) => {
                self.committed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    "🗳️ Vote {} committed: poll={}, voter={}, option={}",
                    operation,
                    poll_id,
                    voter_id.fingerprint(),
                    vote.option_id
                );
                // Publishing is best effort; the relay service retries later
                if let Err(e) = self.relay.flush().await {
                    tracing::warn!("⚠️ Tally publish deferred: {}", e);
                }
            }
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "🚫 Vote {} rejected: poll={}, voter={}, code={}",
                    operation,
                    poll_id,
                    voter_id.fingerprint(),
                    e.code()
                );
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryVoteStore;
    use crate::types::TallyUpdate;
    use async_trait::async_trait;

    async fn setup() -> (Arc<InMemoryVoteStore>, VoteEngine, Poll) {
        let store = Arc::new(InMemoryVoteStore::new());
        let engine = VoteEngine::for_testing(store.clone()).unwrap();
        let new_poll = NewPoll::new("Tea or coffee?", None, vec!["Tea".into(), "Coffee".into()])
            .unwrap();
        let poll = engine.create_poll(new_poll, None).await.unwrap();
        (store, engine, poll)
    }

    /// Store whose vote transactions take longer than any sane timeout
    struct SlowStore {
        inner: InMemoryVoteStore,
        delay: Duration,
    }

    #[async_trait]
    impl VoteStore for SlowStore {
        async fn create_poll(&self, new_poll: NewPoll, creator: Option<VoterId>) -> StoreResult<Poll> {
            self.inner.create_poll(new_poll, creator).await
        }

        async fn get_poll(&self, poll_id: &PollId) -> StoreResult<Option<Poll>> {
            tokio::time::sleep(self.delay).await;
            self.inner.get_poll(poll_id).await
        }

        async fn delete_poll(&self, poll_id: &PollId, requester: &VoterId) -> StoreResult<()> {
            self.inner.delete_poll(poll_id, requester).await
        }

        async fn current_vote(&self, poll_id: &PollId, voter_id: &VoterId) -> StoreResult<Option<Vote>> {
            self.inner.current_vote(poll_id, voter_id).await
        }

        async fn tallies(&self, poll_id: &PollId) -> StoreResult<TallySnapshot> {
            self.inner.tallies(poll_id).await
        }

        async fn ledger_count(&self, poll_id: &PollId) -> StoreResult<u64> {
            self.inner.ledger_count(poll_id).await
        }

        async fn cast_vote(
            &self,
            poll_id: &PollId,
            option_id: &OptionId,
            voter_id: &VoterId,
        ) -> StoreResult<Vote> {
            tokio::time::sleep(self.delay).await;
            self.inner.cast_vote(poll_id, option_id, voter_id).await
        }

        async fn change_vote(
            &self,
            poll_id: &PollId,
            old_option_id: &OptionId,
            new_option_id: &OptionId,
            voter_id: &VoterId,
        ) -> StoreResult<Vote> {
            tokio::time::sleep(self.delay).await;
            self.inner
                .change_vote(poll_id, old_option_id, new_option_id, voter_id)
                .await
        }

        async fn drain_outbox(&self, limit: usize) -> StoreResult<Vec<TallyUpdate>> {
            self.inner.drain_outbox(limit).await
        }
    }

    #[tokio::test]
    async fn test_cast_then_change() {
        let (_, engine, poll) = setup().await;
        let (tea, coffee) = (poll.options[0].id, poll.options[1].id);
        let voter = VoterId::new("v1").unwrap();

        engine.cast_vote(&poll.id, &tea, &voter).await.unwrap();
        engine.change_vote(&poll.id, &tea, &coffee, &voter).await.unwrap();

        let tallies = engine.tallies(&poll.id).await.unwrap();
        assert_eq!(tallies.count(&tea), Some(0));
        assert_eq!(tallies.count(&coffee), Some(1));
        assert_eq!(engine.current_vote(&poll.id, &voter).await.unwrap(), Some(coffee));
        assert_eq!(engine.stats().committed, 2);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let (_, engine, poll) = setup().await;
        let (tea, coffee) = (poll.options[0].id, poll.options[1].id);
        let voter = VoterId::new("v1").unwrap();

        assert_eq!(
            engine.cast_vote(&poll.id, &OptionId::new(), &voter).await,
            Err(VoteError::InvalidOption)
        );
        assert_eq!(
            engine.change_vote(&poll.id, &tea, &coffee, &voter).await,
            Err(VoteError::StaleVoteState)
        );

        engine.cast_vote(&poll.id, &tea, &voter).await.unwrap();
        assert_eq!(
            engine.cast_vote(&poll.id, &coffee, &voter).await,
            Err(VoteError::AlreadyVoted)
        );
        assert_eq!(
            engine.cast_vote(&PollId::new(), &tea, &voter).await,
            Err(VoteError::InvalidOption)
        );
        assert_eq!(engine.stats().rejected, 4);
    }

    #[tokio::test]
    async fn test_equal_option_change_is_noop() {
        let (_, engine, poll) = setup().await;
        let tea = poll.options[0].id;
        let voter = VoterId::new("v1").unwrap();
        engine.cast_vote(&poll.id, &tea, &voter).await.unwrap();

        let mut subscription = engine.subscribe(&poll.id).unwrap();
        let vote = engine.change_vote(&poll.id, &tea, &tea, &voter).await.unwrap();
        assert_eq!(vote.option_id, tea);
        assert_eq!(engine.tallies(&poll.id).await.unwrap().total(), 1);
        assert!(subscription.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_contention_is_retried() {
        let (store, engine, poll) = setup().await;
        let voter = VoterId::new("v1").unwrap();

        store.force_contention(3);
        engine
            .cast_vote(&poll.id, &poll.options[0].id, &voter)
            .await
            .unwrap();
        assert_eq!(engine.stats().contention_retries, 3);
    }

    #[tokio::test]
    async fn test_contention_exhaustion() {
        let store = Arc::new(InMemoryVoteStore::new());
        let mut config = Config::for_testing();
        config.engine.max_retries = 3;
        let engine = VoteEngine::new(store.clone(), &config).unwrap();
        let new_poll = NewPoll::new("Busy?", None, vec!["Yes".into(), "No".into()]).unwrap();
        let poll = engine.create_poll(new_poll, None).await.unwrap();
        let voter = VoterId::new("v1").unwrap();

        store.force_contention(10);
        let result = engine.cast_vote(&poll.id, &poll.options[0].id, &voter).await;
        assert_eq!(result, Err(VoteError::TransientContention { attempts: 3 }));

        // Nothing was written
        store.force_contention(0);
        assert_eq!(engine.tallies(&poll.id).await.unwrap().total(), 0);
        assert_eq!(engine.current_vote(&poll.id, &voter).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_store_outage() {
        let (store, engine, poll) = setup().await;
        let voter = VoterId::new("v1").unwrap();

        store.set_available(false);
        let result = engine.cast_vote(&poll.id, &poll.options[0].id, &voter).await;
        assert!(matches!(result, Err(VoteError::StoreUnavailable { .. })));
        assert!(matches!(
            engine.tallies(&poll.id).await,
            Err(VoteError::StoreUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_timeout_reports_unavailable() {
        let store = Arc::new(SlowStore {
            inner: InMemoryVoteStore::new(),
            delay: Duration::from_millis(500),
        });
        let mut config = Config::for_testing();
        config.engine.request_timeout_ms = 50;
        let engine = VoteEngine::new(store.clone(), &config).unwrap();

        let new_poll = NewPoll::new("Slow?", None, vec!["Yes".into(), "No".into()]).unwrap();
        let poll = engine.create_poll(new_poll, None).await.unwrap();
        let voter = VoterId::new("v1").unwrap();

        let result = engine.cast_vote(&poll.id, &poll.options[0].id, &voter).await;
        assert_eq!(result, Err(VoteError::unavailable("timed out")));
        assert_eq!(engine.stats().timeouts, 1);

        // The abandoned call never reached the store
        assert_eq!(engine.current_vote(&poll.id, &voter).await.unwrap(), None);

        assert!(matches!(
            engine.get_poll(&poll.id).await,
            Err(crate::Error::Store(StoreError::Unavailable(message))) if message == "timed out"
        ));
        assert_eq!(engine.stats().timeouts, 2);
    }

    #[tokio::test]
    async fn test_poll_management_outage() {
        let (store, engine, poll) = setup().await;
        let owner = VoterId::new("owner").unwrap();

        store.set_available(false);
        assert!(matches!(
            engine.get_poll(&poll.id).await,
            Err(crate::Error::Store(StoreError::Unavailable(_)))
        ));
        let new_poll = NewPoll::new("Down?", None, vec!["Yes".into(), "No".into()]).unwrap();
        assert!(matches!(
            engine.create_poll(new_poll, Some(owner.clone())).await,
            Err(crate::Error::Store(StoreError::Unavailable(_)))
        ));
        assert!(matches!(
            engine.delete_poll(&poll.id, &owner).await,
            Err(crate::Error::Store(StoreError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_commit_is_published() {
        let (_, engine, poll) = setup().await;
        let coffee = poll.options[1].id;
        let mut subscription = engine.subscribe(&poll.id).unwrap();

        let voter = VoterId::new("v1").unwrap();
        engine.cast_vote(&poll.id, &coffee, &voter).await.unwrap();

        let update = subscription.try_recv().unwrap();
        assert_eq!((update.option_id, update.vote_count), (coffee, 1));
    }
}
