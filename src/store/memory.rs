//! In-process implementation of the vote store
//!
//! Each poll is one row guarded by its own mutex. Transactions take the row
//! lock without waiting and report [`StoreError::Contention`] when another
//! transaction holds it, the way a `NOWAIT` row lock or a serializable
//! store aborts a conflicting writer.

use super::{StoreError, StoreResult, VoteStore};
use crate::types::{
    NewPoll, OptionId, Poll, PollId, PollOption, TallySnapshot, TallyUpdate, Vote, VoterId,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, TryLockError};

/// A poll, its tallies and its slice of the ledger
#[derive(Debug)]
struct PollRow {
    poll: Poll,
    /// Keyed by voter: at most one vote per (poll, voter)
    ledger: HashMap<VoterId, Vote>,
    /// Set under the row lock by `delete_poll`; holders of a stale handle
    /// must treat the poll as gone
    deleted: bool,
}

impl PollRow {
    fn option_index(&self, option_id: &OptionId) -> Option<usize> {
        self.poll
            .options
            .iter()
            .position(|option| option.id == *option_id)
    }

    fn bump(&mut self, index: usize, increment: bool) -> TallyUpdate {
        let option = &mut self.poll.options[index];
        if increment {
            option.vote_count += 1;
        } else {
            option.vote_count -= 1;
        }
        option.version += 1;
        TallyUpdate {
            poll_id: option.poll_id,
            option_id: option.id,
            vote_count: option.vote_count,
            version: option.version,
        }
    }
}

/// Store statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_polls: usize,
    pub total_votes: usize,
    pub pending_outbox: usize,
}

/// In-memory vote store with per-poll row locks and a transactional outbox
pub struct InMemoryVoteStore {
    polls: RwLock<HashMap<PollId, Arc<Mutex<PollRow>>>>,
    outbox: Mutex<VecDeque<TallyUpdate>>,
    available: AtomicBool,
    forced_contention: AtomicU32,
}

impl Default for InMemoryVoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryVoteStore {
    pub fn new() -> Self {
        Self {
            polls: RwLock::new(HashMap::new()),
            outbox: Mutex::new(VecDeque::new()),
            available: AtomicBool::new(true),
            forced_contention: AtomicU32::new(0),
        }
    }

    /// Simulate an outage: every call fails with `Unavailable` while false
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `count` vote transactions abort with `Contention`
    pub fn force_contention(&self, count: u32) {
        self.forced_contention.store(count, Ordering::SeqCst);
    }

    pub fn stats(&self) -> StoreResult<StoreStats> {
        let polls = self.polls_read()?;
        let mut total_votes = 0;
        for row in polls.values() {
            total_votes += lock_row(row)?.ledger.len();
        }
        let pending_outbox = self
            .outbox
            .lock()
            .map_err(|_| unavailable("outbox lock poisoned"))?
            .len();

        Ok(StoreStats {
            total_polls: polls.len(),
            total_votes,
            pending_outbox,
        })
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(unavailable("connection refused"))
        }
    }

    fn polls_read(
        &self,
    ) -> StoreResult<std::sync::RwLockReadGuard<'_, HashMap<PollId, Arc<Mutex<PollRow>>>>> {
        self.polls
            .read()
            .map_err(|_| unavailable("poll table lock poisoned"))
    }

    /// Lock a row for reading, failing if it was deleted after lookup
    fn read_row<T>(&self, poll_id: &PollId, read: impl FnOnce(&PollRow) -> T) -> StoreResult<T> {
        let row = self.row(poll_id)?;
        let guard = lock_row(&row)?;
        if guard.deleted {
            return Err(StoreError::PollNotFound(*poll_id));
        }
        Ok(read(&guard))
    }

    fn row(&self, poll_id: &PollId) -> StoreResult<Arc<Mutex<PollRow>>> {
        self.ensure_available()?;
        self.polls_read()?
            .get(poll_id)
            .cloned()
            .ok_or(StoreError::PollNotFound(*poll_id))
    }

    /// Run a vote transaction on one poll row
    ///
    /// The closure must validate before it mutates; whatever it returns in
    /// `updates` is appended to the outbox while the row lock is still held.
    fn transact<T>(
        &self,
        poll_id: &PollId,
        tx: impl FnOnce(&mut PollRow) -> StoreResult<(T, Vec<TallyUpdate>)>,
    ) -> StoreResult<T> {
        let row = self.row(poll_id)?;
        self.transact_row(poll_id, &row, tx)
    }

    fn transact_row<T>(
        &self,
        poll_id: &PollId,
        row: &Mutex<PollRow>,
        tx: impl FnOnce(&mut PollRow) -> StoreResult<(T, Vec<TallyUpdate>)>,
    ) -> StoreResult<T> {
        if self
            .forced_contention
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Contention);
        }

        let mut guard = match row.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(StoreError::Contention),
            Err(TryLockError::Poisoned(_)) => return Err(unavailable("poll row lock poisoned")),
        };
        if guard.deleted {
            return Err(StoreError::PollNotFound(*poll_id));
        }

        let (value, updates) = tx(&mut *guard)?;
        if !updates.is_empty() {
            let mut outbox = self
                .outbox
                .lock()
                .map_err(|_| unavailable("outbox lock poisoned"))?;
            outbox.extend(updates);
        }
        Ok(value)
    }
}

fn unavailable(message: &str) -> StoreError {
    StoreError::Unavailable(message.to_string())
}

fn lock_row(row: &Mutex<PollRow>) -> StoreResult<std::sync::MutexGuard<'_, PollRow>> {
    row.lock().map_err(|_| unavailable("poll row lock poisoned"))
}

#[async_trait]
impl VoteStore for InMemoryVoteStore {
    async fn create_poll(&self, new_poll: NewPoll, creator: Option<VoterId>) -> StoreResult<Poll> {
        self.ensure_available()?;

        let poll_id = PollId::new();
        let options = new_poll
            .options
            .into_iter()
            .enumerate()
            .map(|(position, text)| PollOption {
                id: OptionId::new(),
                poll_id,
                text,
                position: position as u32,
                vote_count: 0,
                version: 0,
            })
            .collect();

        let poll = Poll {
            id: poll_id,
            question: new_poll.question,
            description: new_poll.description,
            creator,
            options,
            created_at: Utc::now(),
        };

        let mut polls = self
            .polls
            .write()
            .map_err(|_| unavailable("poll table lock poisoned"))?;
        polls.insert(
            poll_id,
            Arc::new(Mutex::new(PollRow {
                poll: poll.clone(),
                ledger: HashMap::new(),
                deleted: false,
            })),
        );

        tracing::info!(
            "📝 Poll created: poll={}, options={}",
            poll_id,
            poll.options.len()
        );
        Ok(poll)
    }

    async fn get_poll(&self, poll_id: &PollId) -> StoreResult<Option<Poll>> {
        match self.read_row(poll_id, |row| row.poll.clone()) {
            Ok(poll) => Ok(Some(poll)),
            Err(StoreError::PollNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete_poll(&self, poll_id: &PollId, requester: &VoterId) -> StoreResult<()> {
        self.ensure_available()?;
        let mut polls = self
            .polls
            .write()
            .map_err(|_| unavailable("poll table lock poisoned"))?;

        let row = polls
            .get(poll_id)
            .cloned()
            .ok_or(StoreError::PollNotFound(*poll_id))?;
        // Row stays locked until the outbox is purged, so no in-flight
        // transaction can append updates for this poll afterwards
        let mut guard = lock_row(&row)?;
        match &guard.poll.creator {
            Some(creator) if creator == requester => {}
            Some(_) => {
                return Err(StoreError::Forbidden(
                    "only the creator can delete a poll".to_string(),
                ));
            }
            None => {
                return Err(StoreError::Forbidden(
                    "anonymous polls cannot be deleted".to_string(),
                ));
            }
        }
        guard.deleted = true;
        polls.remove(poll_id);

        let mut outbox = self
            .outbox
            .lock()
            .map_err(|_| unavailable("outbox lock poisoned"))?;
        outbox.retain(|update| update.poll_id != *poll_id);
        drop(outbox);
        drop(guard);

        tracing::info!("🗑️ Poll deleted: poll={}", poll_id);
        Ok(())
    }

    async fn current_vote(&self, poll_id: &PollId, voter_id: &VoterId) -> StoreResult<Option<Vote>> {
        self.read_row(poll_id, |row| row.ledger.get(voter_id).cloned())
    }

    async fn tallies(&self, poll_id: &PollId) -> StoreResult<TallySnapshot> {
        self.read_row(poll_id, |row| TallySnapshot::from_poll(&row.poll))
    }

    async fn ledger_count(&self, poll_id: &PollId) -> StoreResult<u64> {
        self.read_row(poll_id, |row| row.ledger.len() as u64)
    }

    async fn cast_vote(
        &self,
        poll_id: &PollId,
        option_id: &OptionId,
        voter_id: &VoterId,
    ) -> StoreResult<Vote> {
        self.transact(poll_id, |row| {
            let index = row.option_index(option_id).ok_or(StoreError::InvalidOption {
                poll_id: *poll_id,
                option_id: *option_id,
            })?;

            if row.ledger.contains_key(voter_id) {
                return Err(StoreError::UniqueViolation(*poll_id));
            }

            let now = Utc::now();
            let vote = Vote {
                poll_id: *poll_id,
                voter_id: voter_id.clone(),
                option_id: *option_id,
                cast_at: now,
                updated_at: now,
            };
            row.ledger.insert(voter_id.clone(), vote.clone());
            let update = row.bump(index, true);

            Ok((vote, vec![update]))
        })
    }

    async fn change_vote(
        &self,
        poll_id: &PollId,
        old_option_id: &OptionId,
        new_option_id: &OptionId,
        voter_id: &VoterId,
    ) -> StoreResult<Vote> {
        self.transact(poll_id, |row| {
            let new_index = row
                .option_index(new_option_id)
                .ok_or(StoreError::InvalidOption {
                    poll_id: *poll_id,
                    option_id: *new_option_id,
                })?;

            let current = row.ledger.get(voter_id).map(|vote| vote.option_id);
            if current != Some(*old_option_id) {
                return Err(StoreError::StaleVote { current });
            }

            if old_option_id == new_option_id {
                let vote = row
                    .ledger
                    .get(voter_id)
                    .cloned()
                    .ok_or(StoreError::StaleVote { current: None })?;
                return Ok((vote, Vec::new()));
            }

            let old_index = row
                .option_index(old_option_id)
                .ok_or(StoreError::StaleVote { current })?;
            if row.poll.options[old_index].vote_count == 0 {
                return Err(unavailable("tally counter underflow"));
            }

            let vote = match row.ledger.get_mut(voter_id) {
                Some(vote) => {
                    vote.option_id = *new_option_id;
                    vote.updated_at = Utc::now();
                    vote.clone()
                }
                None => return Err(StoreError::StaleVote { current: None }),
            };
            let decremented = row.bump(old_index, false);
            let incremented = row.bump(new_index, true);

            Ok((vote, vec![decremented, incremented]))
        })
    }

    async fn drain_outbox(&self, limit: usize) -> StoreResult<Vec<TallyUpdate>> {
        self.ensure_available()?;
        let mut outbox = self
            .outbox
            .lock()
            .map_err(|_| unavailable("outbox lock poisoned"))?;
        let take = limit.min(outbox.len());
        Ok(outbox.drain(..take).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn tea_or_coffee(store: &InMemoryVoteStore) -> Poll {
        let new_poll = NewPoll::new(
            "Tea or coffee?",
            None,
            vec!["Tea".to_string(), "Coffee".to_string()],
        )
        .unwrap();
        store.create_poll(new_poll, None).await.unwrap()
    }

    #[tokio::test]
    async fn test_cast_vote_writes_ledger_counter_and_outbox() {
        let store = InMemoryVoteStore::new();
        let poll = tea_or_coffee(&store).await;
        let tea = poll.options[0].id;
        let voter = VoterId::new("v1").unwrap();

        let vote = store.cast_vote(&poll.id, &tea, &voter).await.unwrap();
        assert_eq!(vote.option_id, tea);

        let tallies = store.tallies(&poll.id).await.unwrap();
        assert_eq!(tallies.count(&tea), Some(1));
        assert_eq!(store.ledger_count(&poll.id).await.unwrap(), 1);

        let outbox = store.drain_outbox(10).await.unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].vote_count, 1);
        assert_eq!(outbox[0].version, 1);
        assert!(store.drain_outbox(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_uniqueness_constraint() {
        let store = InMemoryVoteStore::new();
        let poll = tea_or_coffee(&store).await;
        let voter = VoterId::new("v1").unwrap();

        store
            .cast_vote(&poll.id, &poll.options[0].id, &voter)
            .await
            .unwrap();
        let second = store.cast_vote(&poll.id, &poll.options[1].id, &voter).await;
        assert_eq!(second, Err(StoreError::UniqueViolation(poll.id)));

        // Rejected transaction leaves no trace
        let tallies = store.tallies(&poll.id).await.unwrap();
        assert_eq!(tallies.counts().iter().map(|(_, c)| c).sum::<u64>(), 1);
        assert_eq!(store.drain_outbox(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_change_vote_moves_one_vote() {
        let store = InMemoryVoteStore::new();
        let poll = tea_or_coffee(&store).await;
        let (tea, coffee) = (poll.options[0].id, poll.options[1].id);
        let voter = VoterId::new("v1").unwrap();

        store.cast_vote(&poll.id, &tea, &voter).await.unwrap();
        store.drain_outbox(10).await.unwrap();

        let vote = store
            .change_vote(&poll.id, &tea, &coffee, &voter)
            .await
            .unwrap();
        assert_eq!(vote.option_id, coffee);

        let tallies = store.tallies(&poll.id).await.unwrap();
        assert_eq!(tallies.count(&tea), Some(0));
        assert_eq!(tallies.count(&coffee), Some(1));

        let outbox = store.drain_outbox(10).await.unwrap();
        assert_eq!(outbox.len(), 2);
        assert_eq!((outbox[0].option_id, outbox[0].vote_count, outbox[0].version), (tea, 0, 2));
        assert_eq!((outbox[1].option_id, outbox[1].vote_count, outbox[1].version), (coffee, 1, 1));
    }

    #[tokio::test]
    async fn test_change_vote_rejections() {
        let store = InMemoryVoteStore::new();
        let poll = tea_or_coffee(&store).await;
        let (tea, coffee) = (poll.options[0].id, poll.options[1].id);
        let voter = VoterId::new("v2").unwrap();

        let never_voted = store.change_vote(&poll.id, &tea, &coffee, &voter).await;
        assert_eq!(never_voted, Err(StoreError::StaleVote { current: None }));

        store.cast_vote(&poll.id, &coffee, &voter).await.unwrap();
        let stale = store.change_vote(&poll.id, &tea, &coffee, &voter).await;
        assert_eq!(stale, Err(StoreError::StaleVote { current: Some(coffee) }));

        let foreign = OptionId::new();
        let invalid = store.change_vote(&poll.id, &coffee, &foreign, &voter).await;
        assert!(matches!(invalid, Err(StoreError::InvalidOption { .. })));

        let same = store
            .change_vote(&poll.id, &coffee, &coffee, &voter)
            .await
            .unwrap();
        assert_eq!(same.option_id, coffee);
        assert_eq!(store.tallies(&poll.id).await.unwrap().count(&coffee), Some(1));
    }

    #[tokio::test]
    async fn test_forced_contention_and_outage() {
        let store = InMemoryVoteStore::new();
        let poll = tea_or_coffee(&store).await;
        let voter = VoterId::new("v1").unwrap();

        store.force_contention(1);
        let busy = store.cast_vote(&poll.id, &poll.options[0].id, &voter).await;
        assert_eq!(busy, Err(StoreError::Contention));
        assert!(
            store
                .cast_vote(&poll.id, &poll.options[0].id, &voter)
                .await
                .is_ok()
        );

        store.set_available(false);
        assert!(matches!(
            store.tallies(&poll.id).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_available(true);
        assert_eq!(store.stats().unwrap().total_votes, 1);
    }

    #[tokio::test]
    async fn test_delete_poll_requires_creator() {
        let store = InMemoryVoteStore::new();
        let creator = VoterId::new("owner").unwrap();
        let new_poll = NewPoll::new("Lunch?", None, vec!["Pizza".into(), "Sushi".into()]).unwrap();
        let poll = store
            .create_poll(new_poll, Some(creator.clone()))
            .await
            .unwrap();
        store
            .cast_vote(&poll.id, &poll.options[0].id, &creator)
            .await
            .unwrap();

        let stranger = VoterId::new("stranger").unwrap();
        assert!(matches!(
            store.delete_poll(&poll.id, &stranger).await,
            Err(StoreError::Forbidden(_))
        ));

        store.delete_poll(&poll.id, &creator).await.unwrap();
        assert_eq!(store.get_poll(&poll.id).await.unwrap(), None);
        assert!(store.drain_outbox(10).await.unwrap().is_empty());

        let anonymous = tea_or_coffee(&store).await;
        assert!(matches!(
            store.delete_poll(&anonymous.id, &creator).await,
            Err(StoreError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_transaction_on_deleted_row_is_rejected() {
        let store = InMemoryVoteStore::new();
        let creator = VoterId::new("owner").unwrap();
        let new_poll = NewPoll::new("Lunch?", None, vec!["Pizza".into(), "Sushi".into()]).unwrap();
        let poll = store
            .create_poll(new_poll, Some(creator.clone()))
            .await
            .unwrap();
        let pizza = poll.options[0].id;

        // A transaction that looked the row up before the delete
        let stale_row = store.row(&poll.id).unwrap();
        store.delete_poll(&poll.id, &creator).await.unwrap();

        let voter = VoterId::new("late").unwrap();
        let result = store.transact_row(&poll.id, &stale_row, |row| {
            let index = row.option_index(&pizza).ok_or(StoreError::PollNotFound(poll.id))?;
            let update = row.bump(index, true);
            row.ledger.insert(
                voter.clone(),
                Vote {
                    poll_id: poll.id,
                    voter_id: voter.clone(),
                    option_id: pizza,
                    cast_at: Utc::now(),
                    updated_at: Utc::now(),
                },
            );
            Ok(((), vec![update]))
        });

        assert_eq!(result, Err(StoreError::PollNotFound(poll.id)));
        assert!(store.drain_outbox(10).await.unwrap().is_empty());
        assert_eq!(lock_row(&stale_row).unwrap().poll.options[0].vote_count, 0);
    }
}
