//! Per-poll publish/subscribe topics

use crate::types::{OptionId, PollId, TallyUpdate};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;

/// Fan-out of tally updates, one broadcast topic per poll
pub struct TallyHub {
    topics: RwLock<HashMap<PollId, broadcast::Sender<TallyUpdate>>>,
    capacity: usize,
}

impl TallyHub {
    /// Create a hub whose topics buffer `capacity` updates per subscriber
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to the updates of one poll
    pub fn subscribe(&self, poll_id: &PollId) -> Result<TallySubscription> {
        let mut topics = self
            .topics
            .write()
            .map_err(|_| Error::internal("Tally hub write error"))?;
        let receiver = topics
            .entry(*poll_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        tracing::debug!("📡 New tally subscriber for poll {}", poll_id);
        Ok(TallySubscription {
            poll_id: *poll_id,
            receiver,
        })
    }

    /// Subscribe with a callback invoked as `(option_id, vote_count)`
    ///
    /// Only counts newer than the last one forwarded for an option reach the
    /// callback, so late or duplicated updates never roll a count back.
    /// Delivery runs on a spawned task, so this must be called from within
    /// a tokio runtime. Dropping the returned handle stops delivery.
    pub fn subscribe_with<F>(&self, poll_id: &PollId, mut on_update: F) -> Result<Unsubscribe>
    where
        F: FnMut(OptionId, u64) + Send + 'static,
    {
        let mut subscription = self.subscribe(poll_id)?;
        let handle = tokio::spawn(async move {
            let mut forwarded: HashMap<OptionId, u64> = HashMap::new();
            while let Some(update) = subscription.recv().await {
                match forwarded.get(&update.option_id) {
                    Some(&version) if update.version <= version => {
                        tracing::trace!(
                            "⏭️ Skipping stale update v{} for option {}",
                            update.version,
                            update.option_id
                        );
                    }
                    _ => {
                        forwarded.insert(update.option_id, update.version);
                        on_update(update.option_id, update.vote_count);
                    }
                }
            }
        });
        Ok(Unsubscribe { handle })
    }

    /// Publish one update, returning how many subscribers received it
    pub fn publish(&self, update: TallyUpdate) -> usize {
        let delivered = match self.topics.read() {
            Ok(topics) => match topics.get(&update.poll_id) {
                Some(sender) => sender.send(update).ok(),
                None => return 0,
            },
            Err(_) => {
                tracing::error!("❌ Tally hub read error, dropping update");
                return 0;
            }
        };

        match delivered {
            Some(count) => count,
            None => {
                // Every receiver is gone
                self.remove_if_idle(&update.poll_id);
                0
            }
        }
    }

    /// Number of live subscribers for a poll
    pub fn subscriber_count(&self, poll_id: &PollId) -> usize {
        self.topics
            .read()
            .ok()
            .and_then(|topics| topics.get(poll_id).map(|sender| sender.receiver_count()))
            .unwrap_or(0)
    }

    /// Number of polls with an open topic
    pub fn topic_count(&self) -> usize {
        self.topics.read().map(|topics| topics.len()).unwrap_or(0)
    }

    /// Drop topics nobody listens to, returning how many were removed
    pub fn prune(&self) -> usize {
        match self.topics.write() {
            Ok(mut topics) => {
                let before = topics.len();
                topics.retain(|_, sender| sender.receiver_count() > 0);
                before - topics.len()
            }
            Err(_) => 0,
        }
    }

    fn remove_if_idle(&self, poll_id: &PollId) {
        if let Ok(mut topics) = self.topics.write() {
            if topics
                .get(poll_id)
                .is_some_and(|sender| sender.receiver_count() == 0)
            {
                topics.remove(poll_id);
            }
        }
    }
}

/// Receiving side of one poll's topic
pub struct TallySubscription {
    poll_id: PollId,
    receiver: broadcast::Receiver<TallyUpdate>,
}

impl TallySubscription {
    pub fn poll_id(&self) -> &PollId {
        &self.poll_id
    }

    /// Wait for the next update; `None` once the hub is gone
    ///
    /// A subscriber that falls behind skips the overwritten updates.
    pub async fn recv(&mut self) -> Option<TallyUpdate> {
        loop {
            match self.receiver.recv().await {
                Ok(update) => return Some(update),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "⚠️ Tally subscriber for poll {} lagged, {} updates skipped",
                        self.poll_id,
                        skipped
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next update if one is already buffered
    pub fn try_recv(&mut self) -> Option<TallyUpdate> {
        loop {
            match self.receiver.try_recv() {
                Ok(update) => return Some(update),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "⚠️ Tally subscriber for poll {} lagged, {} updates skipped",
                        self.poll_id,
                        skipped
                    );
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

/// Handle of a callback subscription; dropping it unsubscribes
pub struct Unsubscribe {
    handle: JoinHandle<()>,
}

impl Unsubscribe {
    /// Stop delivering updates
    pub fn cancel(self) {
        self.handle.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
