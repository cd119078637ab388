//! Outbox relay: publishes committed tally changes
//!
//! Only updates written by a committed transaction ever reach the outbox,
//! so viewers are never told about a change that rolled back.

use super::hub::TallyHub;
use crate::Result;
use crate::store::VoteStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Drains the store outbox into the tally hub
pub struct OutboxRelay {
    store: Arc<dyn VoteStore>,
    hub: Arc<TallyHub>,
    batch_size: usize,
    published: AtomicU64,
    delivered: AtomicU64,
    flushes: AtomicU64,
}

/// Relay counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayStats {
    pub flushes: u64,
    pub published: u64,
    /// Sum of subscribers reached over all published updates
    pub delivered: u64,
}

impl OutboxRelay {
    pub fn new(store: Arc<dyn VoteStore>, hub: Arc<TallyHub>, batch_size: usize) -> Self {
        Self {
            store,
            hub,
            batch_size: batch_size.max(1),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn hub(&self) -> &Arc<TallyHub> {
        &self.hub
    }

    /// Publish everything currently in the outbox, returning the count
    pub async fn flush(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let batch = self.store.drain_outbox(self.batch_size).await?;
            if batch.is_empty() {
                break;
            }
            let drained = batch.len();
            for update in batch {
                let reached = self.hub.publish(update);
                self.delivered.fetch_add(reached as u64, Ordering::Relaxed);
            }
            total += drained;
            if drained < self.batch_size {
                break;
            }
        }

        self.flushes.fetch_add(1, Ordering::Relaxed);
        if total > 0 {
            self.published.fetch_add(total as u64, Ordering::Relaxed);
            tracing::debug!("📤 Outbox relay published {} tally updates", total);
        }
        Ok(total)
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            flushes: self.flushes.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }
}

/// Background service that flushes the outbox on an interval
///
/// Covers commits whose caller went away before flushing.
pub struct OutboxRelayService {
    relay: Arc<OutboxRelay>,
    stop_signal: tokio::sync::mpsc::Receiver<()>,
    flush_interval: Duration,
}

impl OutboxRelayService {
    pub fn new(
        relay: Arc<OutboxRelay>,
        stop_signal: tokio::sync::mpsc::Receiver<()>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            relay,
            stop_signal,
            flush_interval,
        }
    }

    /// Run until the stop signal fires or its sender is dropped
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.flush_interval);

        tracing::info!(
            "📮 Outbox relay service started (interval: {:?})",
            self.flush_interval
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.relay.flush().await {
                        tracing::error!("❌ Outbox flush failed: {}", e);
                    }
                }
                _ = self.stop_signal.recv() => {
                    tracing::info!("🛑 Outbox relay service stopping");
                    break;
                }
            }
        }

        // Publish whatever committed while we were shutting down
        if let Err(e) = self.relay.flush().await {
            tracing::error!("❌ Final outbox flush failed: {}", e);
        }
        tracing::info!("✅ Outbox relay service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryVoteStore, VoteStore};
    use crate::types::{NewPoll, VoterId};

    #[tokio::test]
    async fn test_flush_publishes_in_batches() {
        let store = Arc::new(InMemoryVoteStore::new());
        let hub = Arc::new(TallyHub::new(64));
        let relay = OutboxRelay::new(store.clone(), hub.clone(), 2);

        let new_poll = NewPoll::new("Pick one", None, vec!["A".into(), "B".into()]).unwrap();
        let poll = store.create_poll(new_poll, None).await.unwrap();
        let mut subscription = hub.subscribe(&poll.id).unwrap();

        for i in 0..5 {
            let voter = VoterId::new(format!("voter-{i}")).unwrap();
            store
                .cast_vote(&poll.id, &poll.options[0].id, &voter)
                .await
                .unwrap();
        }

        assert_eq!(relay.flush().await.unwrap(), 5);
        assert_eq!(relay.flush().await.unwrap(), 0);

        let mut last = None;
        while let Some(update) = subscription.try_recv() {
            last = Some(update);
        }
        assert_eq!(last.map(|u| (u.vote_count, u.version)), Some((5, 5)));

        let stats = relay.stats();
        assert_eq!(stats.published, 5);
        assert_eq!(stats.delivered, 5);
    }

    #[tokio::test]
    async fn test_service_flushes_and_stops() {
        let store = Arc::new(InMemoryVoteStore::new());
        let hub = Arc::new(TallyHub::new(64));
        let relay = Arc::new(OutboxRelay::new(store.clone(), hub.clone(), 16));

        let new_poll = NewPoll::new("Pick one", None, vec!["A".into(), "B".into()]).unwrap();
        let poll = store.create_poll(new_poll, None).await.unwrap();
        let mut subscription = hub.subscribe(&poll.id).unwrap();

        let (stop_tx, stop_rx) = tokio::sync::mpsc::channel(1);
        let service = OutboxRelayService::new(relay.clone(), stop_rx, Duration::from_millis(10));
        let handle = tokio::spawn(service.run());

        let voter = VoterId::new("late").unwrap();
        store
            .cast_vote(&poll.id, &poll.options[1].id, &voter)
            .await
            .unwrap();

        let update = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.option_id, poll.options[1].id);

        stop_tx.send(()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
