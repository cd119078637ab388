//! Viewer-side tally state
//!
//! Merge rule: per option, the update with the highest version wins. Equal
//! versions carry equal counts, so re-applying an update changes nothing,
//! and updates may arrive in any order.

use crate::types::{OptionId, OptionTally, PollId, TallySnapshot, TallyUpdate};
use serde::{Deserialize, Serialize};

/// Locally held tallies of one poll, kept current from notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveTallies {
    poll_id: PollId,
    options: Vec<OptionTally>,
}

impl LiveTallies {
    pub fn from_snapshot(snapshot: TallySnapshot) -> Self {
        Self {
            poll_id: snapshot.poll_id,
            options: snapshot.options,
        }
    }

    pub fn poll_id(&self) -> &PollId {
        &self.poll_id
    }

    /// Merge one update; returns whether the displayed count changed
    ///
    /// Updates for other polls or unknown options are ignored.
    pub fn apply(&mut self, update: &TallyUpdate) -> bool {
        if update.poll_id != self.poll_id {
            return false;
        }
        match self
            .options
            .iter_mut()
            .find(|tally| tally.option_id == update.option_id)
        {
            Some(tally) if update.version > tally.version => {
                let changed = tally.vote_count != update.vote_count;
                tally.vote_count = update.vote_count;
                tally.version = update.version;
                changed
            }
            _ => false,
        }
    }

    /// Merge a full read from the store
    ///
    /// Options follow the snapshot; for each one the newer of the local and
    /// the fetched value is kept.
    pub fn reconcile(&mut self, snapshot: &TallySnapshot) {
        if snapshot.poll_id != self.poll_id {
            return;
        }
        let merged = snapshot
            .options
            .iter()
            .map(|fetched| {
                match self
                    .options
                    .iter()
                    .find(|local| local.option_id == fetched.option_id)
                {
                    Some(local) if local.version > fetched.version => local.clone(),
                    _ => fetched.clone(),
                }
            })
            .collect();
        self.options = merged;
    }

    pub fn count(&self, option_id: &OptionId) -> Option<u64> {
        self.options
            .iter()
            .find(|tally| tally.option_id == *option_id)
            .map(|tally| tally.vote_count)
    }

    pub fn total(&self) -> u64 {
        self.options.iter().map(|tally| tally.vote_count).sum()
    }

    /// Current state as a snapshot (for percentages and leaders)
    pub fn snapshot(&self) -> TallySnapshot {
        TallySnapshot {
            poll_id: self.poll_id,
            options: self.options.clone(),
        }
    }
}
