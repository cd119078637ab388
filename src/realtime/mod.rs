//! Change notification channel
//!
//! Committed tally changes reach viewers in three steps:
//! 1. the store writes a [`TallyUpdate`](crate::types::TallyUpdate) to its
//!    outbox inside the vote transaction
//! 2. the [`OutboxRelay`] drains the outbox and publishes to the [`TallyHub`]
//! 3. each viewer merges updates into its [`LiveTallies`] by option, keeping
//!    the highest version
//!
//! Delivery is best effort while subscribed. A fresh read through
//! [`LiveTallies::reconcile`] always repairs missed messages.

pub mod hub;
pub mod live;
pub mod outbox;

pub use hub::{TallyHub, TallySubscription, Unsubscribe};
pub use live::LiveTallies;
pub use outbox::{OutboxRelay, OutboxRelayService, RelayStats};
