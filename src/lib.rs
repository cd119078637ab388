//! Live Poll Vote Ledger
//!
//! One vote per voter per poll, tallies kept transactionally beside the
//! ledger, and committed tally changes pushed to every viewer of a poll.

pub mod config;
pub mod engine;
pub mod errors;
pub mod identity;
pub mod realtime;
pub mod session;
pub mod store;
pub mod templates;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use engine::{VoteEngine, VoteResult};
pub use errors::{Error, Result, VoteError};
pub use identity::IdentityResolver;
pub use realtime::{LiveTallies, TallyHub, Unsubscribe};
pub use session::{VoteSession, VoteState, VoteStatus};
pub use store::{InMemoryVoteStore, VoteStore};
pub use types::{NewPoll, OptionId, Poll, PollId, TallySnapshot, TallyUpdate, Vote, VoterId};

use config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging from `RUST_LOG` (default `livepoll=info`)
pub fn init() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "livepoll=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| Error::internal(format!("Failed to install logger: {e}")))?;

    tracing::info!("🗳️  Live poll ledger v{} initialized", VERSION);
    Ok(())
}

/// Initialize logging from configuration
///
/// `RUST_LOG` still wins over `logging.level` when set.
pub fn init_with(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("livepoll={}", logging.level).into());

    let installed = match logging.format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };
    installed.map_err(|e| Error::internal(format!("Failed to install logger: {e}")))?;

    tracing::info!(
        "🗳️  Live poll ledger v{} initialized ({} logs)",
        VERSION,
        logging.format
    );
    Ok(())
}
