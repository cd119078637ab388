//! # Core Types for the Poll Vote Ledger
//!
//! This module defines the data structures shared by the ledger, the tally
//! store, the transaction engine and the notification channel.
//!
//! ## Type Categories
//!
//! ### Identifiers
//! - [`PollId`], [`OptionId`]: UUID v4 identifiers
//! - [`VoterId`]: opaque voter identity (account id or anonymous token)
//!
//! ### Entities
//! - [`Poll`]: question, optional description, options
//! - [`PollOption`]: one answer with its live `vote_count`
//! - [`Vote`]: one ledger row per `(poll, voter)`
//!
//! ### Tallies
//! - [`TallyUpdate`]: absolute, versioned count for one option
//! - [`TallySnapshot`]: full read of a poll's tallies with totals and percentages
//!
//! ## Usage Examples
//!
//! ```rust
//! use livepoll::types::NewPoll;
//!
//! let poll = NewPoll::new(
//!     "  Tea or coffee?  ",
//!     None,
//!     vec!["Tea".to_string(), "".to_string(), "Coffee".to_string()],
//! )
//! .unwrap();
//!
//! assert_eq!(poll.question, "Tea or coffee?");
//! assert_eq!(poll.options, vec!["Tea", "Coffee"]);
//! ```

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum question length in characters
pub const MAX_QUESTION_LENGTH: usize = 200;

/// Maximum description length in characters
pub const MAX_DESCRIPTION_LENGTH: usize = 300;

/// Maximum option text length in characters
pub const MAX_OPTION_LENGTH: usize = 100;

/// Minimum number of options per poll
pub const MIN_OPTIONS: usize = 2;

/// Maximum number of options per poll
pub const MAX_OPTIONS: usize = 10;

/// Poll identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PollId(Uuid);

impl PollId {
    /// Generate a new random poll id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PollId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PollId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PollId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::validation("poll_id", "not a valid UUID"))
    }
}

/// Option identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionId(Uuid);

impl OptionId {
    /// Generate a new random option id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for OptionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::validation("option_id", "not a valid UUID"))
    }
}

/// Opaque voter identity
///
/// Either an authenticated account id or a locally generated anonymous
/// token. The ledger only relies on it being stable for one voter; it is
/// neither signed nor bound to a server-side session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoterId(String);

impl VoterId {
    /// Wrap a raw identity string, rejecting blank values
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(Error::validation("voter_id", "must not be empty"));
        }
        Ok(Self(raw))
    }

    /// Generate a fresh anonymous token
    pub fn anonymous() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short blake3 fingerprint, safe to put in logs
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(self.0.as_bytes());
        hex::encode(&hash.as_bytes()[..4])
    }
}

impl fmt::Display for VoterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A poll as stored, with its options in creation order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poll {
    pub id: PollId,
    pub question: String,
    pub description: Option<String>,
    /// `None` for anonymous polls
    pub creator: Option<VoterId>,
    pub options: Vec<PollOption>,
    pub created_at: DateTime<Utc>,
}

impl Poll {
    /// Whether the option belongs to this poll
    pub fn has_option(&self, option_id: &OptionId) -> bool {
        self.options.iter().any(|option| option.id == *option_id)
    }

    pub fn option(&self, option_id: &OptionId) -> Option<&PollOption> {
        self.options.iter().find(|option| option.id == *option_id)
    }
}

/// One selectable answer with its cached vote count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOption {
    pub id: OptionId,
    pub poll_id: PollId,
    pub text: String,
    /// Creation order within the poll
    pub position: u32,
    /// Number of ledger rows referencing this option
    pub vote_count: u64,
    /// Bumped on every counter mutation
    pub version: u64,
}

/// Ledger row: the vote of one voter in one poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub poll_id: PollId,
    pub voter_id: VoterId,
    pub option_id: OptionId,
    pub cast_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Absolute count of one option after a committed change
///
/// Carries the new count, never a delta, so applying it twice is harmless.
/// `version` orders updates for the same option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TallyUpdate {
    pub poll_id: PollId,
    pub option_id: OptionId,
    pub vote_count: u64,
    pub version: u64,
}

/// Count of one option inside a [`TallySnapshot`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionTally {
    pub option_id: OptionId,
    pub text: String,
    pub vote_count: u64,
    pub version: u64,
}

impl From<&PollOption> for OptionTally {
    fn from(option: &PollOption) -> Self {
        Self {
            option_id: option.id,
            text: option.text.clone(),
            vote_count: option.vote_count,
            version: option.version,
        }
    }
}

/// Full read of a poll's tallies, in option creation order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallySnapshot {
    pub poll_id: PollId,
    pub options: Vec<OptionTally>,
}

impl TallySnapshot {
    pub fn from_poll(poll: &Poll) -> Self {
        Self {
            poll_id: poll.id,
            options: poll.options.iter().map(OptionTally::from).collect(),
        }
    }

    /// Total votes across all options
    pub fn total(&self) -> u64 {
        self.options.iter().map(|tally| tally.vote_count).sum()
    }

    pub fn count(&self, option_id: &OptionId) -> Option<u64> {
        self.options
            .iter()
            .find(|tally| tally.option_id == *option_id)
            .map(|tally| tally.vote_count)
    }

    /// Share of the total, rounded to the nearest whole percent
    ///
    /// Returns 0 when nobody has voted yet, `None` for unknown options.
    pub fn percent(&self, option_id: &OptionId) -> Option<u64> {
        let count = self.count(option_id)?;
        let total = self.total();
        if total == 0 {
            return Some(0);
        }
        Some((count * 200 + total) / (total * 2))
    }

    /// Options sharing the highest non-zero count
    pub fn leaders(&self) -> Vec<OptionId> {
        let max = self
            .options
            .iter()
            .map(|tally| tally.vote_count)
            .max()
            .unwrap_or(0);
        if max == 0 {
            return Vec::new();
        }
        self.options
            .iter()
            .filter(|tally| tally.vote_count == max)
            .map(|tally| tally.option_id)
            .collect()
    }

    /// `(option, count)` pairs in creation order
    pub fn counts(&self) -> Vec<(OptionId, u64)> {
        self.options
            .iter()
            .map(|tally| (tally.option_id, tally.vote_count))
            .collect()
    }
}

/// Validated input for creating a poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPoll {
    pub question: String,
    pub description: Option<String>,
    pub options: Vec<String>,
}

impl NewPoll {
    /// Trim and validate user-entered poll content
    ///
    /// Blank option entries are dropped before counting, the same way the
    /// creation form ignores empty rows.
    pub fn new(
        question: impl AsRef<str>,
        description: Option<&str>,
        options: Vec<String>,
    ) -> Result<Self> {
        let question = question.as_ref().trim().to_string();
        if question.is_empty() {
            return Err(Error::validation("question", "please enter a question"));
        }
        if question.chars().count() > MAX_QUESTION_LENGTH {
            return Err(Error::validation(
                "question",
                format!("must be {MAX_QUESTION_LENGTH} characters or less"),
            ));
        }

        let description = description
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string);
        if let Some(text) = &description {
            if text.chars().count() > MAX_DESCRIPTION_LENGTH {
                return Err(Error::validation(
                    "description",
                    format!("must be {MAX_DESCRIPTION_LENGTH} characters or less"),
                ));
            }
        }

        let options: Vec<String> = options
            .iter()
            .map(|text| text.trim())
            .filter(|text| !text.is_empty())
            .map(str::to_string)
            .collect();

        if options.len() < MIN_OPTIONS {
            return Err(Error::validation(
                "options",
                format!("please provide at least {MIN_OPTIONS} valid options"),
            ));
        }
        if options.len() > MAX_OPTIONS {
            return Err(Error::validation(
                "options",
                format!("at most {MAX_OPTIONS} options are allowed"),
            ));
        }
        if let Some(text) = options
            .iter()
            .find(|text| text.chars().count() > MAX_OPTION_LENGTH)
        {
            return Err(Error::validation(
                "options",
                format!("\"{text}\" is longer than {MAX_OPTION_LENGTH} characters"),
            ));
        }

        Ok(Self {
            question,
            description,
            options,
        })
    }
}
