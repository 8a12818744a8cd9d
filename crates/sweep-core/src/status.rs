//! Row status state machine.
//!
//! ```text
//! ┌─────────┐  claim   ┌─────────┐  stage label  ┌──────────────┐
//! │ PENDING │─────────►│ CLAIMED │──────────────►│ STAGE(label) │◄─┐
//! └─────────┘          └─────────┘               └──────────────┘  │ any label
//!                           │                        │    └────────┘
//!                           │                        │
//!                           ├────────────────────────┤
//!                           ▼                        ▼
//!                     ┌───────────┐            ┌──────────┐
//!                     │  SUCCESS  │            │  FAILED  │
//!                     └───────────┘            └──────────┘
//! ```
//!
//! `pending` is implicit: an empty status cell reads as pending. Terminal
//! statuses accept no further transition, and nothing ever returns to
//! `pending` or `claimed`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

const PENDING: &str = "pending";
const CLAIMED: &str = "claimed";
const SUCCESS: &str = "success";
const FAILED: &str = "failed";

/// Status of a row in the parameter table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Status {
    /// Not yet claimed. Stored as an empty cell.
    #[default]
    Pending,
    /// Claimed by exactly one worker, no stage recorded yet.
    Claimed,
    /// Caller-defined intermediate stage (e.g. `clean`, `running`).
    Stage(String),
    /// Completed successfully.
    Success,
    /// Completed with a failure; detail lives in the row comment.
    Failed,
}

impl Status {
    /// Creates a stage status after validating the label.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the label is empty or collides with a
    /// reserved status word.
    pub fn stage(label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let trimmed = label.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidTransition {
                id: String::new(),
                from: String::new(),
                to: label,
                reason: "stage label must not be empty".into(),
            });
        }
        if is_reserved(trimmed) {
            return Err(Error::InvalidTransition {
                id: String::new(),
                from: String::new(),
                to: label.clone(),
                reason: format!("'{trimmed}' is a reserved status"),
            });
        }
        Ok(Self::Stage(trimmed.to_string()))
    }

    /// Returns true for `success` and `failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Returns true if the row is waiting to be claimed.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Returns true if the row is owned by a worker and not yet finished.
    #[must_use]
    pub const fn is_in_progress(&self) -> bool {
        matches!(self, Self::Claimed | Self::Stage(_))
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: &Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Claimed),
            Self::Claimed | Self::Stage(_) => {
                matches!(target, Self::Stage(_) | Self::Success | Self::Failed)
            }
            Self::Success | Self::Failed => false,
        }
    }

    /// Validates a transition for the given row, producing a descriptive error.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the state machine forbids the move.
    pub fn check_transition(&self, id: &str, target: &Self) -> Result<()> {
        if self.can_transition_to(target) {
            return Ok(());
        }

        let reason = match (self, target) {
            (Self::Success | Self::Failed, Self::Success | Self::Failed) => {
                "row already completed".to_string()
            }
            (Self::Success | Self::Failed, _) => "row is terminal".to_string(),
            (Self::Pending, _) => "row has not been claimed".to_string(),
            (_, Self::Pending | Self::Claimed) => "status cannot move backwards".to_string(),
            _ => "transition not allowed".to_string(),
        };

        Err(Error::InvalidTransition {
            id: id.to_string(),
            from: self.as_str().to_string(),
            to: target.as_str().to_string(),
            reason,
        })
    }

    /// Returns the string written into the `status` column.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "",
            Self::Claimed => CLAIMED,
            Self::Stage(label) => label,
            Self::Success => SUCCESS,
            Self::Failed => FAILED,
        }
    }

    /// Returns a coarse lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn class(&self) -> &'static str {
        match self {
            Self::Pending => PENDING,
            Self::Claimed => CLAIMED,
            Self::Stage(_) => "stage",
            Self::Success => SUCCESS,
            Self::Failed => FAILED,
        }
    }
}

fn is_reserved(label: &str) -> bool {
    [PENDING, CLAIMED, SUCCESS, FAILED]
        .iter()
        .any(|reserved| label.eq_ignore_ascii_case(reserved))
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str(PENDING),
            other => f.write_str(other.as_str()),
        }
    }
}

impl FromStr for Status {
    type Err = std::convert::Infallible;

    /// Parses a status cell. Any unrecognised non-empty value is a stage label.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        let status = if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(PENDING) {
            Self::Pending
        } else if trimmed.eq_ignore_ascii_case(CLAIMED) {
            Self::Claimed
        } else if trimmed.eq_ignore_ascii_case(SUCCESS) {
            Self::Success
        } else if trimmed.eq_ignore_ascii_case(FAILED) {
            Self::Failed
        } else {
            Self::Stage(trimmed.to_string())
        };
        Ok(status)
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(raw.parse().unwrap_or_default())
    }
}
