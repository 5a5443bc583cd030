//! Error taxonomy for the turn pipeline.
//!
//! Component failures travel as data (`ToolErrorKind` inside a
//! `ToolResult`), never as exceptions; only orchestrator-level structural
//! failures (`TurnError`) abort a turn.

use serde::{Deserialize, Serialize};

/// Closed set of non-fatal action failure kinds.
///
/// Every adapter error must map into one of these; the synthesizer
/// translates them into natural-language degradation and the raw kind
/// never reaches the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// Action exceeded its per-action timeout.
    Timeout,
    /// The external service rejected the delegated credential.
    AuthDenied,
    /// The external service rate-limited the call.
    RateLimited,
    /// The requested entity does not exist.
    NotFound,
    /// Budget ledger refused the reservation for this paid action.
    BudgetExceeded,
    /// Anything the adapter could not classify.
    Unknown,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::AuthDenied => "auth_denied",
            Self::RateLimited => "rate_limited",
            Self::NotFound => "not_found",
            Self::BudgetExceeded => "budget_exceeded",
            Self::Unknown => "unknown",
        }
    }

    /// User-facing degradation phrase, consumed by the synthesizer prompt.
    pub fn degradation(&self, what: &str) -> String {
        match self {
            Self::Timeout => format!("I couldn't reach {} in time.", what),
            Self::AuthDenied => format!("I don't currently have permission to access {}.", what),
            Self::RateLimited => format!("{} is temporarily overloaded; I couldn't check it.", what),
            Self::NotFound => format!("I looked, but couldn't find anything in {}.", what),
            Self::BudgetExceeded => {
                format!("I skipped the live {} lookup to stay within today's usage limit.", what)
            }
            Self::Unknown => format!("Something went wrong while checking {}.", what),
        }
    }
}

/// Fatal, orchestrator-level failures. A turn hitting one of these
/// transitions to `Failed` and the client gets the generic apology.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    /// Another turn in the same session held the lock past the deadline.
    #[error("session lock not acquired within {0:?}")]
    SessionLockTimeout(std::time::Duration),

    /// The synthesizer could not produce any response text.
    #[error("response synthesis failed: {0}")]
    SynthesisFailure(String),

    /// Client connection dropped before the turn completed.
    #[error("turn cancelled by client")]
    Cancelled,

    /// Session/turn persistence failed.
    #[error("session store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Fixed, non-technical apology sent when a turn fails structurally.
pub const APOLOGY: &str =
    "I'm sorry, something went wrong on my end and I couldn't finish that. Please try again.";
