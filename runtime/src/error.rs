//! Failure taxonomy for the network path.
//!
//! Every request issued on behalf of a strategy ends in one of these
//! classes, and each class maps to exactly one driver reaction: transient
//! failures get one more paced attempt, blocks feed the backoff budget, and
//! structural failures disqualify the strategy for the current unit.

use thiserror::Error;

/// Errors surfaced by [`crate::acquisition::fetch::FetchContext`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Timeout, connection reset, DNS failure.
    #[error("transient network failure: {0}")]
    Transient(String),

    /// HTTP 429/403, a bot-challenge page, or a transient failure that
    /// persisted past its single retry.
    #[error("blocked{}: {reason}", status_suffix(.status))]
    Blocked {
        status: Option<u16>,
        reason: String,
        captcha: bool,
    },

    /// The response does not have the shape the strategy expects.
    #[error("unexpected response shape: {0}")]
    Structural(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl FetchError {
    /// Build a block from an HTTP status code.
    pub fn blocked_status(status: u16) -> Self {
        Self::Blocked {
            status: Some(status),
            reason: format!("server answered {status}"),
            captcha: false,
        }
    }

    /// Build a block caused by a CAPTCHA or bot-challenge page.
    pub fn captcha(marker: &str) -> Self {
        Self::Blocked {
            status: None,
            reason: format!("CAPTCHA encountered ({marker})"),
            captcha: true,
        }
    }

    /// Whether the error is a block of any kind.
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}
