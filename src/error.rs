//! Failure taxonomy shared across the ingest, queue, and pipeline layers.

use serde::{Deserialize, Serialize};

/// Convenience alias used at service boundaries.
pub type Result<T> = anyhow::Result<T>;

/// Classified failure kinds surfaced by the core.
///
/// The worker dispatches on these: retryable kinds release the item back to
/// the queue, terminal kinds finish it immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Network,
    ScraperFailed,
    ParseFailed,
    Blocked,
    LlmFailed,
    RateLimited,
    StorageTransient,
    StoragePrecondition,
    StopListed,
    Duplicate,
    BelowThreshold,
    ConfigUnavailable,
    Internal,
}

impl ErrorKind {
    /// Whether a failure of this kind should be retried via release.
    ///
    /// Stop-list, duplicate, and threshold outcomes are skips, not failures;
    /// they never reach the retry path. Precondition failures indicate a
    /// programming or data-model error and fail the item immediately.
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            ErrorKind::StoragePrecondition
                | ErrorKind::StopListed
                | ErrorKind::Duplicate
                | ErrorKind::BelowThreshold
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "NETWORK",
            ErrorKind::ScraperFailed => "SCRAPER_FAILED",
            ErrorKind::ParseFailed => "PARSE_FAILED",
            ErrorKind::Blocked => "BLOCKED",
            ErrorKind::LlmFailed => "LLM_FAILED",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::StorageTransient => "STORAGE_TRANSIENT",
            ErrorKind::StoragePrecondition => "STORAGE_PRECONDITION",
            ErrorKind::StopListed => "STOP_LISTED",
            ErrorKind::Duplicate => "DUPLICATE",
            ErrorKind::BelowThreshold => "BELOW_THRESHOLD",
            ErrorKind::ConfigUnavailable => "CONFIG_UNAVAILABLE",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
