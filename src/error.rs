//! Crate-wide error taxonomy.
//!
//! Nothing above a [`crate::worker::SequenceWorker`] is meant to see
//! these as exceptions — the [`crate::runner::ParallelRunner`] collects
//! them into per-worker outcomes instead of propagating panics or
//! aborting the run.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced anywhere in the orchestration pipeline.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoryBenchError {
    /// Invalid model spec, missing provider credentials, or malformed
    /// battery. Fatal at run start.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Assembled context exceeds the model's usable context window.
    /// Fatal for the task that produced it; the run continues.
    #[error("context overflow for {task}: {tokens} tokens + {max_output_tokens} max output + {safety_margin} margin > {context_window} window")]
    ContextOverflow {
        /// Human-readable task identifier (`model/sequence/run_index/prompt_index`).
        task: String,
        /// Token count of the assembled input.
        tokens: u32,
        /// The model's declared max output tokens.
        max_output_tokens: u32,
        /// The model's configured safety margin.
        safety_margin: u32,
        /// The model's declared context window.
        context_window: u32,
    },

    /// Transient provider failure (HTTP 5xx, rate limit, network reset).
    /// Retried per the configured `retry_schedule`.
    #[error("retryable provider error: {0}")]
    Retryable(String),

    /// Provider returned a definitive failure. The worker fails; the run
    /// continues.
    #[error("terminal provider error: {0}")]
    Terminal(String),

    /// Deadline exceeded on a generator call.
    #[error("generator call timed out after {0:?}")]
    Timeout(Duration),

    /// The Rate Governor refused the call because the provider's circuit
    /// is open.
    #[error("circuit open for provider '{provider_tag}', reopens at {reopen_at_epoch_ms}")]
    CircuitOpen {
        /// The provider whose circuit is open.
        provider_tag: String,
        /// Epoch milliseconds at which a half-open probe will be admitted.
        reopen_at_epoch_ms: u64,
    },

    /// A non-blocking `acquire` found no capacity.
    #[error("no rate-limit capacity available for provider '{0}'")]
    RateCapacityUnavailable(String),

    /// Duplicate `task_key` on insert; the caller treats this as
    /// "already done," not a failure.
    #[error("artifact already exists for task key {0}")]
    StoreConflict(String),

    /// Cooperative stop was requested; not a failure.
    #[error("operation cancelled")]
    Cancelled,

    /// Judge output could not be fully parsed into scores.
    #[error("verdict parse error: {0}")]
    VerdictParse(String),

    /// Any durable-store failure not covered by [`StoryBenchError::StoreConflict`].
    #[error("artifact store error: {0}")]
    Store(#[from] StoreBackendError),
}

/// Opaque wrapper around the durable store's native error type, kept
/// separate from [`StoryBenchError::Store`]'s `#[from]` so store
/// implementations don't need to depend on this crate's error enum.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StoreBackendError(pub String);

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoryBenchError>;

impl StoryBenchError {
    /// Whether this error should be retried per the provider's
    /// `retry_schedule` (`Timeout` is retryable while retries remain).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoryBenchError::Retryable(_) | StoryBenchError::Timeout(_)
        )
    }
}
