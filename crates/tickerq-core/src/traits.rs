//! Core traits for tickerq abstractions.
//!
//! These traits define the interfaces that concrete stores must satisfy.
//! `tickerq-db` provides PostgreSQL implementations and an in-memory store
//! used by tests; the worker runtime only ever sees these traits.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// JOB REPOSITORY TRAITS
// =============================================================================

/// Repository for analysis job queue operations.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Create a pending job for the ticker, or return its active job.
    ///
    /// With `force`, active jobs are cancelled first and a new job is always
    /// created. Losing an insert race to a concurrent enqueuer is not an
    /// error: the winner's job is returned.
    async fn enqueue(&self, req: EnqueueRequest) -> Result<Job>;

    /// Cancel the ticker's active job, if any. Returns the cancelled jobs.
    async fn cancel_active(&self, ticker: &str) -> Result<Vec<Job>>;

    /// Claim the highest-priority, oldest eligible pending job.
    ///
    /// Rows being claimed by other callers are skipped, never waited on.
    async fn claim_next(&self) -> Result<Option<Job>>;

    /// Get job by ID.
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// All jobs for a ticker, newest first.
    async fn get_for_ticker(&self, ticker: &str) -> Result<Vec<Job>>;

    /// Move a job to `status`, merging the patch fields.
    ///
    /// Fails with `InvalidTransition` when the state machine forbids the move
    /// and with `JobNotFound` for unknown ids.
    async fn update_status(&self, job_id: Uuid, status: JobStatus, patch: StatusPatch)
        -> Result<Job>;

    /// Report the outcome of the claim that started at `claimed_at`.
    ///
    /// Behaves like [`update_status`](Self::update_status), but only while the
    /// job is still processing under that same claim. A job that was reaped
    /// (and possibly claimed again) fails with `ClaimLost`; a job that already
    /// reached a terminal state fails with `InvalidTransition`.
    async fn finish_claim(
        &self,
        job_id: Uuid,
        claimed_at: DateTime<Utc>,
        status: JobStatus,
        patch: StatusPatch,
    ) -> Result<Job>;

    /// Record the current pipeline step and clear the last error.
    async fn update_progress(
        &self,
        job_id: Uuid,
        step: &str,
        details: Option<JsonValue>,
    ) -> Result<()>;

    /// Return jobs stuck in processing longer than `timeout` to pending.
    async fn reap_stuck(&self, timeout: Duration) -> Result<u64>;

    /// Get queue statistics.
    async fn queue_stats(&self) -> Result<QueueStats>;

    /// List recent jobs, newest first.
    async fn list_recent(&self, limit: i64) -> Result<Vec<Job>>;

    /// Delete the oldest terminal jobs, keeping the newest `keep_count`.
    async fn cleanup(&self, keep_count: i64) -> Result<u64>;
}

// =============================================================================
// PHASE TRACKER TRAITS
// =============================================================================

/// Per-ticker pipeline phase flags, serialized by a per-ticker named lock.
#[async_trait]
pub trait PhaseTracker: Send + Sync {
    /// Clear all three phase flags on every record for the ticker.
    ///
    /// Returns the number of records touched; zero is not an error.
    async fn reset_phase_flags(&self, ticker: &str) -> Result<u64>;

    /// Set one phase flag on every record for the ticker.
    async fn mark_phase_complete(&self, ticker: &str, phase: Phase) -> Result<u64>;

    /// Tickers pending review with unfinished phases and no active job.
    async fn list_incomplete(&self) -> Result<Vec<String>>;

    /// Phase flags of every record for the ticker.
    async fn phase_flags(&self, ticker: &str) -> Result<Vec<PhaseFlags>>;
}

// =============================================================================
// SCORE REPOSITORY TRAITS
// =============================================================================

/// Score records owned by the analyzer; the queue only writes placeholders.
#[async_trait]
pub trait ScoreRepository: Send + Sync {
    /// Ensure an "analyzing" placeholder exists for the ticker.
    ///
    /// A completed record with a final score is left alone unless `force`.
    /// Returns whether the placeholder was written.
    async fn ensure_placeholder(&self, ticker: &str, force: bool) -> Result<bool>;

    /// Fetch the ticker's score record.
    async fn get_score(&self, ticker: &str) -> Result<Option<ScoreRecord>>;
}
