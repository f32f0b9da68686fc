//! Core data models for the analysis job queue.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::defaults;
use crate::error::{Error, Result};

/// Longest ticker symbol accepted (covers suffixed symbols like `BRK.B`, `EURUSD=X`).
pub const MAX_TICKER_LEN: usize = 16;

/// Normalize a ticker symbol: trim surrounding whitespace and upper-case it.
///
/// Vendor notations (`^GSPC`, `EURUSD=X`, `BF_B`, `BRK-B`) pass through
/// untouched. Rejects empty symbols, symbols longer than [`MAX_TICKER_LEN`]
/// characters, and symbols with inner whitespace or control characters.
pub fn normalize_ticker(raw: &str) -> Result<String> {
    let ticker = raw.trim().to_ascii_uppercase();
    if ticker.is_empty() {
        return Err(Error::InvalidInput("ticker must not be empty".into()));
    }
    if ticker.chars().count() > MAX_TICKER_LEN {
        return Err(Error::InvalidInput(format!(
            "ticker '{}' exceeds {} characters",
            ticker, MAX_TICKER_LEN
        )));
    }
    if ticker.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::InvalidInput(format!(
            "ticker {:?} contains whitespace or control characters",
            ticker
        )));
    }
    Ok(ticker)
}

// =============================================================================
// JOB TYPES
// =============================================================================

/// Status of an analysis job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Statuses that occupy a ticker's single active-job slot.
    pub const ACTIVE: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Processing];

    /// Database / wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Pending or processing.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }

    /// Completed, failed or cancelled. No transition leaves these.
    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Whether a status report may move a job from `self` to `next`.
    ///
    /// Same-state writes on an active job are allowed so a status report can
    /// merge additional fields without changing state. Entering processing
    /// happens only through a claim, and returning to pending only through
    /// the reaper, so neither move is reachable here.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Pending | Cancelled) | (Processing, Processing | Completed | Failed | Cancelled)
        )
    }

    /// Whether entering this status stamps `completed_at`.
    pub fn stamps_completion(self) -> bool {
        self.is_terminal()
    }

    /// Every status a job may currently be in for a move to `next` to be allowed.
    pub fn allowed_sources(next: JobStatus) -> Vec<JobStatus> {
        [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ]
        .into_iter()
        .filter(|from| from.can_transition_to(next))
        .collect()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown job status '{other}'"))),
        }
    }
}

/// Scheduling priority of an analysis job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// Database / wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
        }
    }

    /// Claim order rank: lower ranks are claimed first.
    ///
    /// Unrecognised priorities stored by other writers rank 4 in the claim
    /// query, behind `Low`.
    pub fn rank(self) -> i32 {
        match self {
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "high" => Ok(JobPriority::High),
            "normal" => Ok(JobPriority::Normal),
            "low" => Ok(JobPriority::Low),
            other => Err(Error::InvalidInput(format!("unknown priority '{other}'"))),
        }
    }
}

/// One unit of scheduled analysis work for one ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub ticker: String,
    /// Provenance tag, informational only.
    pub source: String,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub retry_count: i32,
    /// Advisory; read by workers, never enforced by the queue.
    pub max_retries: i32,
    /// Earliest time the job may be claimed.
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub current_step: Option<String>,
    pub step_details: Option<JsonValue>,
    /// Most recent error only; cleared by every progress report.
    pub last_error: Option<String>,
    pub result: Option<JsonValue>,
}

impl Job {
    /// Whether the job occupies its ticker's active slot.
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Whether the worker should treat its retry budget as spent.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count > self.max_retries
    }

    /// Milliseconds between claim and completion, when both are known.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Request to enqueue analysis for a ticker.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub ticker: String,
    pub source: String,
    pub priority: JobPriority,
    /// Cancel any active job for the ticker and start a fresh one.
    pub force: bool,
    /// Defer the job; `None` means claimable immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Override the advisory retry budget.
    pub max_retries: Option<i32>,
}

impl EnqueueRequest {
    /// User-initiated, normal priority, non-forced request for `ticker`.
    pub fn new(ticker: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into(),
            source: defaults::SOURCE_USER.to_string(),
            priority: JobPriority::Normal,
            force: false,
            scheduled_at: None,
            max_retries: None,
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn max_retries(mut self, max: i32) -> Self {
        self.max_retries = Some(max);
        self
    }

    /// Normalize the ticker and check the remaining fields.
    pub fn validated(mut self) -> Result<Self> {
        self.ticker = normalize_ticker(&self.ticker)?;
        if self.source.trim().is_empty() {
            return Err(Error::InvalidInput("source must not be empty".into()));
        }
        if let Some(max) = self.max_retries {
            if max < 0 {
                return Err(Error::InvalidInput(format!(
                    "max_retries must be non-negative, got {max}"
                )));
            }
        }
        Ok(self)
    }
}

/// Additional fields merged into a job by a status update.
///
/// `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusPatch {
    pub last_error: Option<String>,
    pub current_step: Option<String>,
    pub step_details: Option<JsonValue>,
    pub result: Option<JsonValue>,
}

impl StatusPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn details(mut self, details: JsonValue) -> Self {
        self.step_details = Some(details);
        self
    }

    pub fn result(mut self, result: JsonValue) -> Self {
        self.result = Some(result);
        self
    }
}

/// Point-in-time job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}

// =============================================================================
// PHASE TYPES
// =============================================================================

/// One stage of the per-ticker scoring pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Micro,
    Macro,
    Combined,
}

impl Phase {
    /// Pipeline order.
    pub const ALL: [Phase; 3] = [Phase::Micro, Phase::Macro, Phase::Combined];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Micro => "micro",
            Phase::Macro => "macro",
            Phase::Combined => "combined",
        }
    }

    /// Flag column on `ticker_analysis`.
    pub fn column(self) -> &'static str {
        match self {
            Phase::Micro => "micro_complete",
            Phase::Macro => "macro_complete",
            Phase::Combined => "combined_complete",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "micro" => Ok(Phase::Micro),
            "macro" => Ok(Phase::Macro),
            "combined" => Ok(Phase::Combined),
            other => Err(Error::InvalidInput(format!("unknown phase '{other}'"))),
        }
    }
}

/// Phase flags of one ticker analysis record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseFlags {
    pub record_id: Uuid,
    pub ticker: String,
    pub micro_complete: bool,
    pub macro_complete: bool,
    pub combined_complete: bool,
}

impl PhaseFlags {
    pub fn is_set(&self, phase: Phase) -> bool {
        match phase {
            Phase::Micro => self.micro_complete,
            Phase::Macro => self.macro_complete,
            Phase::Combined => self.combined_complete,
        }
    }

    pub fn all_complete(&self) -> bool {
        Phase::ALL.iter().all(|p| self.is_set(*p))
    }
}

// =============================================================================
// SCORE TYPES
// =============================================================================

/// Status of a ticker's score record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreStatus {
    Analyzing,
    Completed,
    Failed,
}

impl ScoreStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ScoreStatus::Analyzing => "analyzing",
            ScoreStatus::Completed => "completed",
            ScoreStatus::Failed => "failed",
        }
    }
}

impl FromStr for ScoreStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "analyzing" => Ok(ScoreStatus::Analyzing),
            "completed" => Ok(ScoreStatus::Completed),
            "failed" => Ok(ScoreStatus::Failed),
            other => Err(Error::InvalidInput(format!("unknown score status '{other}'"))),
        }
    }
}

/// Scoring record for a ticker. Only the placeholder is written by this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub ticker: String,
    pub status: ScoreStatus,
    pub final_score: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl ScoreRecord {
    /// A completed record with a usable final score; placeholders must not clobber it.
    pub fn has_final_score(&self) -> bool {
        self.status == ScoreStatus::Completed && self.final_score.is_some_and(f64::is_finite)
    }
}
