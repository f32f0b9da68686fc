//! Job repository implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tickerq_core::{
    defaults, new_v7, normalize_ticker, EnqueueRequest, Error, EventBus, Job, JobPriority,
    JobRepository, JobStatus, QueueStats, Result, ScoreRepository, ServerEvent, StatusPatch,
};

use crate::scores::PgScoreRepository;

/// Columns selected for every job read, with the enum status cast to text.
const JOB_COLUMNS: &str = "id, ticker, source, priority, status::text AS status, retry_count,
     max_retries, scheduled_at, created_at, started_at, completed_at, current_step,
     step_details, last_error, result";

/// Claim order: priority rank first, then earliest schedule.
const CLAIM_ORDER: &str = "CASE priority WHEN 'high' THEN 1 WHEN 'normal' THEN 2 \
     WHEN 'low' THEN 3 ELSE 4 END, scheduled_at ASC";

/// PostgreSQL implementation of JobRepository.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: Pool<Postgres>,
    scores: PgScoreRepository,
    events: Option<EventBus>,
    /// Woken whenever a job becomes claimable.
    notify: Arc<Notify>,
}

impl PgJobRepository {
    /// Create a new PgJobRepository with its own notify handle.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self::with_notify(pool, Arc::new(Notify::new()))
    }

    /// Create a new PgJobRepository sharing an existing notify handle.
    pub fn with_notify(pool: Pool<Postgres>, notify: Arc<Notify>) -> Self {
        Self {
            scores: PgScoreRepository::new(pool.clone()),
            pool,
            events: None,
            notify,
        }
    }

    /// Publish job lifecycle events on `bus`.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Get the job notification handle for event-driven waking.
    pub fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    fn emit(&self, event: ServerEvent) {
        if let Some(bus) = &self.events {
            bus.emit(event);
        }
    }

    /// Parse a job row into a Job struct.
    fn parse_job_row(row: PgRow) -> Result<Job> {
        let status: String = row.get("status");
        let priority: String = row.get("priority");
        Ok(Job {
            id: row.get("id"),
            ticker: row.get("ticker"),
            source: row.get("source"),
            // Priorities written by other tools sort last and read back as low.
            priority: priority.parse().unwrap_or(JobPriority::Low),
            status: status.parse()?,
            retry_count: row.get("retry_count"),
            max_retries: row.get("max_retries"),
            scheduled_at: row.get("scheduled_at"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            current_step: row.get("current_step"),
            step_details: row.get("step_details"),
            last_error: row.get("last_error"),
            result: row.get("result"),
        })
    }

    fn parse_rows(rows: Vec<PgRow>) -> Result<Vec<Job>> {
        rows.into_iter().map(Self::parse_job_row).collect()
    }

    async fn find_active(&self, ticker: &str) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM analysis_job
             WHERE ticker = $1 AND status IN ('pending', 'processing')
             LIMIT 1"
        ))
        .bind(ticker)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn insert(&self, req: &EnqueueRequest) -> Result<Job> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO analysis_job (id, ticker, source, priority, status, retry_count,
                                       max_retries, scheduled_at, created_at)
             VALUES ($1, $2, $3, $4, 'pending'::analysis_job_status, 0, $5, $6, $7)
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(new_v7())
        .bind(&req.ticker)
        .bind(&req.source)
        .bind(req.priority.as_str())
        .bind(req.max_retries.unwrap_or(defaults::JOB_MAX_RETRIES))
        .bind(req.scheduled_at.unwrap_or(now))
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_job_row(row)
    }

    fn emit_terminal(&self, job: &Job) {
        match job.status {
            JobStatus::Completed => self.emit(ServerEvent::JobCompleted {
                job_id: job.id,
                ticker: job.ticker.clone(),
                duration_ms: job.duration_ms(),
            }),
            JobStatus::Failed => self.emit(ServerEvent::JobFailed {
                job_id: job.id,
                ticker: job.ticker.clone(),
                error: job.last_error.clone().unwrap_or_default(),
            }),
            JobStatus::Cancelled => self.emit(ServerEvent::JobCancelled {
                job_id: job.id,
                ticker: job.ticker.clone(),
            }),
            JobStatus::Pending | JobStatus::Processing => {}
        }
    }

    /// Apply a status report, optionally only under the claim that started at `claimed_at`.
    async fn write_status(
        &self,
        job_id: Uuid,
        claimed_at: Option<DateTime<Utc>>,
        status: JobStatus,
        patch: StatusPatch,
    ) -> Result<Job> {
        let now = Utc::now();
        let sources: Vec<String> = JobStatus::allowed_sources(status)
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let row = sqlx::query(&format!(
            "UPDATE analysis_job
             SET status = $2::analysis_job_status,
                 last_error = COALESCE($3, last_error),
                 current_step = COALESCE($4, current_step),
                 step_details = COALESCE($5, step_details),
                 result = COALESCE($6, result),
                 completed_at = CASE WHEN $7 THEN $8 ELSE completed_at END
             WHERE id = $1 AND status::text = ANY($9)
               AND ($10::timestamptz IS NULL
                    OR (status = 'processing'::analysis_job_status AND started_at = $10))
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id)
        .bind(status.as_str())
        .bind(&patch.last_error)
        .bind(&patch.current_step)
        .bind(&patch.step_details)
        .bind(&patch.result)
        .bind(status.stamps_completion())
        .bind(now)
        .bind(&sources)
        .bind(claimed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        let Some(row) = row else {
            let current: Option<String> =
                sqlx::query_scalar("SELECT status::text FROM analysis_job WHERE id = $1")
                    .bind(job_id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(Error::Database)?;

            let Some(from) = current else {
                return Err(Error::JobNotFound(job_id));
            };
            let from: JobStatus = from.parse()?;
            if claimed_at.is_some() && from.is_active() {
                debug!(
                    subsystem = "db",
                    component = "job_queue",
                    op = "finish_claim",
                    job_id = %job_id,
                    status = %from,
                    "Claim no longer held"
                );
                return Err(Error::ClaimLost(job_id));
            }
            return Err(Error::InvalidTransition { from, to: status });
        };

        let job = Self::parse_job_row(row)?;
        info!(
            subsystem = "db",
            component = "job_queue",
            op = "update_status",
            job_id = %job.id,
            ticker = %job.ticker,
            status = %job.status,
            "Job status updated"
        );
        self.emit_terminal(&job);
        Ok(job)
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn enqueue(&self, req: EnqueueRequest) -> Result<Job> {
        let req = req.validated()?;

        if req.force {
            self.cancel_active(&req.ticker).await?;
        }
        self.scores
            .ensure_placeholder(&req.ticker, req.force)
            .await?;

        for attempt in 1..=defaults::ENQUEUE_CONFLICT_ATTEMPTS {
            if !req.force {
                if let Some(existing) = self.find_active(&req.ticker).await? {
                    debug!(
                        subsystem = "db",
                        component = "job_queue",
                        op = "enqueue",
                        ticker = %req.ticker,
                        job_id = %existing.id,
                        created = false,
                        "Active job already exists"
                    );
                    return Ok(existing);
                }
            }

            match self.insert(&req).await {
                Ok(job) => {
                    info!(
                        subsystem = "db",
                        component = "job_queue",
                        op = "enqueue",
                        ticker = %job.ticker,
                        job_id = %job.id,
                        priority = %job.priority,
                        source = %job.source,
                        created = true,
                        "Job queued"
                    );
                    self.emit(ServerEvent::JobQueued {
                        job_id: job.id,
                        ticker: job.ticker.clone(),
                        priority: job.priority,
                        source: job.source.clone(),
                    });
                    self.notify.notify_waiters();
                    return Ok(job);
                }
                Err(e) if e.is_unique_violation() => {
                    // Another enqueuer won the active slot; hand back its job.
                    if let Some(existing) = self.find_active(&req.ticker).await? {
                        debug!(
                            subsystem = "db",
                            component = "job_queue",
                            op = "enqueue",
                            ticker = %req.ticker,
                            job_id = %existing.id,
                            created = false,
                            "Lost enqueue race, returning winner"
                        );
                        return Ok(existing);
                    }
                    debug!(
                        subsystem = "db",
                        component = "job_queue",
                        op = "enqueue",
                        ticker = %req.ticker,
                        attempt,
                        "Conflicting job finished before re-read, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        warn!(
            subsystem = "db",
            component = "job_queue",
            op = "enqueue",
            ticker = %req.ticker,
            attempts = defaults::ENQUEUE_CONFLICT_ATTEMPTS,
            "Enqueue kept conflicting with short-lived jobs"
        );
        Err(Error::Job(format!(
            "could not enqueue {} after {} conflicting attempts",
            req.ticker,
            defaults::ENQUEUE_CONFLICT_ATTEMPTS
        )))
    }

    async fn cancel_active(&self, ticker: &str) -> Result<Vec<Job>> {
        let ticker = normalize_ticker(ticker)?;
        let rows = sqlx::query(&format!(
            "UPDATE analysis_job
             SET status = 'cancelled'::analysis_job_status, completed_at = $2
             WHERE ticker = $1 AND status IN ('pending', 'processing')
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(&ticker)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let cancelled = Self::parse_rows(rows)?;
        if !cancelled.is_empty() {
            info!(
                subsystem = "db",
                component = "job_queue",
                op = "cancel_active",
                ticker = %ticker,
                job_count = cancelled.len(),
                "Active jobs cancelled"
            );
        }
        for job in &cancelled {
            self.emit_terminal(job);
        }
        Ok(cancelled)
    }

    async fn claim_next(&self) -> Result<Option<Job>> {
        let now = Utc::now();

        // SKIP LOCKED lets concurrent claimers pass over each other's rows;
        // the outer status check guards against a row that changed between
        // the subquery snapshot and the update.
        let row = sqlx::query(&format!(
            "UPDATE analysis_job
             SET status = 'processing'::analysis_job_status, started_at = $1
             WHERE id = (
                 SELECT id FROM analysis_job
                 WHERE status = 'pending'::analysis_job_status
                   AND scheduled_at <= $1
                 ORDER BY {CLAIM_ORDER}
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             AND status = 'pending'::analysis_job_status
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        let job = row.map(Self::parse_job_row).transpose()?;
        if let Some(job) = &job {
            debug!(
                subsystem = "db",
                component = "job_queue",
                op = "claim_next",
                job_id = %job.id,
                ticker = %job.ticker,
                priority = %job.priority,
                "Job claimed"
            );
            self.emit(ServerEvent::JobStarted {
                job_id: job.id,
                ticker: job.ticker.clone(),
            });
        }
        Ok(job)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM analysis_job WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn get_for_ticker(&self, ticker: &str) -> Result<Vec<Job>> {
        let ticker = normalize_ticker(ticker)?;
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM analysis_job
             WHERE ticker = $1
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(&ticker)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_rows(rows)
    }

    async fn update_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        patch: StatusPatch,
    ) -> Result<Job> {
        self.write_status(job_id, None, status, patch).await
    }

    async fn finish_claim(
        &self,
        job_id: Uuid,
        claimed_at: DateTime<Utc>,
        status: JobStatus,
        patch: StatusPatch,
    ) -> Result<Job> {
        self.write_status(job_id, Some(claimed_at), status, patch).await
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        step: &str,
        details: Option<JsonValue>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE analysis_job
             SET current_step = $2, step_details = $3, last_error = NULL
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(step)
        .bind(&details)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::JobNotFound(job_id));
        }

        self.emit(ServerEvent::JobProgress {
            job_id,
            step: step.to_string(),
            details,
        });
        Ok(())
    }

    async fn reap_stuck(&self, timeout: Duration) -> Result<u64> {
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| Error::InvalidInput(format!("reap timeout out of range: {e}")))?;
        let cutoff = Utc::now() - timeout;

        let rows = sqlx::query(
            "UPDATE analysis_job
             SET status = 'pending'::analysis_job_status, started_at = NULL,
                 retry_count = retry_count + 1
             WHERE status = 'processing'::analysis_job_status AND started_at < $1
             RETURNING id, ticker, retry_count",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        for row in &rows {
            let job_id: Uuid = row.get("id");
            let ticker: String = row.get("ticker");
            let retry_count: i32 = row.get("retry_count");
            warn!(
                subsystem = "db",
                component = "reaper",
                op = "reap_stuck",
                job_id = %job_id,
                ticker = %ticker,
                retry_count,
                "Stuck job returned to pending"
            );
            self.emit(ServerEvent::JobReaped {
                job_id,
                ticker,
                retry_count,
            });
        }

        let reaped = rows.len() as u64;
        if reaped > 0 {
            self.notify.notify_waiters();
        }
        Ok(reaped)
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled,
                COUNT(*) AS total
             FROM analysis_job",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueStats {
            pending: row.get("pending"),
            processing: row.get("processing"),
            completed: row.get("completed"),
            failed: row.get("failed"),
            cancelled: row.get("cancelled"),
            total: row.get("total"),
        })
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM analysis_job
             ORDER BY created_at DESC, id DESC
             LIMIT $1"
        ))
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_rows(rows)
    }

    async fn cleanup(&self, keep_count: i64) -> Result<u64> {
        if keep_count < 0 {
            return Err(Error::InvalidInput(format!(
                "keep_count must be non-negative, got {keep_count}"
            )));
        }

        // Active jobs are never candidates.
        let result = sqlx::query(
            "DELETE FROM analysis_job
             WHERE id IN (
                 SELECT id FROM analysis_job
                 WHERE status IN ('completed', 'failed', 'cancelled')
                 ORDER BY completed_at DESC NULLS LAST, created_at DESC
                 OFFSET $1
             )",
        )
        .bind(keep_count)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(
                subsystem = "db",
                component = "job_queue",
                op = "cleanup",
                rows_affected = deleted,
                "Old jobs removed"
            );
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_columns_cast_status_to_text() {
        assert!(JOB_COLUMNS.contains("status::text AS status"));
        for column in ["ticker", "scheduled_at", "step_details", "last_error", "result"] {
            assert!(JOB_COLUMNS.contains(column), "missing column {column}");
        }
    }

    #[test]
    fn test_claim_order_ranks_match_priority() {
        for priority in [JobPriority::High, JobPriority::Normal, JobPriority::Low] {
            let clause = format!("WHEN '{}' THEN {}", priority.as_str(), priority.rank());
            assert!(CLAIM_ORDER.contains(&clause), "missing {clause}");
        }
        assert!(CLAIM_ORDER.contains("ELSE 4"));
        assert!(CLAIM_ORDER.ends_with("scheduled_at ASC"));
    }

    #[test]
    fn test_allowed_sources_bind_as_text() {
        let sources: Vec<String> = JobStatus::allowed_sources(JobStatus::Completed)
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect();
        assert_eq!(sources, vec!["processing".to_string()]);
    }
}
