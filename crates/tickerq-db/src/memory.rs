//! In-memory store for deterministic testing.
//!
//! [`MemoryStore`] implements [`JobRepository`], [`PhaseTracker`] and
//! [`ScoreRepository`] over a single mutex-guarded state, with the same
//! observable semantics as the PostgreSQL repositories: one active job per
//! ticker, priority-then-schedule claim order, atomic per-ticker phase
//! updates, and the job state machine.
//!
//! The clock is controllable so schedule and reaper boundaries can be tested
//! without sleeping.
//!
//! ## Usage
//!
//! ```rust
//! use tickerq_db::memory::MemoryStore;
//! use tickerq_db::{EnqueueRequest, JobRepository};
//!
//! # tokio_test_block_on(async {
//! let store = MemoryStore::new();
//! let job = store.enqueue(EnqueueRequest::new("aapl")).await.unwrap();
//! assert_eq!(job.ticker, "AAPL");
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use tickerq_core::{
    defaults, new_v7, normalize_ticker, EnqueueRequest, Error, EventBus, Job, JobRepository,
    JobStatus, Phase, PhaseFlags, PhaseTracker, QueueStats, Result, ScoreRecord,
    ScoreRepository, ScoreStatus, ServerEvent, StatusPatch,
};

#[derive(Debug, Clone)]
struct AnalysisRecord {
    flags: PhaseFlags,
    recommendation_status: String,
}

#[derive(Default)]
struct MemoryState {
    /// Frozen clock; `None` follows wall time.
    now: Option<DateTime<Utc>>,
    jobs: Vec<Job>,
    records: Vec<AnalysisRecord>,
    scores: HashMap<String, ScoreRecord>,
}

impl MemoryState {
    fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    fn active_index(&self, ticker: &str) -> Option<usize> {
        self.jobs
            .iter()
            .position(|j| j.ticker == ticker && j.status.is_active())
    }
}

/// Shared in-memory implementation of every repository trait.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    events: Option<EventBus>,
}

impl MemoryStore {
    /// Create an empty store following wall-clock time.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish events on `bus`, like the PostgreSQL repositories.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ServerEvent) {
        if let Some(bus) = &self.events {
            bus.emit(event);
        }
    }

    /// Freeze the clock at `at`.
    pub fn set_time(&self, at: DateTime<Utc>) {
        self.state().now = Some(at);
    }

    /// Move the clock forward, freezing it first if it follows wall time.
    pub fn advance(&self, by: chrono::Duration) {
        let mut state = self.state();
        let now = state.now();
        state.now = Some(now + by);
    }

    /// Current store time.
    pub fn now(&self) -> DateTime<Utc> {
        self.state().now()
    }

    /// Add a ticker analysis record with all flags cleared, pending review.
    pub fn add_analysis_record(&self, ticker: &str) -> Result<Uuid> {
        let ticker = normalize_ticker(ticker)?;
        let record_id = new_v7();
        self.state().records.push(AnalysisRecord {
            flags: PhaseFlags {
                record_id,
                ticker,
                micro_complete: false,
                macro_complete: false,
                combined_complete: false,
            },
            recommendation_status: "pending".to_string(),
        });
        Ok(record_id)
    }

    /// Set the recommendation review status on every record for the ticker.
    pub fn set_recommendation_status(&self, ticker: &str, status: &str) -> Result<usize> {
        let ticker = normalize_ticker(ticker)?;
        let mut state = self.state();
        let mut touched = 0;
        for record in state.records.iter_mut().filter(|r| r.flags.ticker == ticker) {
            record.recommendation_status = status.to_string();
            touched += 1;
        }
        Ok(touched)
    }

    /// Write a score record directly, as the analyzer would.
    pub fn put_score(
        &self,
        ticker: &str,
        status: ScoreStatus,
        final_score: Option<f64>,
    ) -> Result<()> {
        let ticker = normalize_ticker(ticker)?;
        let mut state = self.state();
        let updated_at = state.now();
        state.scores.insert(
            ticker.clone(),
            ScoreRecord {
                ticker,
                status,
                final_score,
                updated_at,
            },
        );
        Ok(())
    }

    /// Force a processing job's claim time, simulating a worker that died.
    pub fn backdate_start(&self, job_id: Uuid, started_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state();
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or(Error::JobNotFound(job_id))?;
        job.started_at = Some(started_at);
        Ok(())
    }

    fn cancel_active_locked(state: &mut MemoryState, ticker: &str) -> Vec<Job> {
        let now = state.now();
        state
            .jobs
            .iter_mut()
            .filter(|j| j.ticker == ticker && j.status.is_active())
            .map(|job| {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(now);
                job.clone()
            })
            .collect()
    }

    fn place_score_locked(state: &mut MemoryState, ticker: &str, force: bool) -> bool {
        let keep = state
            .scores
            .get(ticker)
            .is_some_and(ScoreRecord::has_final_score);
        if keep && !force {
            return false;
        }
        let updated_at = state.now();
        state.scores.insert(
            ticker.to_string(),
            ScoreRecord {
                ticker: ticker.to_string(),
                status: ScoreStatus::Analyzing,
                final_score: None,
                updated_at,
            },
        );
        true
    }

    fn update_flags(&self, ticker: &str, apply: impl Fn(&mut PhaseFlags)) -> u64 {
        let mut state = self.state();
        let mut touched = 0;
        for record in state.records.iter_mut().filter(|r| r.flags.ticker == ticker) {
            apply(&mut record.flags);
            touched += 1;
        }
        touched
    }

    /// Apply a status report, optionally only under the claim that started at `claimed_at`.
    fn write_status(
        &self,
        job_id: Uuid,
        claimed_at: Option<DateTime<Utc>>,
        status: JobStatus,
        patch: StatusPatch,
    ) -> Result<Job> {
        let job = {
            let mut state = self.state();
            let now = state.now();
            let job = state
                .jobs
                .iter_mut()
                .find(|j| j.id == job_id)
                .ok_or(Error::JobNotFound(job_id))?;

            if let Some(claimed_at) = claimed_at {
                let owned =
                    job.status == JobStatus::Processing && job.started_at == Some(claimed_at);
                if !owned && job.status.is_active() {
                    return Err(Error::ClaimLost(job_id));
                }
            }
            if !job.status.can_transition_to(status) {
                return Err(Error::InvalidTransition {
                    from: job.status,
                    to: status,
                });
            }

            job.status = status;
            if let Some(err) = patch.last_error {
                job.last_error = Some(err);
            }
            if let Some(step) = patch.current_step {
                job.current_step = Some(step);
            }
            if let Some(details) = patch.step_details {
                job.step_details = Some(details);
            }
            if let Some(result) = patch.result {
                job.result = Some(result);
            }
            if status.stamps_completion() {
                job.completed_at = Some(now);
            }
            job.clone()
        };

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
        Ok(job)
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn enqueue(&self, req: EnqueueRequest) -> Result<Job> {
        let req = req.validated()?;

        let (job, cancelled, created) = {
            let mut state = self.state();
            let cancelled = if req.force {
                Self::cancel_active_locked(&mut state, &req.ticker)
            } else {
                Vec::new()
            };
            Self::place_score_locked(&mut state, &req.ticker, req.force);

            match state.active_index(&req.ticker) {
                Some(idx) => (state.jobs[idx].clone(), cancelled, false),
                None => {
                    let now = state.now();
                    let job = Job {
                        id: new_v7(),
                        ticker: req.ticker.clone(),
                        source: req.source.clone(),
                        priority: req.priority,
                        status: JobStatus::Pending,
                        retry_count: 0,
                        max_retries: req.max_retries.unwrap_or(defaults::JOB_MAX_RETRIES),
                        scheduled_at: req.scheduled_at.unwrap_or(now),
                        created_at: now,
                        started_at: None,
                        completed_at: None,
                        current_step: None,
                        step_details: None,
                        last_error: None,
                        result: None,
                    };
                    state.jobs.push(job.clone());
                    (job, cancelled, true)
                }
            }
        };

        for old in cancelled {
            self.emit(ServerEvent::JobCancelled {
                job_id: old.id,
                ticker: old.ticker,
            });
        }
        if created {
            self.emit(ServerEvent::JobQueued {
                job_id: job.id,
                ticker: job.ticker.clone(),
                priority: job.priority,
                source: job.source.clone(),
            });
        }
        Ok(job)
    }

    async fn cancel_active(&self, ticker: &str) -> Result<Vec<Job>> {
        let ticker = normalize_ticker(ticker)?;
        let cancelled = Self::cancel_active_locked(&mut self.state(), &ticker);
        for job in &cancelled {
            self.emit(ServerEvent::JobCancelled {
                job_id: job.id,
                ticker: job.ticker.clone(),
            });
        }
        Ok(cancelled)
    }

    async fn claim_next(&self) -> Result<Option<Job>> {
        let claimed = {
            let mut state = self.state();
            let now = state.now();
            let next = state
                .jobs
                .iter()
                .enumerate()
                .filter(|(_, j)| j.status == JobStatus::Pending && j.scheduled_at <= now)
                .min_by_key(|(_, j)| (j.priority.rank(), j.scheduled_at, j.id))
                .map(|(idx, _)| idx);

            next.map(|idx| {
                let job = &mut state.jobs[idx];
                job.status = JobStatus::Processing;
                job.started_at = Some(now);
                job.clone()
            })
        };

        if let Some(job) = &claimed {
            self.emit(ServerEvent::JobStarted {
                job_id: job.id,
                ticker: job.ticker.clone(),
            });
        }
        Ok(claimed)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.state().jobs.iter().find(|j| j.id == job_id).cloned())
    }

    async fn get_for_ticker(&self, ticker: &str) -> Result<Vec<Job>> {
        let ticker = normalize_ticker(ticker)?;
        let mut jobs: Vec<Job> = self
            .state()
            .jobs
            .iter()
            .filter(|j| j.ticker == ticker)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(jobs)
    }

    async fn update_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        patch: StatusPatch,
    ) -> Result<Job> {
        self.write_status(job_id, None, status, patch)
    }

    async fn finish_claim(
        &self,
        job_id: Uuid,
        claimed_at: DateTime<Utc>,
        status: JobStatus,
        patch: StatusPatch,
    ) -> Result<Job> {
        self.write_status(job_id, Some(claimed_at), status, patch)
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        step: &str,
        details: Option<JsonValue>,
    ) -> Result<()> {
        {
            let mut state = self.state();
            let job = state
                .jobs
                .iter_mut()
                .find(|j| j.id == job_id)
                .ok_or(Error::JobNotFound(job_id))?;
            job.current_step = Some(step.to_string());
            job.step_details = details.clone();
            job.last_error = None;
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

        let reaped: Vec<Job> = {
            let mut state = self.state();
            let cutoff = state.now() - timeout;
            state
                .jobs
                .iter_mut()
                .filter(|j| {
                    j.status == JobStatus::Processing && j.started_at.is_some_and(|s| s < cutoff)
                })
                .map(|job| {
                    job.status = JobStatus::Pending;
                    job.started_at = None;
                    job.retry_count += 1;
                    job.clone()
                })
                .collect()
        };

        for job in &reaped {
            self.emit(ServerEvent::JobReaped {
                job_id: job.id,
                ticker: job.ticker.clone(),
                retry_count: job.retry_count,
            });
        }
        Ok(reaped.len() as u64)
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let state = self.state();
        let mut stats = QueueStats::default();
        for job in &state.jobs {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
            stats.total += 1;
        }
        Ok(stats)
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<Job>> {
        let mut jobs = self.state().jobs.clone();
        jobs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        jobs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(jobs)
    }

    async fn cleanup(&self, keep_count: i64) -> Result<u64> {
        let keep = usize::try_from(keep_count).map_err(|_| {
            Error::InvalidInput(format!("keep_count must be non-negative, got {keep_count}"))
        })?;

        let mut state = self.state();
        let mut terminal: Vec<(Option<DateTime<Utc>>, DateTime<Utc>, Uuid)> = state
            .jobs
            .iter()
            .filter(|j| j.status.is_terminal())
            .map(|j| (j.completed_at, j.created_at, j.id))
            .collect();
        // Newest completion first; jobs without a completion time sort last.
        terminal.sort_by(|a, b| match (a.0, b.0) {
            (Some(x), Some(y)) => (y, b.1).cmp(&(x, a.1)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => b.1.cmp(&a.1),
        });

        let doomed: Vec<Uuid> = terminal.into_iter().skip(keep).map(|t| t.2).collect();
        state.jobs.retain(|j| !doomed.contains(&j.id));
        Ok(doomed.len() as u64)
    }
}

#[async_trait]
impl PhaseTracker for MemoryStore {
    async fn reset_phase_flags(&self, ticker: &str) -> Result<u64> {
        let ticker = normalize_ticker(ticker)?;
        let records = self.update_flags(&ticker, |flags| {
            flags.micro_complete = false;
            flags.macro_complete = false;
            flags.combined_complete = false;
        });
        if records > 0 {
            self.emit(ServerEvent::PhasesReset { ticker, records });
        }
        Ok(records)
    }

    async fn mark_phase_complete(&self, ticker: &str, phase: Phase) -> Result<u64> {
        let ticker = normalize_ticker(ticker)?;
        let records = self.update_flags(&ticker, |flags| match phase {
            Phase::Micro => flags.micro_complete = true,
            Phase::Macro => flags.macro_complete = true,
            Phase::Combined => flags.combined_complete = true,
        });
        if records > 0 {
            self.emit(ServerEvent::PhaseCompleted {
                ticker,
                phase,
                records,
            });
        }
        Ok(records)
    }

    async fn list_incomplete(&self) -> Result<Vec<String>> {
        let state = self.state();
        let mut tickers: Vec<String> = state
            .records
            .iter()
            .filter(|r| r.recommendation_status == "pending" && !r.flags.all_complete())
            .filter(|r| state.active_index(&r.flags.ticker).is_none())
            .map(|r| r.flags.ticker.clone())
            .collect();
        tickers.sort();
        tickers.dedup();
        Ok(tickers)
    }

    async fn phase_flags(&self, ticker: &str) -> Result<Vec<PhaseFlags>> {
        let ticker = normalize_ticker(ticker)?;
        Ok(self
            .state()
            .records
            .iter()
            .filter(|r| r.flags.ticker == ticker)
            .map(|r| r.flags.clone())
            .collect())
    }
}

#[async_trait]
impl ScoreRepository for MemoryStore {
    async fn ensure_placeholder(&self, ticker: &str, force: bool) -> Result<bool> {
        let ticker = normalize_ticker(ticker)?;
        Ok(Self::place_score_locked(&mut self.state(), &ticker, force))
    }

    async fn get_score(&self, ticker: &str) -> Result<Option<ScoreRecord>> {
        let ticker = normalize_ticker(ticker)?;
        Ok(self.state().scores.get(&ticker).cloned())
    }
}
