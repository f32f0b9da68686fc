//! Job worker that claims analysis jobs and drives an analyzer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use tickerq_core::{
    defaults, Error, Job, JobRepository, JobStatus, PhaseTracker, Result, StatusPatch,
};
use tickerq_db::Database;

use crate::handler::{AnalysisContext, AnalysisOutcome, Analyzer};

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Polling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum number of concurrent jobs.
    pub max_concurrent_jobs: usize,
    /// Whether to enable job processing.
    pub enabled: bool,
    /// Execution limit for a single analysis run.
    pub job_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::JOB_POLL_INTERVAL_MS,
            max_concurrent_jobs: defaults::JOB_MAX_CONCURRENT,
            enabled: true,
            job_timeout: Duration::from_secs(defaults::JOB_TIMEOUT_SECS),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_MAX_CONCURRENT` | `4` | Max concurrent jobs |
    /// | `JOB_POLL_INTERVAL_MS` | `5000` | Polling interval when queue is empty |
    /// | `JOB_TIMEOUT_SECS` | `900` | Per-job execution limit |
    pub fn from_env() -> Self {
        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent_jobs = std::env::var("JOB_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::JOB_MAX_CONCURRENT)
            .max(1);

        let poll_interval_ms = std::env::var("JOB_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_POLL_INTERVAL_MS);

        let job_timeout_secs = std::env::var("JOB_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_TIMEOUT_SECS);

        Self {
            poll_interval_ms,
            max_concurrent_jobs,
            enabled,
            job_timeout: Duration::from_secs(job_timeout_secs),
        }
    }

    /// Create a new config with custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set maximum concurrent jobs.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the per-job execution limit.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }
}

/// Event emitted by the job worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A job was handed to the analyzer.
    JobStarted { job_id: Uuid, ticker: String },
    /// The analyzer reported a pipeline step.
    JobProgress { job_id: Uuid, step: String },
    /// A job completed successfully.
    JobCompleted { job_id: Uuid, ticker: String },
    /// A job failed.
    JobFailed {
        job_id: Uuid,
        ticker: String,
        error: String,
    },
    /// The job was taken away (cancelled or reaped) and its outcome dropped.
    JobAbandoned { job_id: Uuid, ticker: String },
    /// Worker started.
    WorkerStarted,
    /// Worker stopped.
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    ///
    /// Jobs already handed to the analyzer run to completion first.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Job worker that processes analysis jobs from the queue.
pub struct JobWorker {
    jobs: Arc<dyn JobRepository>,
    phases: Arc<dyn PhaseTracker>,
    analyzer: Arc<dyn Analyzer>,
    config: WorkerConfig,
    notify: Option<Arc<Notify>>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        phases: Arc<dyn PhaseTracker>,
        analyzer: Arc<dyn Analyzer>,
        config: WorkerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            jobs,
            phases,
            analyzer,
            config,
            notify: None,
            event_tx,
        }
    }

    /// Wake the idle loop early when `notify` fires (new or reaped jobs).
    pub fn with_notify(mut self, notify: Arc<Notify>) -> Self {
        self.notify = Some(notify);
        self
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
        }
    }

    /// Run the worker loop.
    ///
    /// Claims up to `max_concurrent_jobs` at a time and processes them concurrently.
    /// Only sleeps when the queue is empty.
    #[instrument(skip(self, shutdown_rx), fields(analyzer = self.analyzer.name()))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return;
        }

        info!(
            subsystem = "jobs",
            component = "worker",
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = self.config.max_concurrent_jobs,
            "Job worker started"
        );

        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let max_concurrent = self.config.max_concurrent_jobs.max(1);

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Job worker received shutdown signal");
                break;
            }

            let mut claimed = 0;
            let mut tasks = tokio::task::JoinSet::new();

            for _ in 0..max_concurrent {
                match self.claim_job().await {
                    Some(job) => {
                        claimed += 1;
                        let worker = self.clone_refs();
                        tasks.spawn(async move {
                            worker.execute_job(job).await;
                        });
                    }
                    None => break,
                }
            }

            if claimed == 0 {
                let wake = async {
                    match &self.notify {
                        Some(notify) => notify.notified().await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Job worker received shutdown signal");
                        break;
                    }
                    _ = sleep(poll_interval) => {}
                    _ = wake => {
                        debug!("Job worker woken by enqueue notification");
                    }
                }
            } else {
                debug!(claimed, "Processing concurrent job batch");
                while let Some(result) = tasks.join_next().await {
                    if let Err(e) = result {
                        error!(error = ?e, "Job task panicked");
                    }
                }
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Job worker stopped");
    }

    /// Claim the next available job without processing it.
    async fn claim_job(&self) -> Option<Job> {
        match self.jobs.claim_next().await {
            Ok(job) => job,
            Err(e) => {
                error!(error = ?e, "Failed to claim job");
                None
            }
        }
    }

    /// Clone references needed for spawned job tasks.
    fn clone_refs(&self) -> JobWorkerRef {
        JobWorkerRef {
            jobs: self.jobs.clone(),
            phases: self.phases.clone(),
            analyzer: self.analyzer.clone(),
            job_timeout: self.config.job_timeout,
            event_tx: self.event_tx.clone(),
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Claim and fully process at most one job on the current task.
    ///
    /// Returns the id of the processed job, or `None` when nothing was claimable.
    pub async fn run_once(&self) -> Option<Uuid> {
        let job = self.claim_job().await?;
        let job_id = job.id;
        self.clone_refs().execute_job(job).await;
        Some(job_id)
    }
}

/// Reference bundle for executing a single job in a spawned task.
struct JobWorkerRef {
    jobs: Arc<dyn JobRepository>,
    phases: Arc<dyn PhaseTracker>,
    analyzer: Arc<dyn Analyzer>,
    job_timeout: Duration,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobWorkerRef {
    /// Execute a single claimed job.
    async fn execute_job(self, job: Job) {
        let start = Instant::now();
        let job_id = job.id;
        let ticker = job.ticker.clone();
        let claimed_at = job.started_at;

        info!(
            subsystem = "jobs",
            component = "worker",
            %job_id,
            %ticker,
            priority = %job.priority,
            retry_count = job.retry_count,
            "Processing job"
        );
        if job.retries_exhausted() {
            warn!(
                %job_id,
                %ticker,
                retry_count = job.retry_count,
                max_retries = job.max_retries,
                "Job has been reaped more often than its retry budget allows"
            );
        }

        let _ = self.event_tx.send(WorkerEvent::JobStarted {
            job_id,
            ticker: ticker.clone(),
        });

        // A new pipeline run starts from cleared flags.
        let outcome = match self.phases.reset_phase_flags(&ticker).await {
            Err(e) => AnalysisOutcome::Failed(format!("failed to reset phase flags: {e}")),
            Ok(_) => {
                let event_tx = self.event_tx.clone();
                let ctx = AnalysisContext::new(job, self.jobs.clone(), self.phases.clone())
                    .with_progress_callback(move |step| {
                        let _ = event_tx.send(WorkerEvent::JobProgress {
                            job_id,
                            step: step.to_string(),
                        });
                    });

                match tokio::time::timeout(self.job_timeout, self.analyzer.analyze(ctx)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(
                            %job_id,
                            %ticker,
                            timeout_secs = self.job_timeout.as_secs(),
                            "Job exceeded timeout"
                        );
                        AnalysisOutcome::Failed(format!(
                            "Job exceeded timeout of {}s",
                            self.job_timeout.as_secs()
                        ))
                    }
                }
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let (status, patch) = match outcome {
            AnalysisOutcome::Success(result) => {
                let patch = match result {
                    Some(result) => StatusPatch::new().result(result),
                    None => StatusPatch::new(),
                };
                (JobStatus::Completed, patch)
            }
            AnalysisOutcome::Failed(error) => (JobStatus::Failed, StatusPatch::new().error(error)),
            AnalysisOutcome::Abandoned => {
                info!(%job_id, %ticker, duration_ms, "Analyzer abandoned job");
                let _ = self
                    .event_tx
                    .send(WorkerEvent::JobAbandoned { job_id, ticker });
                return;
            }
        };

        // Only the claim this worker holds may be finished; a reaped and
        // re-claimed job belongs to someone else now.
        let reported = match claimed_at {
            Some(claimed_at) => {
                self.jobs
                    .finish_claim(job_id, claimed_at, status, patch)
                    .await
            }
            None => self.jobs.update_status(job_id, status, patch).await,
        };

        match reported {
            Ok(job) if job.status == JobStatus::Completed => {
                info!(%job_id, %ticker, duration_ms, "Job completed successfully");
                let _ = self
                    .event_tx
                    .send(WorkerEvent::JobCompleted { job_id, ticker });
            }
            Ok(job) => {
                let error = job.last_error.unwrap_or_default();
                warn!(%job_id, %ticker, %error, duration_ms, "Job failed");
                let _ = self.event_tx.send(WorkerEvent::JobFailed {
                    job_id,
                    ticker,
                    error,
                });
            }
            Err(e @ (Error::InvalidTransition { .. } | Error::ClaimLost(_))) => {
                info!(
                    %job_id,
                    %ticker,
                    reason = %e,
                    "Dropping outcome for job no longer owned by this worker"
                );
                let _ = self
                    .event_tx
                    .send(WorkerEvent::JobAbandoned { job_id, ticker });
            }
            Err(e) => {
                error!(error = ?e, %job_id, "Failed to record job outcome");
            }
        }
    }
}

/// Builder for creating a job worker.
pub struct WorkerBuilder {
    jobs: Arc<dyn JobRepository>,
    phases: Arc<dyn PhaseTracker>,
    config: WorkerConfig,
    analyzer: Option<Arc<dyn Analyzer>>,
    notify: Option<Arc<Notify>>,
}

impl WorkerBuilder {
    /// Create a new worker builder over any repository implementation.
    pub fn new(jobs: Arc<dyn JobRepository>, phases: Arc<dyn PhaseTracker>) -> Self {
        Self {
            jobs,
            phases,
            config: WorkerConfig::default(),
            analyzer: None,
            notify: None,
        }
    }

    /// Builder over the PostgreSQL repositories, woken by their enqueue notifications.
    pub fn for_database(db: &Database) -> Self {
        let mut builder = Self::new(Arc::new(db.jobs.clone()), Arc::new(db.phases.clone()));
        builder.notify = Some(db.jobs.job_notify());
        builder
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the analyzer.
    pub fn with_analyzer<A: Analyzer + 'static>(mut self, analyzer: A) -> Self {
        self.analyzer = Some(Arc::new(analyzer));
        self
    }

    /// Share a notify handle with the enqueuing repository.
    pub fn with_notify(mut self, notify: Arc<Notify>) -> Self {
        self.notify = Some(notify);
        self
    }

    /// Build and return the worker.
    pub fn build(self) -> Result<JobWorker> {
        let analyzer = self
            .analyzer
            .ok_or_else(|| Error::Config("job worker requires an analyzer".into()))?;

        let mut worker = JobWorker::new(self.jobs, self.phases, analyzer, self.config);
        if let Some(notify) = self.notify {
            worker = worker.with_notify(notify);
        }
        Ok(worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval_ms, defaults::JOB_POLL_INTERVAL_MS);
        assert_eq!(config.max_concurrent_jobs, defaults::JOB_MAX_CONCURRENT);
        assert_eq!(
            config.job_timeout,
            Duration::from_secs(defaults::JOB_TIMEOUT_SECS)
        );
        assert!(config.enabled);
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_poll_interval(1000)
            .with_max_concurrent(8)
            .with_enabled(false)
            .with_job_timeout(Duration::from_secs(5));

        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.max_concurrent_jobs, 8);
        assert!(!config.enabled);
        assert_eq!(config.job_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_worker_event_clone() {
        let event = WorkerEvent::JobFailed {
            job_id: Uuid::nil(),
            ticker: "AAPL".to_string(),
            error: "boom".to_string(),
        };
        let cloned = event.clone();
        assert!(matches!(cloned, WorkerEvent::JobFailed { ref error, .. } if error == "boom"));
    }
}
