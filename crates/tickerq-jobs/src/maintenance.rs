//! Periodic queue maintenance: reaping stuck jobs, re-enqueuing abandoned
//! pipelines, trimming history and publishing queue status.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use tickerq_core::{
    defaults, EnqueueRequest, EventBus, JobPriority, JobRepository, PhaseTracker, Result,
    ServerEvent,
};

/// Configuration for the maintenance scheduler.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Processing time after which a job is reaped back to pending.
    pub stuck_timeout: Duration,
    pub reaper_interval: Duration,
    pub sweep_interval: Duration,
    /// Whether incomplete pipelines are re-enqueued.
    pub sweep_enabled: bool,
    pub status_interval: Duration,
    /// Terminal jobs kept by history cleanup.
    pub history_keep: i64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            stuck_timeout: Duration::from_secs(defaults::STUCK_JOB_TIMEOUT_SECS),
            reaper_interval: Duration::from_secs(defaults::REAPER_INTERVAL_SECS),
            sweep_interval: Duration::from_secs(defaults::SWEEP_INTERVAL_SECS),
            sweep_enabled: true,
            status_interval: Duration::from_secs(defaults::QUEUE_STATUS_INTERVAL_SECS),
            history_keep: defaults::JOB_HISTORY_KEEP,
        }
    }
}

fn env_secs(name: &str, default: u64) -> Duration {
    let secs = std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default);
    Duration::from_secs(secs)
}

impl MaintenanceConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `STUCK_JOB_TIMEOUT_SECS` | `1800` |
    /// | `REAPER_INTERVAL_SECS` | `60` |
    /// | `SWEEP_INTERVAL_SECS` | `300` |
    /// | `SWEEP_ENABLED` | `true` |
    /// | `QUEUE_STATUS_INTERVAL_SECS` | `5` |
    /// | `JOB_HISTORY_KEEP` | `10000` |
    pub fn from_env() -> Self {
        let sweep_enabled = std::env::var("SWEEP_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let history_keep = std::env::var("JOB_HISTORY_KEEP")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|&v| v >= 0)
            .unwrap_or(defaults::JOB_HISTORY_KEEP);

        Self {
            stuck_timeout: env_secs("STUCK_JOB_TIMEOUT_SECS", defaults::STUCK_JOB_TIMEOUT_SECS),
            reaper_interval: env_secs("REAPER_INTERVAL_SECS", defaults::REAPER_INTERVAL_SECS),
            sweep_interval: env_secs("SWEEP_INTERVAL_SECS", defaults::SWEEP_INTERVAL_SECS),
            sweep_enabled,
            status_interval: env_secs(
                "QUEUE_STATUS_INTERVAL_SECS",
                defaults::QUEUE_STATUS_INTERVAL_SECS,
            ),
            history_keep,
        }
    }

    pub fn with_stuck_timeout(mut self, timeout: Duration) -> Self {
        self.stuck_timeout = timeout;
        self
    }

    pub fn with_sweep_enabled(mut self, enabled: bool) -> Self {
        self.sweep_enabled = enabled;
        self
    }

    pub fn with_history_keep(mut self, keep: i64) -> Self {
        self.history_keep = keep;
        self
    }
}

/// Counts from one full maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Stuck jobs returned to pending.
    pub reaped: u64,
    /// Incomplete tickers handed to enqueue by the sweep.
    pub requeued: usize,
    /// Terminal jobs deleted by history cleanup.
    pub cleaned: u64,
}

/// Handle for stopping a running scheduler.
pub struct MaintenanceHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl MaintenanceHandle {
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx.send(()).await.map_err(|_| {
            tickerq_core::Error::Internal("Failed to send maintenance shutdown signal".into())
        })?;
        Ok(())
    }
}

/// Runs the queue's background housekeeping.
///
/// None of these tasks are required for correctness of a single enqueue or
/// claim. Without the reaper, a crashed worker's job stays `processing` and
/// blocks its ticker until someone force-enqueues it.
pub struct MaintenanceScheduler {
    jobs: Arc<dyn JobRepository>,
    phases: Arc<dyn PhaseTracker>,
    config: MaintenanceConfig,
    events: Option<EventBus>,
}

impl MaintenanceScheduler {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        phases: Arc<dyn PhaseTracker>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            jobs,
            phases,
            config,
            events: None,
        }
    }

    /// Publish `QueueStatus` snapshots on this bus.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Return stuck jobs to pending.
    pub async fn reap(&self) -> Result<u64> {
        let reaped = self.jobs.reap_stuck(self.config.stuck_timeout).await?;
        if reaped > 0 {
            warn!(
                subsystem = "maintenance",
                component = "reaper",
                job_count = reaped,
                timeout_secs = self.config.stuck_timeout.as_secs(),
                "Reaped stuck jobs"
            );
        } else {
            debug!(component = "reaper", "No stuck jobs");
        }
        Ok(reaped)
    }

    /// Enqueue every ticker whose pipeline was left unfinished.
    ///
    /// A failure on one ticker is logged and does not stop the sweep.
    pub async fn sweep(&self) -> Result<usize> {
        let tickers = self.phases.list_incomplete().await?;
        let mut requeued = 0;
        for ticker in tickers {
            let req = EnqueueRequest::new(&ticker)
                .source(defaults::SOURCE_SWEEP)
                .priority(JobPriority::Low);
            match self.jobs.enqueue(req).await {
                Ok(job) => {
                    requeued += 1;
                    debug!(component = "sweep", %ticker, job_id = %job.id, "Re-enqueued incomplete pipeline");
                }
                Err(e) => {
                    warn!(component = "sweep", %ticker, error = %e, "Failed to re-enqueue incomplete pipeline");
                }
            }
        }
        if requeued > 0 {
            info!(
                subsystem = "maintenance",
                component = "sweep",
                job_count = requeued,
                "Swept incomplete pipelines"
            );
        }
        Ok(requeued)
    }

    /// Delete terminal jobs beyond the configured history.
    pub async fn cleanup(&self) -> Result<u64> {
        let cleaned = self.jobs.cleanup(self.config.history_keep).await?;
        if cleaned > 0 {
            info!(
                subsystem = "maintenance",
                component = "cleanup",
                job_count = cleaned,
                keep = self.config.history_keep,
                "Cleaned job history"
            );
        }
        Ok(cleaned)
    }

    /// Publish a `QueueStatus` snapshot. Returns whether anything was sent.
    ///
    /// Skips the stats query entirely when nobody is subscribed.
    pub async fn emit_queue_status(&self) -> Result<bool> {
        let Some(bus) = &self.events else {
            return Ok(false);
        };
        if bus.subscriber_count() == 0 {
            return Ok(false);
        }
        let stats = self.jobs.queue_stats().await?;
        bus.emit(ServerEvent::QueueStatus {
            pending: stats.pending,
            processing: stats.processing,
            completed: stats.completed,
            failed: stats.failed,
        });
        Ok(true)
    }

    /// Run reap, sweep (when enabled) and cleanup once, in that order.
    pub async fn run_once(&self) -> Result<MaintenanceReport> {
        let reaped = self.reap().await?;
        let requeued = if self.config.sweep_enabled {
            self.sweep().await?
        } else {
            0
        };
        let cleaned = self.cleanup().await?;
        Ok(MaintenanceReport {
            reaped,
            requeued,
            cleaned,
        })
    }

    /// Start the periodic loops and return a handle for shutdown.
    pub fn start(self) -> MaintenanceHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            self.run(shutdown_rx).await;
        });
        MaintenanceHandle { shutdown_tx }
    }

    async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(
            subsystem = "maintenance",
            stuck_timeout_secs = self.config.stuck_timeout.as_secs(),
            reaper_interval_secs = self.config.reaper_interval.as_secs(),
            sweep_enabled = self.config.sweep_enabled,
            "Maintenance scheduler started"
        );

        let mut reaper = interval(self.config.reaper_interval);
        let mut sweeper = interval(self.config.sweep_interval);
        let mut status = interval(self.config.status_interval);
        for timer in [&mut reaper, &mut sweeper, &mut status] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = reaper.tick() => {
                    if let Err(e) = self.reap().await {
                        error!(component = "reaper", error = %e, "Reaper run failed");
                    }
                }
                _ = sweeper.tick() => {
                    if self.config.sweep_enabled {
                        if let Err(e) = self.sweep().await {
                            error!(component = "sweep", error = %e, "Sweep run failed");
                        }
                    }
                    if let Err(e) = self.cleanup().await {
                        error!(component = "cleanup", error = %e, "History cleanup failed");
                    }
                }
                _ = status.tick() => {
                    if let Err(e) = self.emit_queue_status().await {
                        debug!(error = %e, "Queue status snapshot failed");
                    }
                }
            }
        }

        info!(subsystem = "maintenance", "Maintenance scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickerq_core::{JobStatus, StatusPatch};
    use tickerq_db::MemoryStore;

    fn scheduler(store: &MemoryStore, config: MaintenanceConfig) -> MaintenanceScheduler {
        MaintenanceScheduler::new(Arc::new(store.clone()), Arc::new(store.clone()), config)
    }

    #[test]
    fn test_default_config() {
        let config = MaintenanceConfig::default();
        assert!(config.stuck_timeout > Duration::from_secs(defaults::JOB_TIMEOUT_SECS));
        assert!(config.sweep_enabled);
        assert_eq!(config.history_keep, defaults::JOB_HISTORY_KEEP);
    }

    #[tokio::test]
    async fn test_sweep_enqueues_incomplete_tickers_at_low_priority() {
        let store = MemoryStore::new();
        store.add_analysis_record("AAPL").unwrap();
        store.add_analysis_record("MSFT").unwrap();
        let maintenance = scheduler(&store, MaintenanceConfig::default());

        assert_eq!(maintenance.sweep().await.unwrap(), 2);

        let jobs = store.get_for_ticker("AAPL").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].priority, JobPriority::Low);
        assert_eq!(jobs[0].source, defaults::SOURCE_SWEEP);

        // Active jobs hide the tickers from the next sweep.
        assert_eq!(maintenance.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_once_reaps_and_cleans() {
        let store = MemoryStore::new();
        let done = store.enqueue(EnqueueRequest::new("KO")).await.unwrap();
        store.claim_next().await.unwrap().unwrap();
        store
            .update_status(done.id, JobStatus::Completed, StatusPatch::new())
            .await
            .unwrap();
        store.enqueue(EnqueueRequest::new("PEP")).await.unwrap();
        store.claim_next().await.unwrap().unwrap();
        store.advance(chrono::Duration::hours(1));

        let config = MaintenanceConfig::default()
            .with_stuck_timeout(Duration::from_secs(600))
            .with_sweep_enabled(false)
            .with_history_keep(0);
        let report = scheduler(&store, config).run_once().await.unwrap();

        assert_eq!(
            report,
            MaintenanceReport {
                reaped: 1,
                requeued: 0,
                cleaned: 1,
            }
        );
        assert!(store.get(done.id).await.unwrap().is_none());
        assert_eq!(store.queue_stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_queue_status_requires_subscriber() {
        let store = MemoryStore::new();
        let bus = EventBus::new(16);
        let maintenance = scheduler(&store, MaintenanceConfig::default()).with_events(bus.clone());

        assert!(!maintenance.emit_queue_status().await.unwrap());

        let mut rx = bus.subscribe();
        store.enqueue(EnqueueRequest::new("IBM")).await.unwrap();
        assert!(maintenance.emit_queue_status().await.unwrap());

        let envelope = rx.recv().await.unwrap();
        assert!(matches!(
            envelope.payload,
            ServerEvent::QueueStatus { pending: 1, processing: 0, .. }
        ));
    }
}
