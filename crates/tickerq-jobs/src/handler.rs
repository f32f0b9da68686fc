//! Analyzer plug-in interface.
//!
//! The queue never scores tickers itself. A worker process embeds a
//! [`JobWorker`](crate::JobWorker) and hands every claimed job to an
//! [`Analyzer`], which runs the micro, macro and combined phases and reports
//! back through the [`AnalysisContext`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use tickerq_core::{Job, JobRepository, JobStatus, Phase, PhaseTracker, Result};

/// Progress callback type for analyzers.
pub type ProgressCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Context provided to analyzers for one claimed job.
pub struct AnalysisContext {
    /// The job being processed, as claimed.
    pub job: Job,
    jobs: Arc<dyn JobRepository>,
    phases: Arc<dyn PhaseTracker>,
    progress_callback: Option<ProgressCallback>,
}

impl AnalysisContext {
    /// Create a new analysis context.
    pub fn new(job: Job, jobs: Arc<dyn JobRepository>, phases: Arc<dyn PhaseTracker>) -> Self {
        Self {
            job,
            jobs,
            phases,
            progress_callback: None,
        }
    }

    /// Set the progress callback, invoked after every stored progress report.
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    pub fn ticker(&self) -> &str {
        &self.job.ticker
    }

    /// Record the current pipeline step. Clears the job's last error.
    pub async fn report_progress(&self, step: &str, details: Option<JsonValue>) -> Result<()> {
        self.jobs.update_progress(self.job.id, step, details).await?;
        if let Some(ref callback) = self.progress_callback {
            callback(step);
        }
        Ok(())
    }

    /// Mark one phase complete on every analysis record of the ticker.
    pub async fn complete_phase(&self, phase: Phase) -> Result<u64> {
        self.phases.mark_phase_complete(&self.job.ticker, phase).await
    }

    /// Whether this worker has lost the job.
    ///
    /// True once the job was cancelled (superseded by a forced enqueue),
    /// reaped back to pending, re-claimed by another worker, or deleted.
    /// Analyzers check this between phases and stop early.
    pub async fn is_cancelled(&self) -> Result<bool> {
        let current = self.jobs.get(self.job.id).await?;
        Ok(!matches!(
            current,
            Some(job) if job.status == JobStatus::Processing
                && job.started_at == self.job.started_at
        ))
    }
}

/// Result of analyzing one job.
#[derive(Debug)]
pub enum AnalysisOutcome {
    /// Pipeline finished; the optional payload is stored as the job result.
    Success(Option<JsonValue>),
    /// Pipeline failed with an error message.
    Failed(String),
    /// The analyzer stopped because the job was cancelled; nothing is reported.
    Abandoned,
}

/// Trait for the external analysis pipeline.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Run the pipeline for the job in `ctx`.
    async fn analyze(&self, ctx: AnalysisContext) -> AnalysisOutcome;
}

/// Analyzer that completes every phase without doing any work.
///
/// Used for smoke runs and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpAnalyzer;

impl NoOpAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Analyzer for NoOpAnalyzer {
    fn name(&self) -> &str {
        "noop"
    }

    async fn analyze(&self, ctx: AnalysisContext) -> AnalysisOutcome {
        for phase in Phase::ALL {
            match ctx.is_cancelled().await {
                Ok(false) => {}
                Ok(true) => return AnalysisOutcome::Abandoned,
                Err(e) => return AnalysisOutcome::Failed(e.to_string()),
            }
            let step = format!("{phase}_analysis");
            if let Err(e) = ctx.report_progress(&step, None).await {
                return AnalysisOutcome::Failed(e.to_string());
            }
            if let Err(e) = ctx.complete_phase(phase).await {
                return AnalysisOutcome::Failed(e.to_string());
            }
        }
        AnalysisOutcome::Success(Some(serde_json::json!({
            "analyzer": self.name(),
            "phases": Phase::ALL.len(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tickerq_core::EnqueueRequest;
    use tickerq_db::MemoryStore;

    async fn claimed_context(store: &MemoryStore, ticker: &str) -> AnalysisContext {
        store.enqueue(EnqueueRequest::new(ticker)).await.unwrap();
        let job = store.claim_next().await.unwrap().unwrap();
        AnalysisContext::new(job, Arc::new(store.clone()), Arc::new(store.clone()))
    }

    #[tokio::test]
    async fn test_report_progress_updates_job_and_callback() {
        let store = MemoryStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let ctx = claimed_context(&store, "AAPL")
            .await
            .with_progress_callback(move |step| sink.lock().unwrap().push(step.to_string()));

        ctx.report_progress("micro_analysis", None).await.unwrap();

        let job = store.get(ctx.job_id()).await.unwrap().unwrap();
        assert_eq!(job.current_step.as_deref(), Some("micro_analysis"));
        assert_eq!(*seen.lock().unwrap(), vec!["micro_analysis".to_string()]);
    }

    #[tokio::test]
    async fn test_is_cancelled_after_force_enqueue() {
        let store = MemoryStore::new();
        let ctx = claimed_context(&store, "MSFT").await;
        assert!(!ctx.is_cancelled().await.unwrap());

        store
            .enqueue(EnqueueRequest::new("MSFT").force(true))
            .await
            .unwrap();
        assert!(ctx.is_cancelled().await.unwrap());
    }

    #[tokio::test]
    async fn test_is_cancelled_after_reap() {
        let store = MemoryStore::new();
        let ctx = claimed_context(&store, "TSLA").await;

        store.advance(chrono::Duration::hours(2));
        store
            .reap_stuck(std::time::Duration::from_secs(60))
            .await
            .unwrap();
        assert!(ctx.is_cancelled().await.unwrap());
    }

    #[tokio::test]
    async fn test_noop_analyzer_completes_all_phases() {
        let store = MemoryStore::new();
        store.add_analysis_record("NVDA").unwrap();
        let ctx = claimed_context(&store, "NVDA").await;

        let outcome = NoOpAnalyzer::new().analyze(ctx).await;
        assert!(matches!(outcome, AnalysisOutcome::Success(Some(_))));
        assert!(store.phase_flags("NVDA").await.unwrap()[0].all_complete());
    }

    #[tokio::test]
    async fn test_noop_analyzer_abandons_cancelled_job() {
        let store = MemoryStore::new();
        store.add_analysis_record("AMD").unwrap();
        let ctx = claimed_context(&store, "AMD").await;
        store.cancel_active("AMD").await.unwrap();

        let outcome = NoOpAnalyzer::new().analyze(ctx).await;
        assert!(matches!(outcome, AnalysisOutcome::Abandoned));
        assert!(!store.phase_flags("AMD").await.unwrap()[0].micro_complete);
    }
}
