//! Worker integration tests against PostgreSQL.
//!
//! Requires a migrated database; run with
//! `cargo test -p tickerq-jobs --test pg_worker_integration_test -- --ignored`.

use std::sync::Arc;

use tickerq_db::test_fixtures::TestDatabase;
use tickerq_jobs::{
    EnqueueRequest, JobPriority, JobRepository, JobStatus, MaintenanceConfig,
    MaintenanceScheduler, NoOpAnalyzer, PhaseTracker, WorkerBuilder,
};

fn setup() {
    let _ = dotenvy::dotenv();
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_worker_runs_pipeline_end_to_end() {
    setup();
    let test_db = TestDatabase::new().await;
    let ticker = test_db.unique_ticker();
    test_db.add_analysis_record(&ticker).await;

    let job = test_db
        .db
        .jobs
        .enqueue(EnqueueRequest::new(&ticker).priority(JobPriority::High))
        .await
        .unwrap();

    let worker = WorkerBuilder::for_database(&test_db.db)
        .with_analyzer(NoOpAnalyzer::new())
        .build()
        .unwrap();

    // Shared database: other queued work may be claimed first.
    let mut processed = false;
    while let Some(job_id) = worker.run_once().await {
        if job_id == job.id {
            processed = true;
            break;
        }
    }
    assert!(processed, "worker should claim the queued job");

    let done = test_db.db.jobs.get(job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!(test_db
        .db
        .phases
        .phase_flags(&ticker)
        .await
        .unwrap()
        .iter()
        .all(|f| f.all_complete()));

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_sweep_requeues_unfinished_pipeline() {
    setup();
    let test_db = TestDatabase::new().await;
    let ticker = test_db.unique_ticker();
    test_db.add_analysis_record(&ticker).await;

    let maintenance = MaintenanceScheduler::new(
        Arc::new(test_db.db.jobs.clone()),
        Arc::new(test_db.db.phases.clone()),
        MaintenanceConfig::default(),
    );
    assert!(maintenance.sweep().await.unwrap() >= 1);

    let jobs = test_db.db.jobs.get_for_ticker(&ticker).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Pending);
    assert_eq!(jobs[0].priority, JobPriority::Low);

    test_db.cleanup().await;
}
