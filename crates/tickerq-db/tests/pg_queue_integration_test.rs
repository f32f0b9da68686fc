//! PostgreSQL integration tests for the job queue and phase tracker.
//!
//! **IMPORTANT**: These tests require a migrated PostgreSQL database
//! (`analysis_job`, `ticker_analysis`, `ticker_score`).
//!
//! Run migrations first: `sqlx migrate run`, then
//! `cargo test -p tickerq-db --test pg_queue_integration_test -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Mutex;

use tickerq_db::test_fixtures::TestDatabase;
use tickerq_db::{
    EnqueueRequest, Error, JobPriority, JobRepository, JobStatus, Phase, PhaseTracker,
    ScoreRepository, ScoreStatus, StatusPatch,
};

/// `claim_next` takes any eligible job in the shared database, so tests that
/// call it run one at a time.
static CLAIMS: Mutex<()> = Mutex::const_new(());

fn setup() {
    let _ = dotenvy::dotenv();
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_enqueue_is_idempotent() {
    setup();
    let test_db = TestDatabase::new().await;
    let ticker = test_db.unique_ticker();

    let first = test_db
        .db
        .jobs
        .enqueue(EnqueueRequest::new(&ticker))
        .await
        .unwrap();
    let second = test_db
        .db
        .jobs
        .enqueue(EnqueueRequest::new(ticker.to_lowercase()))
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(
        test_db.db.scores.get_score(&ticker).await.unwrap().unwrap().status,
        ScoreStatus::Analyzing
    );

    test_db.cleanup().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_concurrent_enqueue_resolves_unique_violation() {
    setup();
    let test_db = Arc::new(TestDatabase::new().await);
    let ticker = test_db.unique_ticker();

    let handles = (0..8).map(|_| {
        let test_db = test_db.clone();
        let ticker = ticker.clone();
        tokio::spawn(async move { test_db.db.jobs.enqueue(EnqueueRequest::new(ticker)).await })
    });
    let jobs: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert!(jobs.iter().all(|j| j.id == jobs[0].id));

    if let Ok(test_db) = Arc::try_unwrap(test_db) {
        test_db.cleanup().await;
    }
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_force_supersedes_and_refuses_stale_completion() {
    setup();
    let test_db = TestDatabase::new().await;
    let ticker = test_db.unique_ticker();
    let jobs = &test_db.db.jobs;

    let old = jobs
        .enqueue(EnqueueRequest::new(&ticker).priority(JobPriority::High))
        .await
        .unwrap();
    let new = jobs
        .enqueue(EnqueueRequest::new(&ticker).force(true))
        .await
        .unwrap();
    assert_ne!(old.id, new.id);

    let old = jobs.get(old.id).await.unwrap().unwrap();
    assert_eq!(old.status, JobStatus::Cancelled);
    assert!(old.completed_at.is_some());

    let err = jobs
        .update_status(old.id, JobStatus::Completed, StatusPatch::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_claim_progress_complete() {
    setup();
    let test_db = TestDatabase::new().await;
    let ticker = test_db.unique_ticker();
    let jobs = &test_db.db.jobs;

    let _claims = CLAIMS.lock().await;
    let job = jobs
        .enqueue(EnqueueRequest::new(&ticker).priority(JobPriority::High))
        .await
        .unwrap();

    // Leftover high-priority work may sit ahead of ours; claim until ours.
    let mut claimed = None;
    while let Some(next) = jobs.claim_next().await.unwrap() {
        if next.id == job.id {
            claimed = Some(next);
            break;
        }
    }
    let claimed = claimed.expect("job should be claimable");
    assert_eq!(claimed.status, JobStatus::Processing);
    assert!(claimed.started_at.is_some());

    jobs.update_progress(job.id, "combined_analysis", Some(serde_json::json!({"pct": 80})))
        .await
        .unwrap();
    let done = jobs
        .update_status(
            job.id,
            JobStatus::Completed,
            StatusPatch::new().result(serde_json::json!({"score": 64.0})),
        )
        .await
        .unwrap();

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.current_step.as_deref(), Some("combined_analysis"));
    assert!(done.completed_at.is_some());

    test_db.cleanup().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_concurrent_claims_are_distinct() {
    setup();
    let test_db = Arc::new(TestDatabase::new().await);
    let _claims = CLAIMS.lock().await;

    let backlog = test_db.db.jobs.queue_stats().await.unwrap().pending as usize;
    let mut ours = Vec::new();
    for _ in 0..3 {
        let ticker = test_db.unique_ticker();
        ours.push(test_db.db.jobs.enqueue(EnqueueRequest::new(ticker)).await.unwrap().id);
    }

    let claimers = backlog + ours.len() + 5;
    let handles = (0..claimers).map(|_| {
        let test_db = test_db.clone();
        tokio::spawn(async move { test_db.db.jobs.claim_next().await })
    });
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    let mut claimed: Vec<_> = results.iter().flatten().map(|j| j.id).collect();
    let total = claimed.len();
    claimed.sort();
    claimed.dedup();
    assert_eq!(claimed.len(), total, "a job was handed to two claimers");
    assert!(ours.iter().all(|id| claimed.contains(id)));
    assert!(results.iter().filter(|r| r.is_none()).count() >= 5);

    if let Ok(test_db) = Arc::try_unwrap(test_db) {
        test_db.cleanup().await;
    }
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_claim_order_priority_then_schedule() {
    setup();
    let test_db = TestDatabase::new().await;
    let jobs = &test_db.db.jobs;
    let _claims = CLAIMS.lock().await;

    let t0 = Utc::now() - chrono::Duration::minutes(10);
    let t1 = t0 + chrono::Duration::minutes(5);
    let enqueue = |priority, at| {
        let ticker = test_db.unique_ticker();
        async move {
            jobs.enqueue(
                EnqueueRequest::new(ticker)
                    .priority(priority)
                    .scheduled_at(at),
            )
            .await
            .unwrap()
            .id
        }
    };
    let a = enqueue(JobPriority::High, t0).await;
    let b = enqueue(JobPriority::Normal, t0).await;
    let c = enqueue(JobPriority::High, t1).await;

    let mut order = Vec::new();
    while let Some(job) = jobs.claim_next().await.unwrap() {
        if [a, b, c].contains(&job.id) {
            order.push(job.id);
        }
        if order.len() == 3 {
            break;
        }
    }
    assert_eq!(order, vec![a, c, b]);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_status_report_cannot_claim_or_requeue() {
    setup();
    let test_db = TestDatabase::new().await;
    let ticker = test_db.unique_ticker();
    let jobs = &test_db.db.jobs;

    let job = jobs.enqueue(EnqueueRequest::new(&ticker)).await.unwrap();
    let err = jobs
        .update_status(job.id, JobStatus::Processing, StatusPatch::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));

    test_db.claim_job(job.id).await;
    let err = jobs
        .update_status(job.id, JobStatus::Pending, StatusPatch::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));

    let job = jobs.get(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.retry_count, 0);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_reap_stuck_returns_job_to_pending() {
    setup();
    let test_db = TestDatabase::new().await;
    let ticker = test_db.unique_ticker();
    let jobs = &test_db.db.jobs;

    let job = jobs.enqueue(EnqueueRequest::new(&ticker)).await.unwrap();
    test_db.claim_job(job.id).await;
    test_db.backdate_start(job.id, 3_600).await;

    let reaped = jobs.reap_stuck(Duration::from_secs(1_800)).await.unwrap();
    assert!(reaped >= 1);

    let job = jobs.get(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    assert!(job.started_at.is_none());

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_finish_claim_after_reap_is_refused() {
    setup();
    let test_db = TestDatabase::new().await;
    let ticker = test_db.unique_ticker();
    let jobs = &test_db.db.jobs;

    let job = jobs.enqueue(EnqueueRequest::new(&ticker)).await.unwrap();
    test_db.claim_job(job.id).await;
    test_db.backdate_start(job.id, 3_600).await;
    let stale_claim = jobs.get(job.id).await.unwrap().unwrap().started_at.unwrap();

    jobs.reap_stuck(Duration::from_secs(1_800)).await.unwrap();
    test_db.claim_job(job.id).await;
    let current_claim = jobs.get(job.id).await.unwrap().unwrap().started_at.unwrap();

    let err = jobs
        .finish_claim(job.id, stale_claim, JobStatus::Completed, StatusPatch::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ClaimLost(id) if id == job.id));
    assert_eq!(
        jobs.get(job.id).await.unwrap().unwrap().status,
        JobStatus::Processing
    );

    let done = jobs
        .finish_claim(job.id, current_claim, JobStatus::Completed, StatusPatch::new())
        .await
        .unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.retry_count, 1);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_phase_flags_under_lock() {
    setup();
    let test_db = TestDatabase::new().await;
    let ticker = test_db.unique_ticker();
    test_db.add_analysis_record(&ticker).await;
    test_db.add_analysis_record(&ticker).await;
    let phases = &test_db.db.phases;

    assert_eq!(
        phases.mark_phase_complete(&ticker, Phase::Micro).await.unwrap(),
        2
    );
    assert!(phases
        .list_incomplete()
        .await
        .unwrap()
        .contains(&ticker));

    for phase in [Phase::Macro, Phase::Combined] {
        phases.mark_phase_complete(&ticker, phase).await.unwrap();
    }
    assert!(phases
        .phase_flags(&ticker)
        .await
        .unwrap()
        .iter()
        .all(|f| f.all_complete()));
    assert!(!phases.list_incomplete().await.unwrap().contains(&ticker));

    assert_eq!(phases.reset_phase_flags(&ticker).await.unwrap(), 2);
    assert!(phases
        .phase_flags(&ticker)
        .await
        .unwrap()
        .iter()
        .all(|f| !f.micro_complete));

    phases.mark_phase_complete(&ticker, Phase::Micro).await.unwrap();
    phases.mark_phase_complete(&ticker, Phase::Macro).await.unwrap();
    let flags = phases.phase_flags(&ticker).await.unwrap();
    assert_eq!(flags.len(), 2);
    for f in flags {
        assert_eq!(
            (f.micro_complete, f.macro_complete, f.combined_complete),
            (true, true, false)
        );
    }

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires DATABASE_URL with migrated database"]
async fn test_placeholder_keeps_finished_score() {
    setup();
    let test_db = TestDatabase::new().await;
    let ticker = test_db.unique_ticker();
    test_db.put_score(&ticker, "completed", Some(55.0)).await;

    assert!(!test_db
        .db
        .scores
        .ensure_placeholder(&ticker, false)
        .await
        .unwrap());
    assert!(test_db
        .db
        .scores
        .ensure_placeholder(&ticker, true)
        .await
        .unwrap());

    let score = test_db.db.scores.get_score(&ticker).await.unwrap().unwrap();
    assert_eq!(score.status, ScoreStatus::Analyzing);
    assert!(score.final_score.is_none());

    test_db.cleanup().await;
}
