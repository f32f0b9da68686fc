//! # tickerq-jobs
//!
//! Worker runtime and background maintenance for the tickerq analysis queue.
//!
//! This crate provides:
//! - Concurrent job workers that claim analysis jobs and drive an [`Analyzer`]
//! - Cooperative cancellation for jobs superseded by a forced enqueue
//! - Progress notifications via broadcast channels
//! - A maintenance scheduler that reaps stuck jobs, sweeps unfinished
//!   pipelines and publishes queue status
//!
//! ## Example
//!
//! ```ignore
//! use tickerq_db::Database;
//! use tickerq_jobs::{NoOpAnalyzer, WorkerBuilder, WorkerConfig};
//!
//! let db = Database::connect("postgres://...").await?;
//!
//! let worker = WorkerBuilder::for_database(&db)
//!     .with_config(WorkerConfig::from_env())
//!     .with_analyzer(NoOpAnalyzer::new())
//!     .build()?;
//!
//! let handle = worker.start();
//!
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! handle.shutdown().await?;
//! ```

pub mod handler;
pub mod maintenance;
pub mod worker;

// Re-export core types
pub use tickerq_core::*;

pub use handler::{AnalysisContext, AnalysisOutcome, Analyzer, NoOpAnalyzer, ProgressCallback};
pub use maintenance::{
    MaintenanceConfig, MaintenanceHandle, MaintenanceReport, MaintenanceScheduler,
};
pub use worker::{JobWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};

