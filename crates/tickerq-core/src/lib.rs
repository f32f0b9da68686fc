//! # tickerq-core
//!
//! Core types, traits, and abstractions for the tickerq analysis queue.
//!
//! Storage backends (`tickerq-db`) and the worker runtime (`tickerq-jobs`)
//! depend on this crate and never on each other's internals.
//!
//! ## Log levels
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), job state transitions |
//! | DEBUG | Decision points, idempotent no-ops, config choices |
//! | TRACE | Per-row iteration, high-volume data |
//!
//! Structured fields use the same names everywhere: `subsystem`,
//! `component`, `op`, `job_id`, `ticker`, `phase`, `duration_ms`.

pub mod defaults;
pub mod error;
pub mod events;
pub mod models;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{EventBus, EventEnvelope, ServerEvent};
pub use models::*;
pub use traits::*;
pub use uuid_utils::{is_v7, new_v7};
