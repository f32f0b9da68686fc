//! Centralized default constants for the tickerq system.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates and binaries should reference these constants instead of defining
//! their own magic numbers.
//!
//! Organized by domain area. When adding new constants, place them in the
//! appropriate section and document the rationale for the chosen value.

// =============================================================================
// JOB SOURCES
// =============================================================================

/// Job requested interactively by a user (dashboard button, API call).
pub const SOURCE_USER: &str = "user-initiated";

/// Job created by the background sweep that re-enqueues abandoned pipelines.
pub const SOURCE_SWEEP: &str = "background-sweep";

/// Job created by a bulk import of tickers.
pub const SOURCE_BULK_IMPORT: &str = "bulk-import";

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Default advisory maximum retry count stored on new jobs.
///
/// Not enforced by the queue itself; workers read it alongside `retry_count`.
pub const JOB_MAX_RETRIES: i32 = 3;

/// Default job worker poll interval in milliseconds.
///
/// The worker is also woken by enqueue notifications when it shares the
/// repository's notify handle, so this is mostly a safety net.
pub const JOB_POLL_INTERVAL_MS: u64 = 5_000;

/// Default maximum concurrent jobs per worker.
pub const JOB_MAX_CONCURRENT: usize = 4;

/// Default job execution timeout in seconds (15 minutes).
///
/// A full micro/macro/combined pipeline including AI narrative generation
/// routinely takes several minutes.
pub const JOB_TIMEOUT_SECS: u64 = 900;

/// How many times enqueue retries its check-then-insert after losing an
/// active-job race to a job that was already gone on re-read.
pub const ENQUEUE_CONFLICT_ATTEMPTS: usize = 3;

// =============================================================================
// MAINTENANCE
// =============================================================================

/// Processing time after which a job is considered stuck (30 minutes).
///
/// Must exceed `JOB_TIMEOUT_SECS` so that a healthy worker always reports a
/// terminal status before the reaper takes the job back.
pub const STUCK_JOB_TIMEOUT_SECS: u64 = 1_800;

/// Interval between reaper runs in seconds.
pub const REAPER_INTERVAL_SECS: u64 = 60;

/// Interval between incomplete-pipeline sweeps in seconds.
pub const SWEEP_INTERVAL_SECS: u64 = 300;

/// Interval between `QueueStatus` event emissions in seconds.
pub const QUEUE_STATUS_INTERVAL_SECS: u64 = 5;

/// Number of terminal jobs retained by `cleanup` when called by maintenance.
pub const JOB_HISTORY_KEEP: i64 = 10_000;

// =============================================================================
// EVENTS
// =============================================================================

/// Default event bus broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// DATABASE
// =============================================================================

/// Default maximum number of connections in the pool.
pub const DB_MAX_CONNECTIONS: u32 = 10;

/// Default connection acquire timeout in seconds.
pub const DB_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default idle connection timeout in seconds.
pub const DB_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default maximum connection lifetime in seconds (30 minutes).
pub const DB_MAX_LIFETIME_SECS: u64 = 1_800;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stuck_timeout_exceeds_job_timeout() {
        const {
            assert!(STUCK_JOB_TIMEOUT_SECS > JOB_TIMEOUT_SECS);
        }
    }

    #[test]
    fn sources_are_distinct() {
        assert_ne!(SOURCE_USER, SOURCE_SWEEP);
        assert_ne!(SOURCE_SWEEP, SOURCE_BULK_IMPORT);
        assert_ne!(SOURCE_USER, SOURCE_BULK_IMPORT);
    }

    #[test]
    fn worker_limits_are_positive() {
        const {
            assert!(JOB_MAX_CONCURRENT > 0);
            assert!(ENQUEUE_CONFLICT_ATTEMPTS > 0);
            assert!(EVENT_BUS_CAPACITY > 0);
        }
    }
}
