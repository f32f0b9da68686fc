//! Server event types, envelope schema, and event bus for change notifications.
//!
//! Repositories and the worker publish state changes (job queued, claimed,
//! progressed, finished, reaped; phase flags reset or completed) into a single
//! broadcast channel. UI-facing caches, dashboards and tests subscribe
//! independently.
//!
//! The bus is constructed explicitly and handed to the components that
//! publish; there is no process-wide instance, so every test can own an
//! isolated bus.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{JobPriority, Phase};

// ============================================================================
// Event Envelope
// ============================================================================

/// Versioned event envelope.
///
/// The `event_type` field uses dot-namespaced names (e.g. `"job.queued"`,
/// `"phase.completed"`). The `payload` carries the domain event.
///
/// Consumers should ignore unknown fields; `payload_version` increments on
/// breaking payload changes.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// Unique event identifier (UUIDv7 for temporal ordering).
    pub event_id: Uuid,
    /// Namespaced event type.
    pub event_type: String,
    /// When the event occurred (UTC).
    pub occurred_at: DateTime<Utc>,
    /// Type of entity this event relates to (`"job"`, `"ticker"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    /// ID of the entity this event relates to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Payload schema version.
    pub payload_version: u32,
    /// Domain-specific event data.
    pub payload: ServerEvent,
}

impl EventEnvelope {
    /// Wrap a ServerEvent, stamping a fresh id and the current time.
    pub fn new(event: ServerEvent) -> Self {
        Self {
            event_id: crate::uuid_utils::new_v7(),
            event_type: event.namespaced_event_type().to_string(),
            occurred_at: Utc::now(),
            entity_type: event.entity_type().map(String::from),
            entity_id: event.entity_id(),
            payload_version: 1,
            payload: event,
        }
    }
}

// ============================================================================
// Server Event (domain payloads)
// ============================================================================

/// Domain events published by the queue, phase tracker and worker.
///
/// Serialized as JSON with a `type` tag field, e.g.
/// `{"type":"JobQueued","job_id":"...","ticker":"AAPL","priority":"high"}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Periodic queue statistics broadcast.
    QueueStatus {
        pending: i64,
        processing: i64,
        completed: i64,
        failed: i64,
    },
    /// A new job was created.
    JobQueued {
        job_id: Uuid,
        ticker: String,
        priority: JobPriority,
        source: String,
    },
    /// A job was claimed by a worker.
    JobStarted { job_id: Uuid, ticker: String },
    /// A worker reported progress.
    JobProgress {
        job_id: Uuid,
        step: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
    /// A job completed successfully.
    JobCompleted {
        job_id: Uuid,
        ticker: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<i64>,
    },
    /// A job failed.
    JobFailed {
        job_id: Uuid,
        ticker: String,
        error: String,
    },
    /// A job was cancelled (superseded or explicitly abandoned).
    JobCancelled { job_id: Uuid, ticker: String },
    /// A stuck job was returned to pending by the reaper.
    JobReaped {
        job_id: Uuid,
        ticker: String,
        retry_count: i32,
    },
    /// A phase flag was set for every record of a ticker.
    PhaseCompleted {
        ticker: String,
        phase: Phase,
        records: u64,
    },
    /// All phase flags of a ticker were cleared.
    PhasesReset { ticker: String, records: u64 },
}

impl ServerEvent {
    /// Short event type name (variant name).
    pub fn event_type(&self) -> &'static str {
        match self {
            ServerEvent::QueueStatus { .. } => "QueueStatus",
            ServerEvent::JobQueued { .. } => "JobQueued",
            ServerEvent::JobStarted { .. } => "JobStarted",
            ServerEvent::JobProgress { .. } => "JobProgress",
            ServerEvent::JobCompleted { .. } => "JobCompleted",
            ServerEvent::JobFailed { .. } => "JobFailed",
            ServerEvent::JobCancelled { .. } => "JobCancelled",
            ServerEvent::JobReaped { .. } => "JobReaped",
            ServerEvent::PhaseCompleted { .. } => "PhaseCompleted",
            ServerEvent::PhasesReset { .. } => "PhasesReset",
        }
    }

    /// Namespaced event type for the envelope (e.g. `"job.queued"`).
    pub fn namespaced_event_type(&self) -> &'static str {
        match self {
            ServerEvent::QueueStatus { .. } => "queue.status",
            ServerEvent::JobQueued { .. } => "job.queued",
            ServerEvent::JobStarted { .. } => "job.started",
            ServerEvent::JobProgress { .. } => "job.progress",
            ServerEvent::JobCompleted { .. } => "job.completed",
            ServerEvent::JobFailed { .. } => "job.failed",
            ServerEvent::JobCancelled { .. } => "job.cancelled",
            ServerEvent::JobReaped { .. } => "job.reaped",
            ServerEvent::PhaseCompleted { .. } => "phase.completed",
            ServerEvent::PhasesReset { .. } => "phase.reset",
        }
    }

    /// Returns the entity type this event relates to.
    pub fn entity_type(&self) -> Option<&'static str> {
        match self {
            ServerEvent::QueueStatus { .. } => None,
            ServerEvent::PhaseCompleted { .. } | ServerEvent::PhasesReset { .. } => {
                Some("ticker")
            }
            _ => Some("job"),
        }
    }

    /// Returns the primary entity ID this event relates to.
    pub fn entity_id(&self) -> Option<String> {
        match self {
            ServerEvent::QueueStatus { .. } => None,
            ServerEvent::JobQueued { job_id, .. }
            | ServerEvent::JobStarted { job_id, .. }
            | ServerEvent::JobProgress { job_id, .. }
            | ServerEvent::JobCompleted { job_id, .. }
            | ServerEvent::JobFailed { job_id, .. }
            | ServerEvent::JobCancelled { job_id, .. }
            | ServerEvent::JobReaped { job_id, .. } => Some(job_id.to_string()),
            ServerEvent::PhaseCompleted { ticker, .. } | ServerEvent::PhasesReset { ticker, .. } => {
                Some(ticker.clone())
            }
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Broadcast-based event bus for distributing server events to multiple consumers.
///
/// Uses `tokio::sync::broadcast` with a configurable buffer size. Slow
/// receivers that fall behind get a `Lagged` error and miss events; consumers
/// needing exact state re-read it from the store.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    ///
    /// Recommended: 256 for production, 32 for tests.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers.
    ///
    /// If there are no active subscribers, the event is silently dropped.
    pub fn emit(&self, event: ServerEvent) {
        let envelope = EventEnvelope::new(event);
        tracing::debug!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            subscriber_count = self.tx.receiver_count(),
            "EventBus emit"
        );
        let _ = self.tx.send(envelope);
    }

    /// Subscribe to receive enveloped events.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}

// ============================================================================
// Tests
// ============================================================================
