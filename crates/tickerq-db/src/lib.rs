//! # tickerq-db
//!
//! PostgreSQL storage layer for the tickerq analysis queue.
//!
//! This crate provides:
//! - Connection pool management
//! - The analysis job queue (`PgJobRepository`)
//! - Per-ticker phase flags under advisory locks (`PgPhaseTracker`)
//! - Score placeholders (`PgScoreRepository`)
//! - An in-memory store with the same semantics for tests (`MemoryStore`)
//!
//! ## Example
//!
//! ```rust,ignore
//! use tickerq_db::{Database, EnqueueRequest, JobPriority, JobRepository};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/tickerq").await?;
//!
//!     let job = db
//!         .jobs
//!         .enqueue(EnqueueRequest::new("AAPL").priority(JobPriority::High))
//!         .await?;
//!
//!     println!("Queued analysis job {} for {}", job.id, job.ticker);
//!     Ok(())
//! }
//! ```
pub mod jobs;
pub mod memory;
pub mod phases;
pub mod pool;
pub mod scores;

// Test fixtures for integration tests
// Note: Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

// Re-export core types
pub use tickerq_core::*;

pub use jobs::PgJobRepository;
pub use memory::MemoryStore;
pub use phases::PgPhaseTracker;
pub use pool::{open_pool, PoolConfig, PoolHealth};
pub use scores::PgScoreRepository;

/// Combined database context with all repositories.
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Analysis job queue.
    pub jobs: PgJobRepository,
    /// Phase flag tracker.
    pub phases: PgPhaseTracker,
    /// Score placeholder repository.
    pub scores: PgScoreRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            jobs: PgJobRepository::new(pool.clone()),
            phases: PgPhaseTracker::new(pool.clone()),
            scores: PgScoreRepository::new(pool.clone()),
            pool,
        }
    }

    /// Attach an event bus to every repository that publishes.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.jobs = self.jobs.with_events(bus.clone());
        self.phases = self.phases.with_events(bus);
        self
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, PoolConfig::default()).await
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = open_pool(url, &config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }

    /// Current connection counts of the shared pool.
    pub fn pool_health(&self) -> PoolHealth {
        PoolHealth::of(&self.pool)
    }
}
