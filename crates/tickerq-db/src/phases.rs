//! Phase flag tracker.
//!
//! Every write to a ticker's phase flags runs in its own transaction that
//! first takes a transaction-scoped advisory lock keyed by the ticker, so a
//! reset and a concurrent mark for the same ticker never interleave across
//! the ticker's records. The lock is released on commit or rollback.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, info};

use tickerq_core::{
    normalize_ticker, Error, EventBus, Phase, PhaseFlags, PhaseTracker, Result, ServerEvent,
};

/// Key namespace for phase advisory locks.
const LOCK_PREFIX: &str = "phase:";

/// PostgreSQL implementation of PhaseTracker.
#[derive(Clone)]
pub struct PgPhaseTracker {
    pool: Pool<Postgres>,
    events: Option<EventBus>,
}

impl PgPhaseTracker {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool, events: None }
    }

    /// Publish phase events on `bus`.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    fn lock_key(ticker: &str) -> String {
        format!("{LOCK_PREFIX}{ticker}")
    }

    /// Run `update_sql` (bound with the ticker as `$1`) under the ticker's lock.
    async fn locked_update(&self, ticker: &str, update_sql: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(Self::lock_key(ticker))
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let result = sqlx::query(update_sql)
            .bind(ticker)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PhaseTracker for PgPhaseTracker {
    async fn reset_phase_flags(&self, ticker: &str) -> Result<u64> {
        let ticker = normalize_ticker(ticker)?;
        let records = self
            .locked_update(
                &ticker,
                "UPDATE ticker_analysis
                 SET micro_complete = FALSE, macro_complete = FALSE, combined_complete = FALSE
                 WHERE ticker = $1",
            )
            .await?;

        debug!(
            subsystem = "db",
            component = "phase_tracker",
            op = "reset_phase_flags",
            ticker = %ticker,
            rows_affected = records,
            "Phase flags reset"
        );
        if records > 0 {
            if let Some(bus) = &self.events {
                bus.emit(ServerEvent::PhasesReset { ticker, records });
            }
        }
        Ok(records)
    }

    async fn mark_phase_complete(&self, ticker: &str, phase: Phase) -> Result<u64> {
        let ticker = normalize_ticker(ticker)?;
        let sql = format!(
            "UPDATE ticker_analysis SET {} = TRUE WHERE ticker = $1",
            phase.column()
        );
        let records = self.locked_update(&ticker, &sql).await?;

        info!(
            subsystem = "db",
            component = "phase_tracker",
            op = "mark_phase_complete",
            ticker = %ticker,
            phase = %phase,
            rows_affected = records,
            "Phase marked complete"
        );
        if records > 0 {
            if let Some(bus) = &self.events {
                bus.emit(ServerEvent::PhaseCompleted {
                    ticker,
                    phase,
                    records,
                });
            }
        }
        Ok(records)
    }

    async fn list_incomplete(&self) -> Result<Vec<String>> {
        let tickers: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT ta.ticker
             FROM ticker_analysis ta
             WHERE ta.recommendation_status = 'pending'
               AND NOT (ta.micro_complete AND ta.macro_complete AND ta.combined_complete)
               AND NOT EXISTS (
                   SELECT 1 FROM analysis_job j
                   WHERE j.ticker = ta.ticker
                     AND j.status IN ('pending', 'processing')
               )
             ORDER BY ta.ticker",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(tickers)
    }

    async fn phase_flags(&self, ticker: &str) -> Result<Vec<PhaseFlags>> {
        let ticker = normalize_ticker(ticker)?;
        let rows = sqlx::query(
            "SELECT id, ticker, micro_complete, macro_complete, combined_complete
             FROM ticker_analysis
             WHERE ticker = $1
             ORDER BY created_at, id",
        )
        .bind(&ticker)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| PhaseFlags {
                record_id: row.get("id"),
                ticker: row.get("ticker"),
                micro_complete: row.get("micro_complete"),
                macro_complete: row.get("macro_complete"),
                combined_complete: row.get("combined_complete"),
            })
            .collect())
    }
}
