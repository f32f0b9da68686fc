//! Score placeholder repository.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;

use tickerq_core::{normalize_ticker, Error, Result, ScoreRecord, ScoreRepository, ScoreStatus};

/// PostgreSQL implementation of ScoreRepository.
#[derive(Clone)]
pub struct PgScoreRepository {
    pool: Pool<Postgres>,
}

impl PgScoreRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScoreRepository for PgScoreRepository {
    async fn ensure_placeholder(&self, ticker: &str, force: bool) -> Result<bool> {
        let ticker = normalize_ticker(ticker)?;

        // The conflict branch is skipped for a finished score unless forced;
        // NaN and infinities do not count as a usable final score.
        let result = sqlx::query(
            "INSERT INTO ticker_score (ticker, status, final_score, updated_at)
             VALUES ($1, 'analyzing', NULL, $2)
             ON CONFLICT (ticker) DO UPDATE
             SET status = 'analyzing', final_score = NULL, updated_at = EXCLUDED.updated_at
             WHERE $3
                OR NOT (ticker_score.status = 'completed'
                        AND ticker_score.final_score IS NOT NULL
                        AND ticker_score.final_score NOT IN
                            ('NaN'::float8, 'Infinity'::float8, '-Infinity'::float8))",
        )
        .bind(&ticker)
        .bind(Utc::now())
        .bind(force)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        let written = result.rows_affected() > 0;
        debug!(
            subsystem = "db",
            component = "score",
            op = "ensure_placeholder",
            ticker = %ticker,
            force,
            written,
            "Score placeholder checked"
        );
        Ok(written)
    }

    async fn get_score(&self, ticker: &str) -> Result<Option<ScoreRecord>> {
        let ticker = normalize_ticker(ticker)?;
        let row = sqlx::query(
            "SELECT ticker, status, final_score, updated_at FROM ticker_score WHERE ticker = $1",
        )
        .bind(&ticker)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(|row| {
            Ok(ScoreRecord {
                ticker: row.get("ticker"),
                status: row.get::<String, _>("status").parse::<ScoreStatus>()?,
                final_score: row.get("final_score"),
                updated_at: row.get("updated_at"),
            })
        })
        .transpose()
    }
}
