//! Relational store: `sentiment_daily` keyed by `(symbol_id, date)`.
//!
//! A batch is one multi-row upsert statement, so there is no conflict path here.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use senti_core::{
    candidate_window, ExchangeCode, ExchangeMeta, SentimentRecord, StoreSnapshot, SymbolRef,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;

use crate::partition::SchemaError;
use crate::{CommitReceipt, SentimentStore, StoreError, StoreState};

pub struct PgSentimentStore {
    pool: PgPool,
}

impl PgSentimentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Reference tables and the cursor table. `sentiment_daily` belongs to the partition manager.
    pub async fn run_migrations(&self) -> Result<(), SchemaError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn symbol_id(&self, symbol: &SymbolRef) -> Result<i64, StoreError> {
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT s.id
              FROM symbols s
              JOIN exchanges e ON e.id = s.exchange_id
             WHERE e.code = $1 AND s.symbol = $2
            "#,
        )
        .bind(symbol.exchange.as_str())
        .bind(&symbol.ticker)
        .fetch_optional(&self.pool)
        .await?;
        id.ok_or_else(|| StoreError::UnknownSymbol(symbol.to_string()))
    }
}

/// First row per date wins; the statement must not touch the same key twice.
fn dedupe_by_date(rows: &[SentimentRecord]) -> Vec<SentimentRecord> {
    let mut seen = BTreeSet::new();
    rows.iter().filter(|r| seen.insert(r.date)).copied().collect()
}

#[async_trait]
impl SentimentStore for PgSentimentStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn ensure_exchange(&self, meta: &ExchangeMeta) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO exchanges (code, name, timezone, currency)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (code) DO NOTHING
            "#,
        )
        .bind(meta.code.as_str())
        .bind(&meta.name)
        .bind(&meta.timezone)
        .bind(&meta.currency)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ensure_symbol(&self, symbol: &SymbolRef) -> Result<bool, StoreError> {
        self.ensure_exchange(&ExchangeMeta::bare(symbol.exchange.clone()))
            .await?;
        let created = sqlx::query(
            r#"
            INSERT INTO symbols (exchange_id, symbol)
            SELECT id, $2 FROM exchanges WHERE code = $1
            ON CONFLICT (exchange_id, symbol) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(symbol.exchange.as_str())
        .bind(&symbol.ticker)
        .fetch_optional(&self.pool)
        .await?;
        Ok(created.is_some())
    }

    async fn set_symbol_active(&self, symbol: &SymbolRef, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE symbols s
               SET active = $3
              FROM exchanges e
             WHERE e.id = s.exchange_id AND e.code = $1 AND s.symbol = $2
            "#,
        )
        .bind(symbol.exchange.as_str())
        .bind(&symbol.ticker)
        .bind(active)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownSymbol(symbol.to_string()));
        }
        Ok(())
    }

    async fn active_symbols(&self, exchange: &ExchangeCode) -> Result<Vec<SymbolRef>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT s.symbol
              FROM symbols s
              JOIN exchanges e ON e.id = s.exchange_id
             WHERE e.code = $1 AND s.active
             ORDER BY s.symbol
            "#,
        )
        .bind(exchange.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let ticker: String = row.try_get("symbol")?;
            let symbol = SymbolRef::new(exchange.clone(), &ticker)
                .map_err(|err| StoreError::Backend(err.to_string()))?;
            out.push(symbol);
        }
        Ok(out)
    }

    async fn read_state(
        &self,
        symbol: &SymbolRef,
        today: NaiveDate,
    ) -> Result<StoreState, StoreError> {
        let symbol_id = self.symbol_id(symbol).await?;

        let cursor: Option<NaiveDate> = sqlx::query_scalar::<_, Option<NaiveDate>>(
            "SELECT last_date FROM sentiment_cursor WHERE symbol_id = $1",
        )
        .bind(symbol_id)
        .fetch_optional(&self.pool)
        .await?
        .flatten();
        let max_stored: Option<NaiveDate> =
            sqlx::query_scalar("SELECT MAX(date) FROM sentiment_daily WHERE symbol_id = $1")
                .bind(symbol_id)
                .fetch_one(&self.pool)
                .await?;

        let existing = match candidate_window(cursor, max_stored, today) {
            None => BTreeSet::new(),
            Some((start, end)) => sqlx::query_scalar::<_, NaiveDate>(
                r#"
                SELECT date FROM sentiment_daily
                 WHERE symbol_id = $1 AND date BETWEEN $2 AND $3
                "#,
            )
            .bind(symbol_id)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .collect(),
        };

        Ok(StoreState {
            cursor,
            max_stored,
            existing,
            snapshot: StoreSnapshot::Unversioned,
        })
    }

    async fn commit_batch(
        &self,
        symbol: &SymbolRef,
        rows: &[SentimentRecord],
        snapshot: &StoreSnapshot,
    ) -> Result<CommitReceipt, StoreError> {
        if *snapshot != StoreSnapshot::Unversioned {
            return Err(StoreError::SnapshotMismatch {
                backend: self.backend_name(),
                snapshot: snapshot.clone(),
            });
        }
        let rows = dedupe_by_date(rows);
        let last_committed = rows.iter().map(|r| r.date).max();
        if rows.is_empty() {
            return Ok(CommitReceipt {
                written: 0,
                already_present: 0,
                last_committed,
                snapshot: StoreSnapshot::Unversioned,
            });
        }

        let symbol_id = self.symbol_id(symbol).await?;
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO sentiment_daily (symbol_id, date, value) ");
        qb.push_values(&rows, |mut b, row| {
            b.push_bind(symbol_id)
                .push_bind(row.date)
                .push_bind(row.value.as_i16());
        });
        qb.push(
            " ON CONFLICT (symbol_id, date) DO UPDATE \
             SET value = EXCLUDED.value, written_at = now() \
             RETURNING (xmax = 0) AS inserted",
        );

        let inserted: Vec<bool> = qb
            .build_query_scalar()
            .fetch_all(&self.pool)
            .await?;
        let written = inserted.iter().filter(|fresh| **fresh).count();
        debug!(%symbol, written, updated = inserted.len() - written, "batch upserted");

        Ok(CommitReceipt {
            written,
            already_present: inserted.len() - written,
            last_committed,
            snapshot: StoreSnapshot::Unversioned,
        })
    }

    async fn upsert_cursor(&self, symbol: &SymbolRef, date: NaiveDate) -> Result<(), StoreError> {
        let symbol_id = self.symbol_id(symbol).await?;
        sqlx::query(
            r#"
            INSERT INTO sentiment_cursor (symbol_id, last_date, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (symbol_id) DO UPDATE
               SET last_date = GREATEST(sentiment_cursor.last_date, EXCLUDED.last_date),
                   updated_at = now()
            "#,
        )
        .bind(symbol_id)
        .bind(date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
