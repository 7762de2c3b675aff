//! Yearly range partitions for `sentiment_daily`.
//!
//! The manager only ever creates the partitioned layout. It never converts a populated
//! table: that needs an offline migration.

use async_trait::async_trait;
use chrono::Datelike;
use sqlx::{PgConnection, PgPool};
use thiserror::Error;
use tracing::{info, warn};

pub const SENTIMENT_TABLE: &str = "sentiment_daily";

/// Key for `pg_advisory_xact_lock`, shared by every process running the manager.
const PARTITION_LOCK_KEY: i64 = 0x5e17_da11;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("{table} is unpartitioned and holds {rows} rows; refusing to convert it in place")]
    NotEmpty { table: &'static str, rows: i64 },
    #[error("invalid partition range {first_year}..={last_year}")]
    InvalidRange { first_year: i32, last_year: i32 },
    #[error("schema database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("schema migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableLayout {
    Missing,
    Unpartitioned { rows: i64 },
    Partitioned { partitions: Vec<String> },
}

impl TableLayout {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Unpartitioned { .. } => "unpartitioned",
            Self::Partitioned { .. } => "partitioned",
        }
    }
}

/// Years covered by explicit partitions; dates outside fall into `pmin` / `pmax`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionPlan {
    pub first_year: i32,
    pub last_year: i32,
}

impl PartitionPlan {
    pub fn new(first_year: i32, last_year: i32) -> Result<Self, SchemaError> {
        if first_year > last_year {
            return Err(SchemaError::InvalidRange {
                first_year,
                last_year,
            });
        }
        Ok(Self {
            first_year,
            last_year,
        })
    }

    /// `first_year ..= current_year + years_ahead`.
    pub fn through_years_ahead(
        first_year: i32,
        today: chrono::NaiveDate,
        years_ahead: u32,
    ) -> Result<Self, SchemaError> {
        let ahead = i32::try_from(years_ahead).unwrap_or(i32::MAX);
        Self::new(first_year, today.year().saturating_add(ahead))
    }

    pub fn partition_names(&self) -> Vec<String> {
        let mut names = vec![format!("{SENTIMENT_TABLE}_pmin")];
        names.extend((self.first_year..=self.last_year).map(|y| format!("{SENTIMENT_TABLE}_p{y}")));
        names.push(format!("{SENTIMENT_TABLE}_pmax"));
        names
    }

    /// DDL creating the partitioned parent and every partition.
    pub fn create_statements(&self) -> Vec<String> {
        let mut stmts = vec![format!(
            r#"CREATE TABLE {SENTIMENT_TABLE} (
    symbol_id BIGINT NOT NULL REFERENCES symbols(id),
    date DATE NOT NULL,
    value SMALLINT NOT NULL CHECK (value IN (0, 1, 2)),
    written_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (symbol_id, date)
) PARTITION BY RANGE (date)"#
        )];

        stmts.push(format!(
            "CREATE TABLE {SENTIMENT_TABLE}_pmin PARTITION OF {SENTIMENT_TABLE} \
             FOR VALUES FROM (MINVALUE) TO ('{}-01-01')",
            self.first_year
        ));
        for year in self.first_year..=self.last_year {
            stmts.push(format!(
                "CREATE TABLE {SENTIMENT_TABLE}_p{year} PARTITION OF {SENTIMENT_TABLE} \
                 FOR VALUES FROM ('{year}-01-01') TO ('{}-01-01')",
                year + 1
            ));
        }
        stmts.push(format!(
            "CREATE TABLE {SENTIMENT_TABLE}_pmax PARTITION OF {SENTIMENT_TABLE} \
             FOR VALUES FROM ('{}-01-01') TO (MAXVALUE)",
            self.last_year + 1
        ));
        stmts
    }
}

impl PartitionPlan {
    /// DDL that takes `layout` to the partitioned layout. `None` when nothing is needed.
    pub fn statements_for(&self, layout: &TableLayout) -> Result<Option<Vec<String>>, SchemaError> {
        match layout {
            TableLayout::Partitioned { .. } => Ok(None),
            TableLayout::Unpartitioned { rows } if *rows > 0 => Err(SchemaError::NotEmpty {
                table: SENTIMENT_TABLE,
                rows: *rows,
            }),
            TableLayout::Unpartitioned { .. } => {
                let mut stmts = vec![format!("DROP TABLE {SENTIMENT_TABLE}")];
                stmts.extend(self.create_statements());
                Ok(Some(stmts))
            }
            TableLayout::Missing => Ok(Some(self.create_statements())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionReport {
    pub layout_before: &'static str,
    pub statements_applied: usize,
    pub partitions: Vec<String>,
}

/// Where the table layout is read from and DDL is sent to.
#[async_trait]
pub trait PartitionCatalog: Send + Sync {
    async fn inspect(&self) -> Result<TableLayout, SchemaError>;

    /// Under the lock, re-inspect and execute whatever `plan` needs for the layout found
    /// there, atomically. Returns the number of statements executed.
    async fn apply(&self, plan: &PartitionPlan) -> Result<usize, SchemaError>;
}

pub struct PartitionManager<C> {
    catalog: C,
    plan: PartitionPlan,
}

impl<C: PartitionCatalog> PartitionManager<C> {
    pub fn new(catalog: C, plan: PartitionPlan) -> Self {
        Self { catalog, plan }
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    /// Check-then-act; safe to call on every start.
    pub async fn ensure(&self) -> Result<PartitionReport, SchemaError> {
        let layout = self.catalog.inspect().await?;
        let layout_before = layout.label();

        if let TableLayout::Partitioned { partitions } = &layout {
            info!(table = SENTIMENT_TABLE, partitions = partitions.len(), "already partitioned");
            return Ok(PartitionReport {
                layout_before,
                statements_applied: 0,
                partitions: partitions.clone(),
            });
        }
        if let TableLayout::Unpartitioned { rows: 0 } = layout {
            warn!(table = SENTIMENT_TABLE, "replacing empty unpartitioned table");
        }
        // fail fast on a populated table before taking the lock
        self.plan.statements_for(&layout)?;

        let statements_applied = self.catalog.apply(&self.plan).await?;
        info!(
            table = SENTIMENT_TABLE,
            first_year = self.plan.first_year,
            last_year = self.plan.last_year,
            statements_applied,
            "partition layout ensured"
        );

        Ok(PartitionReport {
            layout_before,
            statements_applied,
            partitions: self.plan.partition_names(),
        })
    }
}

pub struct PgPartitionCatalog {
    pool: PgPool,
}

impl PgPartitionCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn inspect_layout(conn: &mut PgConnection) -> Result<TableLayout, sqlx::Error> {
    let relkind: Option<String> = sqlx::query_scalar(
        r#"
        SELECT c.relkind::text
        FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = current_schema() AND c.relname = $1
        "#,
    )
    .bind(SENTIMENT_TABLE)
    .fetch_optional(&mut *conn)
    .await?;

    match relkind.as_deref() {
        None => Ok(TableLayout::Missing),
        Some("p") => {
            let partitions: Vec<String> = sqlx::query_scalar(
                r#"
                SELECT child.relname::text
                FROM pg_inherits i
                JOIN pg_class parent ON parent.oid = i.inhparent
                JOIN pg_class child ON child.oid = i.inhrelid
                JOIN pg_namespace n ON n.oid = parent.relnamespace
                WHERE n.nspname = current_schema() AND parent.relname = $1
                ORDER BY child.relname
                "#,
            )
            .bind(SENTIMENT_TABLE)
            .fetch_all(&mut *conn)
            .await?;
            Ok(TableLayout::Partitioned { partitions })
        }
        Some(_) => {
            let rows: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {SENTIMENT_TABLE}"))
                .fetch_one(&mut *conn)
                .await?;
            Ok(TableLayout::Unpartitioned { rows })
        }
    }
}

#[async_trait]
impl PartitionCatalog for PgPartitionCatalog {
    async fn inspect(&self) -> Result<TableLayout, SchemaError> {
        let mut conn = self.pool.acquire().await?;
        Ok(inspect_layout(&mut conn).await?)
    }

    async fn apply(&self, plan: &PartitionPlan) -> Result<usize, SchemaError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(PARTITION_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        // The layout may have changed since the unlocked inspect; only this one counts.
        let layout = inspect_layout(&mut tx).await?;
        let statements = match plan.statements_for(&layout) {
            Ok(Some(statements)) => statements,
            Ok(None) => {
                tx.rollback().await?;
                return Ok(0);
            }
            Err(err) => {
                tx.rollback().await?;
                return Err(err);
            }
        };

        for stmt in &statements {
            sqlx::query(stmt).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(statements.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Catalog whose layout can change between the unlocked inspect and `apply`.
    struct FakeCatalog {
        layout: Mutex<TableLayout>,
        layout_under_lock: Mutex<Option<TableLayout>>,
        executed: Mutex<Vec<String>>,
    }

    impl FakeCatalog {
        fn new(layout: TableLayout) -> Self {
            Self {
                layout: Mutex::new(layout),
                layout_under_lock: Mutex::new(None),
                executed: Mutex::new(Vec::new()),
            }
        }

        fn changes_before_lock(self, layout: TableLayout) -> Self {
            *self.layout_under_lock.lock().unwrap() = Some(layout);
            self
        }

        fn ddl_executed(&self) -> usize {
            self.executed.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PartitionCatalog for FakeCatalog {
        async fn inspect(&self) -> Result<TableLayout, SchemaError> {
            Ok(self.layout.lock().unwrap().clone())
        }

        async fn apply(&self, plan: &PartitionPlan) -> Result<usize, SchemaError> {
            if let Some(changed) = self.layout_under_lock.lock().unwrap().take() {
                *self.layout.lock().unwrap() = changed;
            }
            let current = self.layout.lock().unwrap().clone();
            let Some(statements) = plan.statements_for(&current)? else {
                return Ok(0);
            };
            let partitions = statements
                .iter()
                .filter_map(|s| s.strip_prefix("CREATE TABLE "))
                .filter_map(|s| s.split_whitespace().next())
                .filter(|name| *name != SENTIMENT_TABLE)
                .map(str::to_string)
                .collect();
            *self.layout.lock().unwrap() = TableLayout::Partitioned { partitions };
            self.executed.lock().unwrap().extend(statements.iter().cloned());
            Ok(statements.len())
        }
    }

    fn plan() -> PartitionPlan {
        PartitionPlan::new(2023, 2025).unwrap()
    }

    #[test]
    fn plan_covers_every_year_plus_catch_alls() {
        let stmts = plan().create_statements();
        assert_eq!(stmts.len(), 1 + 1 + 3 + 1);
        assert!(stmts[0].ends_with("PARTITION BY RANGE (date)"));
        assert!(stmts[2].contains("sentiment_daily_p2023"));
        assert!(stmts[2].contains("FROM ('2023-01-01') TO ('2024-01-01')"));
        assert!(stmts[5].contains("FROM ('2026-01-01') TO (MAXVALUE)"));
        assert_eq!(
            plan().partition_names(),
            vec![
                "sentiment_daily_pmin",
                "sentiment_daily_p2023",
                "sentiment_daily_p2024",
                "sentiment_daily_p2025",
                "sentiment_daily_pmax"
            ]
        );
    }

    #[test]
    fn years_ahead_extends_from_today() {
        let today = chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let plan = PartitionPlan::through_years_ahead(2023, today, 3).unwrap();
        assert_eq!((plan.first_year, plan.last_year), (2023, 2027));
        assert!(matches!(
            PartitionPlan::new(2030, 2024),
            Err(SchemaError::InvalidRange { .. })
        ));
    }

    #[tokio::test]
    async fn second_run_against_partitioned_table_executes_no_ddl() {
        let manager = PartitionManager::new(FakeCatalog::new(TableLayout::Missing), plan());

        let first = manager.ensure().await.unwrap();
        assert_eq!(first.layout_before, "missing");
        assert_eq!(first.statements_applied, 6);
        let after_first = manager.catalog().ddl_executed();

        let second = manager.ensure().await.unwrap();
        assert_eq!(second.layout_before, "partitioned");
        assert_eq!(second.statements_applied, 0);
        assert_eq!(second.partitions.len(), 5);
        assert_eq!(manager.catalog().ddl_executed(), after_first);
    }

    #[tokio::test]
    async fn populated_unpartitioned_table_is_refused() {
        let catalog = FakeCatalog::new(TableLayout::Unpartitioned { rows: 12 });
        let manager = PartitionManager::new(catalog, plan());
        let err = manager.ensure().await.unwrap_err();
        assert!(matches!(err, SchemaError::NotEmpty { rows: 12, .. }));
        assert_eq!(manager.catalog().ddl_executed(), 0);
    }

    #[tokio::test]
    async fn empty_unpartitioned_table_is_dropped_and_recreated() {
        let catalog = FakeCatalog::new(TableLayout::Unpartitioned { rows: 0 });
        let manager = PartitionManager::new(catalog, plan());
        let report = manager.ensure().await.unwrap();
        assert_eq!(report.statements_applied, 7);
        assert!(matches!(
            manager.catalog().inspect().await.unwrap(),
            TableLayout::Partitioned { .. }
        ));
    }

    #[tokio::test]
    async fn statements_follow_the_layout_seen_under_the_lock() {
        let catalog = FakeCatalog::new(TableLayout::Missing)
            .changes_before_lock(TableLayout::Unpartitioned { rows: 0 });
        let manager = PartitionManager::new(catalog, plan());

        let report = manager.ensure().await.unwrap();

        assert_eq!(report.layout_before, "missing");
        assert_eq!(report.statements_applied, 7);
        let executed = manager.catalog().executed.lock().unwrap().clone();
        assert_eq!(executed[0], "DROP TABLE sentiment_daily");
    }

    #[tokio::test]
    async fn table_partitioned_by_another_process_meanwhile_gets_no_ddl() {
        let catalog =
            FakeCatalog::new(TableLayout::Missing).changes_before_lock(TableLayout::Partitioned {
                partitions: vec!["sentiment_daily_p2024".to_string()],
            });
        let manager = PartitionManager::new(catalog, plan());

        let report = manager.ensure().await.unwrap();

        assert_eq!(report.statements_applied, 0);
        assert_eq!(manager.catalog().ddl_executed(), 0);
    }

    #[tokio::test]
    async fn table_filled_meanwhile_is_refused_under_the_lock() {
        let catalog = FakeCatalog::new(TableLayout::Unpartitioned { rows: 0 })
            .changes_before_lock(TableLayout::Unpartitioned { rows: 3 });
        let manager = PartitionManager::new(catalog, plan());

        let err = manager.ensure().await.unwrap_err();

        assert!(matches!(err, SchemaError::NotEmpty { rows: 3, .. }));
        assert_eq!(manager.catalog().ddl_executed(), 0);
    }
}
