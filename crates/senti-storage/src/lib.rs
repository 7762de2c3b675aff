//! Store adapters, retrying HTTP transport, and relational partition management.
//!
//! Both backends implement [`SentimentStore`], so the orchestrator never knows whether it
//! is appending to a versioned blob or upserting into Postgres.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use senti_core::{ExchangeCode, ExchangeMeta, SentimentRecord, StoreSnapshot, SymbolRef};
use thiserror::Error;

pub mod blob;
pub mod fs;
pub mod github;
pub mod http;
pub mod partition;
pub mod postgres;
pub mod table;

pub use blob::{BlobBackend, BlobError, BlobLayout, BlobObject, BlobSentimentStore};
pub use fs::{FsBlobBackend, MemoryBlobBackend};
pub use github::{GithubContentsBackend, GithubTarget};
pub use http::{
    BackoffPolicy, HttpClientConfig, RetryingHttpClient, TokenBucketConfig, TransportError,
};
pub use partition::{
    PartitionCatalog, PartitionManager, PartitionPlan, PartitionReport, PgPartitionCatalog,
    SchemaError, TableLayout,
};
pub use postgres::PgSentimentStore;
pub use table::SentimentTable;

pub const CRATE_NAME: &str = "senti-storage";

/// What a symbol's unit of work needs to know before asking the oracle anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreState {
    pub cursor: Option<NaiveDate>,
    pub max_stored: Option<NaiveDate>,
    /// Stored dates; at least every stored date inside the candidate window.
    pub existing: BTreeSet<NaiveDate>,
    pub snapshot: StoreSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub written: usize,
    pub already_present: usize,
    /// Newest date of the batch, all of which is now persisted.
    pub last_committed: Option<NaiveDate>,
    pub snapshot: StoreSnapshot,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The version token no longer matches: someone else wrote in between.
    #[error("version conflict writing {target}")]
    Conflict { target: String },
    #[error(transparent)]
    Transient(TransportError),
    #[error("unknown symbol {0}")]
    UnknownSymbol(String),
    #[error("snapshot {snapshot:?} cannot be used with the {backend} backend")]
    SnapshotMismatch {
        backend: &'static str,
        snapshot: StoreSnapshot,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<TransportError> for StoreError {
    fn from(err: TransportError) -> Self {
        if err.is_transient() {
            Self::Transient(err)
        } else {
            Self::Backend(err.to_string())
        }
    }
}

#[async_trait]
pub trait SentimentStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Record exchange metadata on first reference. Existing exchanges are left as they are.
    async fn ensure_exchange(&self, _meta: &ExchangeMeta) -> Result<(), StoreError> {
        Ok(())
    }

    /// Get-or-create; returns whether the symbol was created.
    async fn ensure_symbol(&self, symbol: &SymbolRef) -> Result<bool, StoreError>;

    async fn set_symbol_active(&self, symbol: &SymbolRef, active: bool) -> Result<(), StoreError>;

    /// Active symbols of an exchange, ordered by ticker.
    async fn active_symbols(&self, exchange: &ExchangeCode) -> Result<Vec<SymbolRef>, StoreError>;

    async fn read_state(
        &self,
        symbol: &SymbolRef,
        today: NaiveDate,
    ) -> Result<StoreState, StoreError>;

    /// Persist `rows` (ascending by date) in a single write, conditional on `snapshot`.
    async fn commit_batch(
        &self,
        symbol: &SymbolRef,
        rows: &[SentimentRecord],
        snapshot: &StoreSnapshot,
    ) -> Result<CommitReceipt, StoreError>;

    /// Move the cursor forward to `date`; never moves it backwards.
    async fn upsert_cursor(&self, symbol: &SymbolRef, date: NaiveDate) -> Result<(), StoreError>;
}
