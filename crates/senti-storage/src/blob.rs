//! Versioned-blob store: one delimited table per symbol plus a cursor index per exchange.
//!
//! Every write is conditional on the version token observed when the blob was read. A
//! mismatch means another writer got there first and surfaces as [`StoreError::Conflict`].

use async_trait::async_trait;
use chrono::NaiveDate;
use senti_core::{
    ms_to_utc_date, utc_midnight_ms, ExchangeCode, SentimentRecord, StoreSnapshot, SymbolRef,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::table::SentimentTable;
use crate::{CommitReceipt, SentimentStore, StoreError, StoreState, TransportError};

const CURSOR_INDEX_FILE: &str = "tickers_last_updated.json";
const INDEX_WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobObject {
    pub body: String,
    pub version: String,
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("version conflict on {path}")]
    Conflict { path: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("blob backend error on {path}: {message}")]
    Backend { path: String, message: String },
}

impl From<BlobError> for StoreError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::Conflict { path } => StoreError::Conflict { target: path },
            BlobError::Transport(err) => err.into(),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Remote (or local) storage of text blobs with per-blob version tokens.
#[async_trait]
pub trait BlobBackend: Send + Sync {
    fn describe(&self) -> String;

    async fn get(&self, path: &str) -> Result<Option<BlobObject>, BlobError>;

    /// Write `body`. `expected = None` means "create; fail if it exists", otherwise the
    /// write only succeeds while the current version equals `expected`.
    async fn put(
        &self,
        path: &str,
        body: &str,
        message: &str,
        expected: Option<&str>,
    ) -> Result<String, BlobError>;
}

/// Where tables and cursor indexes live inside the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobLayout {
    pub root: String,
}

impl BlobLayout {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    fn prefix(&self, exchange: &ExchangeCode) -> String {
        let root = self.root.trim_matches('/');
        if root.is_empty() {
            exchange.to_string()
        } else {
            format!("{root}/{exchange}")
        }
    }

    pub fn table_path(&self, symbol: &SymbolRef) -> String {
        format!(
            "{}/{}.csv",
            self.prefix(&symbol.exchange),
            symbol.ticker.to_ascii_lowercase()
        )
    }

    pub fn cursor_index_path(&self, exchange: &ExchangeCode) -> String {
        format!("{}/{CURSOR_INDEX_FILE}", self.prefix(exchange))
    }
}

/// One entry of `tickers_last_updated.json`. Unknown keys are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorEntry {
    #[serde(alias = "symbol")]
    pub ticker: String,
    #[serde(rename = "lastUpdated", alias = "last_updated", default)]
    pub last_updated: Option<i64>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_active() -> bool {
    true
}

impl CursorEntry {
    fn matches(&self, ticker: &str) -> bool {
        self.ticker.trim().eq_ignore_ascii_case(ticker)
    }

    fn cursor_date(&self) -> Option<NaiveDate> {
        self.last_updated.and_then(ms_to_utc_date)
    }
}

pub fn parse_cursor_index(body: &str) -> Result<Vec<CursorEntry>, serde_json::Error> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(body.trim_start_matches('\u{feff}'))
}

pub struct BlobSentimentStore<B> {
    backend: B,
    layout: BlobLayout,
    /// Serialises this process's read-modify-write cycles on cursor indexes.
    index_lock: Mutex<()>,
}

impl<B: BlobBackend> BlobSentimentStore<B> {
    pub fn new(backend: B, layout: BlobLayout) -> Self {
        Self {
            backend,
            layout,
            index_lock: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn layout(&self) -> &BlobLayout {
        &self.layout
    }

    async fn load_index(
        &self,
        exchange: &ExchangeCode,
    ) -> Result<(Vec<CursorEntry>, Option<String>), StoreError> {
        let path = self.layout.cursor_index_path(exchange);
        match self.backend.get(&path).await? {
            None => Ok((Vec::new(), None)),
            Some(obj) => {
                let entries = parse_cursor_index(&obj.body)
                    .map_err(|err| StoreError::Backend(format!("parsing {path}: {err}")))?;
                Ok((entries, Some(obj.version)))
            }
        }
    }

    /// Apply `edit` to the exchange's cursor index and write it back if it changed.
    /// Edits are merges, so a conflicting concurrent writer is handled by re-reading.
    async fn update_index<F>(
        &self,
        exchange: &ExchangeCode,
        message: &str,
        edit: F,
    ) -> Result<bool, StoreError>
    where
        F: Fn(&mut Vec<CursorEntry>) -> bool + Send + Sync,
    {
        let _guard = self.index_lock.lock().await;
        let path = self.layout.cursor_index_path(exchange);

        for attempt in 1..=INDEX_WRITE_ATTEMPTS {
            let (mut entries, version) = self.load_index(exchange).await?;
            if !edit(&mut entries) {
                return Ok(false);
            }
            let body = serde_json::to_string_pretty(&entries)
                .map_err(|err| StoreError::Backend(format!("serialising {path}: {err}")))?;
            match self
                .backend
                .put(&path, &format!("{body}\n"), message, version.as_deref())
                .await
            {
                Ok(_) => return Ok(true),
                Err(BlobError::Conflict { .. }) if attempt < INDEX_WRITE_ATTEMPTS => {
                    warn!(%path, attempt, "cursor index changed underneath us; re-reading");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(StoreError::Conflict { target: path })
    }

    async fn cursor_for(&self, symbol: &SymbolRef) -> Result<Option<NaiveDate>, StoreError> {
        let (entries, _) = self.load_index(&symbol.exchange).await?;
        Ok(entries
            .iter()
            .find(|e| e.matches(&symbol.ticker))
            .and_then(CursorEntry::cursor_date))
    }
}

#[async_trait]
impl<B: BlobBackend> SentimentStore for BlobSentimentStore<B> {
    fn backend_name(&self) -> &'static str {
        "blob"
    }

    async fn ensure_symbol(&self, symbol: &SymbolRef) -> Result<bool, StoreError> {
        let ticker = symbol.ticker.clone();
        self.update_index(&symbol.exchange, &format!("{ticker}: track symbol"), move |entries| {
            if entries.iter().any(|e| e.matches(&ticker)) {
                return false;
            }
            entries.push(CursorEntry {
                ticker: ticker.clone(),
                last_updated: None,
                active: true,
                extra: serde_json::Map::new(),
            });
            true
        })
        .await
    }

    async fn set_symbol_active(&self, symbol: &SymbolRef, active: bool) -> Result<(), StoreError> {
        let ticker = symbol.ticker.clone();
        let verb = if active { "activate" } else { "deactivate" };
        let changed = self
            .update_index(&symbol.exchange, &format!("{ticker}: {verb}"), move |entries| {
                match entries.iter_mut().find(|e| e.matches(&ticker)) {
                    Some(entry) if entry.active != active => {
                        entry.active = active;
                        true
                    }
                    _ => false,
                }
            })
            .await?;
        if changed {
            info!(%symbol, active, "symbol activation changed");
        }
        Ok(())
    }

    async fn active_symbols(&self, exchange: &ExchangeCode) -> Result<Vec<SymbolRef>, StoreError> {
        let (entries, _) = self.load_index(exchange).await?;
        let mut symbols = Vec::new();
        for entry in entries.iter().filter(|e| e.active) {
            match SymbolRef::new(exchange.clone(), &entry.ticker) {
                Ok(sym) => symbols.push(sym),
                Err(err) => {
                    warn!(%exchange, ticker = %entry.ticker, error = %err, "skipping cursor entry")
                }
            }
        }
        symbols.sort();
        symbols.dedup();
        Ok(symbols)
    }

    async fn read_state(
        &self,
        symbol: &SymbolRef,
        _today: NaiveDate,
    ) -> Result<StoreState, StoreError> {
        let path = self.layout.table_path(symbol);
        let cursor = self.cursor_for(symbol).await?;
        let (table, snapshot) = match self.backend.get(&path).await? {
            None => (SentimentTable::default(), StoreSnapshot::Absent),
            Some(obj) => (SentimentTable::parse(&obj.body), StoreSnapshot::Version(obj.version)),
        };

        Ok(StoreState {
            cursor,
            max_stored: table.max_date(),
            existing: table.dates(),
            snapshot,
        })
    }

    async fn commit_batch(
        &self,
        symbol: &SymbolRef,
        rows: &[SentimentRecord],
        snapshot: &StoreSnapshot,
    ) -> Result<CommitReceipt, StoreError> {
        let path = self.layout.table_path(symbol);
        let last_committed = rows.iter().map(|r| r.date).max();

        let current = self.backend.get(&path).await?;
        let (mut table, expected) = match (snapshot, current) {
            (StoreSnapshot::Absent, None) => (SentimentTable::default(), None),
            (StoreSnapshot::Version(token), Some(obj)) if *token == obj.version => {
                (SentimentTable::parse(&obj.body), Some(obj.version))
            }
            (StoreSnapshot::Unversioned, _) => {
                return Err(StoreError::SnapshotMismatch {
                    backend: self.backend_name(),
                    snapshot: snapshot.clone(),
                })
            }
            _ => return Err(StoreError::Conflict { target: path }),
        };

        let merged = table.merge(rows);
        if merged.appended == 0 {
            debug!(%symbol, "every date already present; skipping write");
            return Ok(CommitReceipt {
                written: 0,
                already_present: merged.already_present,
                last_committed,
                snapshot: snapshot.clone(),
            });
        }

        let message = match (rows.first(), rows.last()) {
            (Some(first), Some(last)) if first.date != last.date => {
                format!("{}: add sentiment {}..{}", symbol.ticker, first.date, last.date)
            }
            (Some(only), _) => format!("{}: add sentiment for {}", symbol.ticker, only.date),
            _ => format!("{}: add sentiment", symbol.ticker),
        };
        let version = self
            .backend
            .put(&path, &table.render(), &message, expected.as_deref())
            .await?;

        Ok(CommitReceipt {
            written: merged.appended,
            already_present: merged.already_present,
            last_committed,
            snapshot: StoreSnapshot::Version(version),
        })
    }

    async fn upsert_cursor(&self, symbol: &SymbolRef, date: NaiveDate) -> Result<(), StoreError> {
        let ticker = symbol.ticker.clone();
        let target = utc_midnight_ms(date);
        self.update_index(
            &symbol.exchange,
            &format!("{ticker}: cursor {date}"),
            move |entries| match entries.iter_mut().find(|e| e.matches(&ticker)) {
                Some(entry) if entry.last_updated.is_some_and(|ms| ms >= target) => false,
                Some(entry) => {
                    entry.last_updated = Some(target);
                    true
                }
                None => {
                    entries.push(CursorEntry {
                        ticker: ticker.clone(),
                        last_updated: Some(target),
                        active: true,
                        extra: serde_json::Map::new(),
                    });
                    true
                }
            },
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryBlobBackend;
    use senti_core::SentimentValue;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn rec(day: u32, value: SentimentValue) -> SentimentRecord {
        SentimentRecord::new(d(day), value)
    }

    fn store() -> BlobSentimentStore<MemoryBlobBackend> {
        BlobSentimentStore::new(MemoryBlobBackend::default(), BlobLayout::new("data"))
    }

    fn aapl() -> SymbolRef {
        SymbolRef::parse("nasdaq", "aapl").unwrap()
    }

    #[test]
    fn layout_paths_follow_exchange_directories() {
        let layout = BlobLayout::new("/webapp/data/");
        assert_eq!(layout.table_path(&aapl()), "webapp/data/nasdaq/aapl.csv");
        assert_eq!(
            layout.cursor_index_path(&aapl().exchange),
            "webapp/data/nasdaq/tickers_last_updated.json"
        );
        assert_eq!(BlobLayout::new("").table_path(&aapl()), "nasdaq/aapl.csv");
    }

    #[test]
    fn legacy_cursor_index_keys_are_accepted_and_preserved() {
        let entries = parse_cursor_index(
            r#"[{"symbol": "msft", "last_updated": 1704758400000, "sector": "tech"}]"#,
        )
        .unwrap();
        assert_eq!(entries[0].ticker, "msft");
        assert_eq!(entries[0].cursor_date(), Some(d(9)));
        assert!(entries[0].active);
        let out = serde_json::to_value(&entries).unwrap();
        assert_eq!(out[0]["lastUpdated"], 1_704_758_400_000i64);
        assert_eq!(out[0]["sector"], "tech");
    }

    #[tokio::test]
    async fn absent_blob_reads_as_empty_and_first_commit_creates_it() {
        let store = store();
        let state = store.read_state(&aapl(), d(15)).await.unwrap();
        assert_eq!(state.snapshot, StoreSnapshot::Absent);
        assert!(state.existing.is_empty());
        assert_eq!(state.cursor, None);

        let receipt = store
            .commit_batch(
                &aapl(),
                &[rec(13, SentimentValue::Positive), rec(14, SentimentValue::Neutral)],
                &state.snapshot,
            )
            .await
            .unwrap();
        assert_eq!(receipt.written, 2);
        assert_eq!(receipt.last_committed, Some(d(14)));

        let body = store.backend().body("data/nasdaq/aapl.csv").unwrap();
        assert_eq!(body, "date,sentiment\n2024-01-13,1\n2024-01-14,0\n");
    }

    #[tokio::test]
    async fn stale_token_commits_exactly_once() {
        let store = store();
        let state = store.read_state(&aapl(), d(15)).await.unwrap();
        let rows = [rec(14, SentimentValue::Negative)];

        let first = store.commit_batch(&aapl(), &rows, &state.snapshot).await;
        let second = store.commit_batch(&aapl(), &rows, &state.snapshot).await;

        assert!(first.is_ok());
        assert!(matches!(second, Err(StoreError::Conflict { .. })));
        let body = store.backend().body("data/nasdaq/aapl.csv").unwrap();
        assert_eq!(body.matches("2024-01-14").count(), 1);
    }

    #[tokio::test]
    async fn overlapping_commit_writes_only_new_dates_and_noop_skips_write() {
        let store = store();
        let state = store.read_state(&aapl(), d(15)).await.unwrap();
        store
            .commit_batch(&aapl(), &[rec(10, SentimentValue::Neutral)], &state.snapshot)
            .await
            .unwrap();

        let state = store.read_state(&aapl(), d(15)).await.unwrap();
        let receipt = store
            .commit_batch(
                &aapl(),
                &[rec(10, SentimentValue::Positive), rec(11, SentimentValue::Positive)],
                &state.snapshot,
            )
            .await
            .unwrap();
        assert_eq!((receipt.written, receipt.already_present), (1, 1));

        let state = store.read_state(&aapl(), d(15)).await.unwrap();
        let writes_before = store.backend().write_count();
        let receipt = store
            .commit_batch(&aapl(), &[rec(11, SentimentValue::Negative)], &state.snapshot)
            .await
            .unwrap();
        assert_eq!(receipt.written, 0);
        assert_eq!(receipt.snapshot, state.snapshot);
        assert_eq!(store.backend().write_count(), writes_before);

        let body = store.backend().body("data/nasdaq/aapl.csv").unwrap();
        assert_eq!(body, "date,sentiment\n2024-01-10,0\n2024-01-11,1\n");
    }

    #[tokio::test]
    async fn cursor_only_moves_forward_and_tracks_symbols() {
        let store = store();
        assert!(store.ensure_symbol(&aapl()).await.unwrap());
        assert!(!store.ensure_symbol(&aapl()).await.unwrap());

        store.upsert_cursor(&aapl(), d(12)).await.unwrap();
        store.upsert_cursor(&aapl(), d(9)).await.unwrap();
        let state = store.read_state(&aapl(), d(15)).await.unwrap();
        assert_eq!(state.cursor, Some(d(12)));

        let nasdaq = aapl().exchange;
        assert_eq!(store.active_symbols(&nasdaq).await.unwrap(), vec![aapl()]);
        store.set_symbol_active(&aapl(), false).await.unwrap();
        assert!(store.active_symbols(&nasdaq).await.unwrap().is_empty());
        // deactivated, not deleted: the cursor survives
        assert_eq!(store.read_state(&aapl(), d(15)).await.unwrap().cursor, Some(d(12)));
    }

    #[tokio::test]
    async fn cursor_index_conflicts_are_retried_by_merging() {
        let store = store();
        store.ensure_symbol(&aapl()).await.unwrap();
        let msft = SymbolRef::parse("nasdaq", "msft").unwrap();

        store.backend().fail_next_put_with_conflict();
        store.upsert_cursor(&msft, d(7)).await.unwrap();

        let (entries, _) = store.load_index(&aapl().exchange).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(store.read_state(&msft, d(15)).await.unwrap().cursor, Some(d(7)));
    }
}
