//! One-shot import of a legacy blob tree (`<root>/<exchange>/*.csv` plus cursor index)
//! into whichever store is configured.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use senti_core::{
    ms_to_utc_date, today_utc, ExchangeCode, SentimentRecord, SentimentValue, SymbolRef,
};
use senti_storage::blob::parse_cursor_index;
use senti_storage::table::clean_invisibles;
use senti_storage::SentimentStore;
use serde::Serialize;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};

pub const IMPORT_BATCH_SIZE: usize = 1000;
const CURSOR_INDEX_FILE: &str = "tickers_last_updated.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub exchanges: usize,
    pub files: usize,
    pub rows_imported: usize,
    pub rows_already_present: usize,
    pub rows_skipped: usize,
    pub cursors: usize,
}

impl ImportSummary {
    fn absorb(&mut self, other: &ImportSummary) {
        self.files += other.files;
        self.rows_imported += other.rows_imported;
        self.rows_already_present += other.rows_already_present;
        self.rows_skipped += other.rows_skipped;
        self.cursors += other.cursors;
    }
}

/// Rows of a legacy table, ascending and unique by date, plus how many lines were unusable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedTable {
    pub rows: Vec<SentimentRecord>,
    pub skipped: usize,
}

pub fn parse_legacy_table(body: &str) -> Result<ParsedTable> {
    let cleaned = clean_invisibles(body);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(cleaned.as_bytes());

    let mut parsed = ParsedTable::default();
    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                warn!(error = %err, "unreadable csv row");
                parsed.skipped += 1;
                continue;
            }
        };
        let date = record
            .get(0)
            .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok());
        let value = record
            .get(1)
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(|v| SentimentValue::try_from(v).ok());
        match (date, value) {
            (Some(date), Some(value)) => parsed.rows.push(SentimentRecord::new(date, value)),
            _ => parsed.skipped += 1,
        }
    }

    // first occurrence of a date wins, as it does in the store
    parsed.rows.sort_by_key(|r| r.date);
    let before = parsed.rows.len();
    parsed.rows.dedup_by_key(|r| r.date);
    parsed.skipped += before - parsed.rows.len();
    Ok(parsed)
}

async fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        out.push(entry.path());
    }
    out.sort();
    Ok(out)
}

pub async fn import_tree(store: &dyn SentimentStore, data_root: &Path) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();
    for dir in sorted_entries(data_root).await? {
        if !fs::metadata(&dir).await?.is_dir() {
            continue;
        }
        let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let exchange = match ExchangeCode::new(name) {
            Ok(code) => code,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "skipping directory");
                continue;
            }
        };
        let span = info_span!("import", %exchange);
        let part = import_exchange(store, &exchange, &dir).instrument(span).await?;
        summary.exchanges += 1;
        summary.absorb(&part);
    }
    info!(
        exchanges = summary.exchanges,
        files = summary.files,
        rows = summary.rows_imported,
        skipped = summary.rows_skipped,
        "import finished"
    );
    Ok(summary)
}

async fn import_exchange(
    store: &dyn SentimentStore,
    exchange: &ExchangeCode,
    dir: &Path,
) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();

    let index_path = dir.join(CURSOR_INDEX_FILE);
    if fs::try_exists(&index_path).await? {
        let body = fs::read_to_string(&index_path)
            .await
            .with_context(|| format!("reading {}", index_path.display()))?;
        let entries = parse_cursor_index(&clean_invisibles(&body))
            .with_context(|| format!("parsing {}", index_path.display()))?;
        for entry in entries {
            let symbol = match SymbolRef::new(exchange.clone(), &entry.ticker) {
                Ok(symbol) => symbol,
                Err(err) => {
                    warn!(ticker = %entry.ticker, error = %err, "skipping cursor entry");
                    continue;
                }
            };
            store.ensure_symbol(&symbol).await?;
            if let Some(date) = entry.last_updated.and_then(ms_to_utc_date) {
                store.upsert_cursor(&symbol, date).await?;
                summary.cursors += 1;
            }
        }
    }

    for path in sorted_entries(dir).await? {
        if path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let symbol = SymbolRef::new(exchange.clone(), stem)
            .with_context(|| format!("ticker from {}", path.display()))?;
        let body = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let parsed = parse_legacy_table(&body)?;
        summary.files += 1;
        summary.rows_skipped += parsed.skipped;

        store.ensure_symbol(&symbol).await?;
        let mut snapshot = store.read_state(&symbol, today_utc()).await?.snapshot;
        for chunk in parsed.rows.chunks(IMPORT_BATCH_SIZE) {
            let receipt = store
                .commit_batch(&symbol, chunk, &snapshot)
                .await
                .with_context(|| format!("importing {symbol}"))?;
            summary.rows_imported += receipt.written;
            summary.rows_already_present += receipt.already_present;
            snapshot = receipt.snapshot;
        }
        info!(%symbol, rows = parsed.rows.len(), skipped = parsed.skipped, "table imported");
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use senti_storage::{BlobLayout, BlobSentimentStore, MemoryBlobBackend};
    use tempfile::tempdir;

    #[test]
    fn legacy_rows_are_cleaned_sorted_and_counted() {
        let body = concat!(
            "\u{feff}date,sentiment\n",
            "2024-01-03,2\n",
            "2024-01-01,\u{200b}1\n",
            "not-a-date,1\n",
            "2024-01-02,7\n",
            "2024-01-01,0\n",
        );
        let parsed = parse_legacy_table(body).unwrap();
        let dates: Vec<_> = parsed.rows.iter().map(|r| r.date.to_string()).collect();
        assert_eq!(dates, vec!["2024-01-01", "2024-01-03"]);
        assert_eq!(parsed.rows[0].value, SentimentValue::Positive);
        assert_eq!(parsed.skipped, 3);
    }

    #[tokio::test]
    async fn imports_tables_and_cursors_from_a_data_root() {
        let root = tempdir().unwrap();
        let nse = root.path().join("nse");
        std::fs::create_dir_all(&nse).unwrap();
        let table = "date,sentiment\n2024-01-08,1\n2024-01-09,0\nbad\n";
        std::fs::write(nse.join("tcs.csv"), table).unwrap();
        std::fs::write(
            nse.join(CURSOR_INDEX_FILE),
            concat!(
                r#"[{"symbol": "TCS", "last_updated": 1704758400000},"#,
                r#" {"ticker": "INFY", "lastUpdated": null}]"#,
            ),
        )
        .unwrap();
        std::fs::write(root.path().join("README.txt"), "ignored").unwrap();

        let store = BlobSentimentStore::new(MemoryBlobBackend::default(), BlobLayout::new("data"));
        let summary = import_tree(&store, root.path()).await.unwrap();

        assert_eq!(summary.exchanges, 1);
        assert_eq!(summary.files, 1);
        assert_eq!(summary.rows_imported, 2);
        assert_eq!(summary.rows_skipped, 1);
        assert_eq!(summary.cursors, 1);

        let tcs = SymbolRef::parse("nse", "TCS").unwrap();
        let state = store.read_state(&tcs, today_utc()).await.unwrap();
        assert_eq!(state.cursor, NaiveDate::from_ymd_opt(2024, 1, 9));
        assert_eq!(state.max_stored, NaiveDate::from_ymd_opt(2024, 1, 9));

        let active = store.active_symbols(&ExchangeCode::new("nse").unwrap()).await.unwrap();
        assert_eq!(active.len(), 2);

        let again = import_tree(&store, root.path()).await.unwrap();
        assert_eq!(again.rows_imported, 0);
        assert_eq!(again.rows_already_present, 2);
    }
}
