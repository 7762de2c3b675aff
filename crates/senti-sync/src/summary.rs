//! Per-symbol outcomes, run summary, exit codes, and on-disk reports.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use senti_core::{ExchangeCode, SymbolRef};
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

/// Process exit codes. Codes 5 to 7 are advisory: the whole sweep was still attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunExit {
    Ok,
    Config,
    OracleInit,
    StoreInit,
    Classification,
    StoreWrite,
    Cursor,
    Schema,
}

impl RunExit {
    pub fn code(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Config => 2,
            Self::OracleInit => 3,
            Self::StoreInit => 4,
            Self::Classification => 5,
            Self::StoreWrite => 6,
            Self::Cursor => 7,
            Self::Schema => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Discover,
    Classify,
    Commit,
    Cursor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retries exhausted on the network; re-running soon is reasonable.
    Transient,
    Classification,
    /// Lost an optimistic-concurrency race; the next run picks the dates up again.
    Conflict,
    Store,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolFailure {
    pub stage: FailureStage,
    pub kind: FailureKind,
    pub message: String,
}

impl SymbolFailure {
    pub fn new(stage: FailureStage, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
        }
    }

    pub fn exit(&self) -> Option<RunExit> {
        match (self.stage, self.kind) {
            // a lost table race writes nothing; the next run redoes those dates
            (FailureStage::Commit, FailureKind::Conflict) => None,
            (FailureStage::Cursor, _) => Some(RunExit::Cursor),
            (FailureStage::Classify, _) => Some(RunExit::Classification),
            (FailureStage::Discover | FailureStage::Commit, _) => Some(RunExit::StoreWrite),
        }
    }

    /// Everything except a lost table race counts against the run.
    pub fn is_fatal(&self) -> bool {
        self.exit().is_some()
    }

    pub fn category(&self) -> &'static str {
        match (self.stage, self.kind) {
            (FailureStage::Cursor, _) => "cursor",
            (_, FailureKind::Conflict) => "conflict",
            (_, FailureKind::Transient) => "transient",
            (FailureStage::Classify, _) => "classification",
            _ => "store",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolStatus {
    UpToDate,
    Backfilled,
    Conflict,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolReport {
    pub symbol: SymbolRef,
    /// Dates the gap calculator asked for.
    pub missing: usize,
    pub classified: usize,
    pub written: usize,
    pub already_present: usize,
    pub committed_through: Option<NaiveDate>,
    /// Classification halted because a stop was requested.
    pub stopped: bool,
    pub failures: Vec<SymbolFailure>,
}

impl SymbolReport {
    pub fn new(symbol: SymbolRef) -> Self {
        Self {
            symbol,
            missing: 0,
            classified: 0,
            written: 0,
            already_present: 0,
            committed_through: None,
            stopped: false,
            failures: Vec::new(),
        }
    }

    pub fn status(&self) -> SymbolStatus {
        if self.failures.iter().any(SymbolFailure::is_fatal) {
            SymbolStatus::Failed
        } else if !self.failures.is_empty() {
            SymbolStatus::Conflict
        } else if self.missing == 0 {
            SymbolStatus::UpToDate
        } else {
            SymbolStatus::Backfilled
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExchangeReport {
    pub exchange: ExchangeCode,
    pub symbols: Vec<SymbolReport>,
    /// Listing the exchange's active symbols failed; nothing ran for it.
    pub listing_failure: Option<SymbolFailure>,
    /// Units skipped because a stop was requested before they started.
    pub not_started: usize,
}

impl ExchangeReport {
    pub fn new(exchange: ExchangeCode) -> Self {
        Self {
            exchange,
            symbols: Vec::new(),
            listing_failure: None,
            not_started: 0,
        }
    }

    fn count(&self, status: SymbolStatus) -> usize {
        self.symbols.iter().filter(|s| s.status() == status).count()
    }

    pub fn backfilled(&self) -> usize {
        self.count(SymbolStatus::Backfilled)
    }

    pub fn up_to_date(&self) -> usize {
        self.count(SymbolStatus::UpToDate)
    }

    pub fn failed(&self) -> impl Iterator<Item = (&SymbolRef, &SymbolFailure)> {
        self.symbols.iter().flat_map(|s| {
            s.failures
                .iter()
                .filter(|f| f.is_fatal())
                .map(move |f| (&s.symbol, f))
        })
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &SymbolRef> {
        self.symbols
            .iter()
            .filter(|s| s.failures.iter().any(|f| !f.is_fatal()))
            .map(|s| &s.symbol)
    }

    pub fn rows_written(&self) -> usize {
        self.symbols.iter().map(|s| s.written).sum()
    }
}

/// Lowest applicable code among all symbol failures, so the result is independent of the
/// order in which units finished.
pub fn exit_for(exchanges: &[ExchangeReport]) -> RunExit {
    exchanges
        .iter()
        .flat_map(|ex| {
            ex.listing_failure
                .iter()
                .chain(ex.symbols.iter().flat_map(|s| s.failures.iter()))
        })
        .filter_map(SymbolFailure::exit)
        .min()
        .unwrap_or(RunExit::Ok)
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub backend: String,
    pub today: NaiveDate,
    pub stopped: bool,
    pub exchanges: Vec<ExchangeReport>,
    pub exit: RunExit,
}

impl SyncRunSummary {
    pub fn rows_written(&self) -> usize {
        self.exchanges.iter().map(ExchangeReport::rows_written).sum()
    }

    pub fn render_markdown(&self) -> String {
        let mut out = format!(
            concat!(
                "# Sentiment Backfill Run\n\n",
                "- Run ID: `{}`\n",
                "- Backend: {}\n",
                "- Started: {}\n",
                "- Finished: {}\n",
                "- Through: {}\n",
                "- Rows written: {}\n",
                "- Exit: {} ({:?})\n",
            ),
            self.run_id,
            self.backend,
            self.started_at,
            self.finished_at,
            self.today.pred_opt().unwrap_or(self.today),
            self.rows_written(),
            self.exit.code(),
            self.exit,
        );
        if self.stopped {
            out.push_str("- Stopped early on request\n");
        }

        for ex in &self.exchanges {
            out.push_str(&format!(
                "\n## {}\n\n- Backfilled: {}\n- Up to date: {}\n- Rows written: {}\n",
                ex.exchange.as_str().to_ascii_uppercase(),
                ex.backfilled(),
                ex.up_to_date(),
                ex.rows_written()
            ));
            if let Some(failure) = &ex.listing_failure {
                out.push_str(&format!(
                    "- Listing failed ({}): {}\n",
                    failure.category(),
                    failure.message
                ));
            }
            if ex.not_started > 0 {
                out.push_str(&format!("- Not started: {}\n", ex.not_started));
            }
            let conflicts: Vec<_> = ex.conflicts().map(|s| s.ticker.as_str()).collect();
            if !conflicts.is_empty() {
                out.push_str(&format!(
                    "- Conflicts (retried next run): {}\n",
                    conflicts.join(", ")
                ));
            }
            let failed: Vec<_> = ex.failed().collect();
            if !failed.is_empty() {
                out.push_str("- Failed:\n");
                for (symbol, failure) in failed {
                    out.push_str(&format!(
                        "  - {} [{}]: {}\n",
                        symbol.ticker,
                        failure.category(),
                        failure.message
                    ));
                }
            }
        }
        out
    }

    /// Write `run_summary.json` and `summary.md` under `<root>/<run_id>/`.
    pub async fn write_reports(&self, root: &Path) -> Result<PathBuf> {
        let dir = root.join(self.run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let json = serde_json::to_vec_pretty(self).context("serializing run summary")?;
        fs::write(dir.join("run_summary.json"), json)
            .await
            .context("writing run_summary.json")?;
        fs::write(dir.join("summary.md"), self.render_markdown())
            .await
            .context("writing summary.md")?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn symbol(t: &str) -> SymbolRef {
        SymbolRef::parse("nse", t).unwrap()
    }

    fn failed(t: &str, stage: FailureStage, kind: FailureKind) -> SymbolReport {
        let mut report = SymbolReport::new(symbol(t));
        report.missing = 3;
        report.failures.push(SymbolFailure::new(stage, kind, "boom"));
        report
    }

    fn exchange(symbols: Vec<SymbolReport>) -> ExchangeReport {
        ExchangeReport {
            symbols,
            ..ExchangeReport::new(ExchangeCode::new("nse").unwrap())
        }
    }

    #[test]
    fn lowest_failure_code_wins_regardless_of_order() {
        let a = failed("A", FailureStage::Cursor, FailureKind::Store);
        let b = failed("B", FailureStage::Classify, FailureKind::Classification);
        let c = failed("C", FailureStage::Commit, FailureKind::Transient);

        let forward = exit_for(&[exchange(vec![a.clone(), b.clone(), c.clone()])]);
        let backward = exit_for(&[exchange(vec![c, b, a])]);
        assert_eq!(forward, RunExit::Classification);
        assert_eq!(forward, backward);
        assert_eq!(forward.code(), 5);
    }

    #[test]
    fn conflicts_are_reported_but_not_fatal() {
        let ex = exchange(vec![
            failed("A", FailureStage::Commit, FailureKind::Conflict),
            SymbolReport::new(symbol("B")),
        ]);
        assert_eq!(exit_for(std::slice::from_ref(&ex)), RunExit::Ok);
        assert_eq!(ex.conflicts().count(), 1);
        assert_eq!(ex.failed().count(), 0);
        assert_eq!(ex.up_to_date(), 1);
    }

    #[test]
    fn stage_maps_to_exit_code() {
        let cases = [
            (FailureStage::Discover, FailureKind::Store, Some(6)),
            (FailureStage::Commit, FailureKind::Store, Some(6)),
            (FailureStage::Cursor, FailureKind::Transient, Some(7)),
            (FailureStage::Classify, FailureKind::Transient, Some(5)),
            (FailureStage::Commit, FailureKind::Conflict, None),
            (FailureStage::Cursor, FailureKind::Conflict, Some(7)),
        ];
        for (stage, kind, code) in cases {
            let failure = SymbolFailure::new(stage, kind, "x");
            assert_eq!(failure.exit().map(RunExit::code), code, "{stage:?}/{kind:?}");
        }
    }

    #[test]
    fn unsaved_cursor_after_index_race_is_a_cursor_failure() {
        let ex = exchange(vec![failed("A", FailureStage::Cursor, FailureKind::Conflict)]);
        assert_eq!(exit_for(std::slice::from_ref(&ex)), RunExit::Cursor);
        assert_eq!(ex.symbols[0].status(), SymbolStatus::Failed);
        assert_eq!(ex.conflicts().count(), 0);
        assert_eq!(ex.failed().next().map(|(_, f)| f.category()), Some("cursor"));
    }

    #[tokio::test]
    async fn reports_are_written_under_run_id() {
        let dir = tempdir().expect("tempdir");
        let mut ok = SymbolReport::new(symbol("INFY"));
        ok.missing = 2;
        ok.written = 2;
        let summary = SyncRunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            backend: "blob".to_string(),
            today: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            stopped: false,
            exchanges: vec![exchange(vec![
                ok,
                failed("TCS", FailureStage::Classify, FailureKind::Classification),
            ])],
            exit: RunExit::Classification,
        };

        let out = summary.write_reports(dir.path()).await.expect("reports");
        let md = std::fs::read_to_string(out.join("summary.md")).unwrap();
        assert!(md.contains("- Backfilled: 1"));
        assert!(md.contains("TCS [classification]: boom"));
        assert!(md.contains("Through: 2024-02-29"));

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(out.join("run_summary.json")).unwrap()).unwrap();
        assert_eq!(json["exit"], "classification");
        assert_eq!(json["exchanges"][0]["exchange"], "nse");
    }
}
