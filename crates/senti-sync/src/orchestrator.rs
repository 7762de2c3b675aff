//! Per-symbol backfill: discover the gap, classify in date order, commit once, advance
//! the cursor. Symbols run in parallel on a bounded pool and never share mutable state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use senti_core::{missing_dates, ExchangeCode, GapRequest, SentimentRecord, SymbolRef};
use senti_oracle::{OracleError, SentimentOracle};
use senti_storage::{SentimentStore, StoreError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use crate::summary::{ExchangeReport, FailureKind, FailureStage, SymbolFailure, SymbolReport};

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorOptions {
    pub max_days_per_symbol: usize,
    pub concurrency: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            max_days_per_symbol: 30,
            concurrency: 4,
        }
    }
}

fn store_failure(stage: FailureStage, err: &StoreError) -> SymbolFailure {
    let kind = if err.is_conflict() {
        FailureKind::Conflict
    } else if err.is_transient() {
        FailureKind::Transient
    } else {
        FailureKind::Store
    };
    SymbolFailure::new(stage, kind, err.to_string())
}

fn oracle_failure(err: &OracleError) -> SymbolFailure {
    let kind = if err.is_transient() {
        FailureKind::Transient
    } else {
        FailureKind::Classification
    };
    SymbolFailure::new(FailureStage::Classify, kind, err.to_string())
}

/// Everything one unit of work needs; cheap to clone into a task.
#[derive(Clone)]
struct Unit {
    store: Arc<dyn SentimentStore>,
    oracle: Arc<dyn SentimentOracle>,
    stop: Arc<AtomicBool>,
    max_days: usize,
}

impl Unit {
    async fn run(self, symbol: SymbolRef, today: NaiveDate) -> SymbolReport {
        let mut report = SymbolReport::new(symbol.clone());

        let state = match self.store.read_state(&symbol, today).await {
            Ok(state) => state,
            Err(err) => {
                warn!(error = %err, "reading stored state failed");
                report.failures.push(store_failure(FailureStage::Discover, &err));
                return report;
            }
        };

        let dates = missing_dates(&GapRequest {
            cursor: state.cursor,
            max_stored: state.max_stored,
            today,
            existing: &state.existing,
            max_days: self.max_days,
        });
        report.missing = dates.len();
        if dates.is_empty() {
            info!(cursor = ?state.cursor, max_stored = ?state.max_stored, "no missing dates");
            return report;
        }
        info!(
            dates = dates.len(),
            first = %dates[0],
            last = %dates[dates.len() - 1],
            "backfilling"
        );

        let mut rows = Vec::with_capacity(dates.len());
        for date in dates {
            if self.stop.load(Ordering::SeqCst) {
                report.stopped = true;
                break;
            }
            match self.oracle.classify(&symbol, date).await {
                Ok(value) => rows.push(SentimentRecord::new(date, value)),
                Err(err) => {
                    // Earlier dates stay; the next run resumes at this one.
                    warn!(%date, error = %err, "classification failed; keeping earlier dates");
                    report.failures.push(oracle_failure(&err));
                    break;
                }
            }
        }
        report.classified = rows.len();
        if rows.is_empty() {
            return report;
        }

        let receipt = match self.store.commit_batch(&symbol, &rows, &state.snapshot).await {
            Ok(receipt) => receipt,
            Err(err) => {
                if err.is_conflict() {
                    warn!(error = %err, "lost write race; cursor left in place");
                } else {
                    error!(error = %err, "commit failed");
                }
                report.failures.push(store_failure(FailureStage::Commit, &err));
                return report;
            }
        };
        report.written = receipt.written;
        report.already_present = receipt.already_present;

        let Some(through) = receipt.last_committed else {
            return report;
        };
        report.committed_through = Some(through);

        if let Err(err) = self.store.upsert_cursor(&symbol, through).await {
            error!(%through, error = %err, "cursor advance failed; rows are stored");
            report.failures.push(store_failure(FailureStage::Cursor, &err));
            return report;
        }

        info!(written = receipt.written, %through, "committed");
        report
    }
}

pub struct Orchestrator {
    unit: Unit,
    options: OrchestratorOptions,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn SentimentStore>,
        oracle: Arc<dyn SentimentOracle>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            unit: Unit {
                store,
                oracle,
                stop: Arc::new(AtomicBool::new(false)),
                max_days: options.max_days_per_symbol,
            },
            options,
        }
    }

    /// Setting the flag lets running units commit what they have and starts no new ones.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.unit.stop)
    }

    pub fn stop_requested(&self) -> bool {
        self.unit.stop.load(Ordering::SeqCst)
    }

    /// Backfill one symbol in the calling task.
    pub async fn run_symbol(&self, symbol: &SymbolRef, today: NaiveDate) -> SymbolReport {
        let span = info_span!("symbol", exchange = %symbol.exchange, symbol = %symbol.ticker);
        self.unit.clone().run(symbol.clone(), today).instrument(span).await
    }

    /// Sweep every active symbol of `exchanges`. Failures are recorded, never propagated.
    pub async fn run(&self, exchanges: &[ExchangeCode], today: NaiveDate) -> Vec<ExchangeReport> {
        let permits = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut reports: Vec<ExchangeReport> = Vec::with_capacity(exchanges.len());
        let mut handles: Vec<(usize, SymbolRef, JoinHandle<SymbolReport>)> = Vec::new();

        for exchange in exchanges {
            let idx = reports.len();
            let mut report = ExchangeReport::new(exchange.clone());

            let symbols = match self.unit.store.active_symbols(exchange).await {
                Ok(symbols) => symbols,
                Err(err) => {
                    error!(%exchange, error = %err, "listing active symbols failed");
                    report.listing_failure = Some(store_failure(FailureStage::Discover, &err));
                    reports.push(report);
                    continue;
                }
            };
            info!(%exchange, symbols = symbols.len(), "exchange queued");

            for symbol in symbols {
                if self.stop_requested() {
                    report.not_started += 1;
                    continue;
                }
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    report.not_started += 1;
                    continue;
                };
                if self.stop_requested() {
                    report.not_started += 1;
                    continue;
                }

                let unit = self.unit.clone();
                let span =
                    info_span!("symbol", exchange = %symbol.exchange, symbol = %symbol.ticker);
                let task_symbol = symbol.clone();
                let handle = tokio::spawn(
                    async move {
                        let _permit = permit;
                        unit.run(task_symbol, today).await
                    }
                    .instrument(span),
                );
                handles.push((idx, symbol, handle));
            }
            reports.push(report);
        }

        for (idx, symbol, handle) in handles {
            let symbol_report = match handle.await {
                Ok(report) => report,
                Err(err) => {
                    error!(%symbol, error = %err, "symbol unit aborted");
                    let mut report = SymbolReport::new(symbol);
                    report.failures.push(SymbolFailure::new(
                        FailureStage::Commit,
                        FailureKind::Store,
                        format!("unit aborted: {err}"),
                    ));
                    report
                }
            };
            reports[idx].symbols.push(symbol_report);
        }

        for report in &mut reports {
            report.symbols.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        }
        reports
    }
}
