//! Gap calculation: which dates a symbol still needs.
//!
//! The restart point is the earlier of the cursor and the newest stored date, so a run
//! that committed rows but died before advancing the cursor (or a cursor edited past the
//! data) still resumes from what is actually persisted.

use std::collections::BTreeSet;

use chrono::{Days, NaiveDate};

/// Inputs for one symbol's gap computation.
#[derive(Debug, Clone)]
pub struct GapRequest<'a> {
    pub cursor: Option<NaiveDate>,
    pub max_stored: Option<NaiveDate>,
    pub today: NaiveDate,
    /// Dates already present inside the candidate window.
    pub existing: &'a BTreeSet<NaiveDate>,
    pub max_days: usize,
}

fn yesterday(today: NaiveDate) -> Option<NaiveDate> {
    today.checked_sub_days(Days::new(1))
}

/// `min(cursor, max_stored)`, or yesterday on a cold start.
pub fn restart_base(
    cursor: Option<NaiveDate>,
    max_stored: Option<NaiveDate>,
    today: NaiveDate,
) -> NaiveDate {
    match (cursor, max_stored) {
        (Some(c), Some(m)) => c.min(m),
        (Some(only), None) | (None, Some(only)) => only,
        (None, None) => yesterday(today).unwrap_or(today),
    }
}

/// Inclusive `(base + 1, today - 1)` range, `None` when it is empty.
pub fn candidate_window(
    cursor: Option<NaiveDate>,
    max_stored: Option<NaiveDate>,
    today: NaiveDate,
) -> Option<(NaiveDate, NaiveDate)> {
    let base = restart_base(cursor, max_stored, today);
    let start = base.checked_add_days(Days::new(1))?;
    let end = yesterday(today)?;
    (start <= end).then_some((start, end))
}

/// Ascending list of dates to backfill, never including `today`, capped at `max_days`.
pub fn missing_dates(req: &GapRequest<'_>) -> Vec<NaiveDate> {
    let Some((start, end)) = candidate_window(req.cursor, req.max_stored, req.today) else {
        return Vec::new();
    };

    start
        .iter_days()
        .take_while(|day| *day <= end)
        .filter(|day| !req.existing.contains(day))
        .take(req.max_days)
        .collect()
}
