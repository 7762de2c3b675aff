//! Delimited `date,sentiment` table held inside a blob.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use senti_core::{SentimentRecord, SentimentValue, TABLE_HEADER};

/// Zero-width characters and the byte-order mark that hand-edited files pick up.
const INVISIBLES: [char; 5] = ['\u{200b}', '\u{200c}', '\u{200d}', '\u{feff}', '\u{2060}'];

pub fn clean_invisibles(text: &str) -> String {
    text.chars().filter(|c| !INVISIBLES.contains(c)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TableLine {
    Record(SentimentRecord),
    /// Line with a readable date but a value we do not understand; kept verbatim.
    Dated { date: NaiveDate, raw: String },
    Raw(String),
}

impl TableLine {
    fn date(&self) -> Option<NaiveDate> {
        match self {
            Self::Record(rec) => Some(rec.date),
            Self::Dated { date, .. } => Some(*date),
            Self::Raw(_) => None,
        }
    }

    fn render(&self) -> String {
        match self {
            Self::Record(rec) => format!("{},{}", rec.date.format("%Y-%m-%d"), rec.value),
            Self::Dated { raw, .. } | Self::Raw(raw) => raw.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub appended: usize,
    pub already_present: usize,
}

/// Parsed table. Existing lines keep their order; merged rows are appended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SentimentTable {
    lines: Vec<TableLine>,
}

pub fn parse_row(line: &str) -> Option<(NaiveDate, Result<SentimentValue, String>)> {
    let (date_part, value_part) = line.split_once(',')?;
    let date = NaiveDate::parse_from_str(date_part.trim(), "%Y-%m-%d").ok()?;
    let value = value_part
        .trim()
        .trim_matches('"')
        .parse::<i64>()
        .ok()
        .and_then(|v| SentimentValue::try_from(v).ok())
        .ok_or_else(|| value_part.trim().to_string());
    Some((date, value))
}

impl SentimentTable {
    /// Absent header and stray blank lines are tolerated.
    pub fn parse(body: &str) -> Self {
        let cleaned = clean_invisibles(body);
        let mut lines = Vec::new();
        for raw in cleaned.lines() {
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() || is_header(line) {
                continue;
            }
            let parsed = match parse_row(line) {
                Some((date, Ok(value))) => TableLine::Record(SentimentRecord::new(date, value)),
                Some((date, Err(_))) => TableLine::Dated {
                    date,
                    raw: line.to_string(),
                },
                None => TableLine::Raw(line.to_string()),
            };
            lines.push(parsed);
        }
        Self { lines }
    }

    pub fn dates(&self) -> BTreeSet<NaiveDate> {
        self.lines.iter().filter_map(TableLine::date).collect()
    }

    pub fn max_date(&self) -> Option<NaiveDate> {
        self.lines.iter().filter_map(TableLine::date).max()
    }

    pub fn records(&self) -> impl Iterator<Item = &SentimentRecord> {
        self.lines.iter().filter_map(|line| match line {
            TableLine::Record(rec) => Some(rec),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Append rows whose date is not already in the table. Write-once per date.
    pub fn merge(&mut self, rows: &[SentimentRecord]) -> MergeOutcome {
        let mut present = self.dates();
        let mut outcome = MergeOutcome::default();
        for row in rows {
            if present.insert(row.date) {
                self.lines.push(TableLine::Record(*row));
                outcome.appended += 1;
            } else {
                outcome.already_present += 1;
            }
        }
        outcome
    }

    pub fn render(&self) -> String {
        let mut out = String::with_capacity(TABLE_HEADER.len() + 1 + self.lines.len() * 13);
        out.push_str(TABLE_HEADER);
        out.push('\n');
        for line in &self.lines {
            out.push_str(&line.render());
            out.push('\n');
        }
        out
    }
}

fn is_header(line: &str) -> bool {
    line.trim()
        .split(',')
        .next()
        .is_some_and(|first| first.trim().eq_ignore_ascii_case("date"))
}
