//! Core domain model for the daily sentiment backfill.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod gap;

pub use gap::{candidate_window, missing_dates, restart_base, GapRequest};

pub const CRATE_NAME: &str = "senti-core";

/// Header line of the delimited record table.
pub const TABLE_HEADER: &str = "date,sentiment";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("sentiment value {0} is outside {{0, 1, 2}}")]
    ValueOutOfRange(i64),
    #[error("empty {0} identifier")]
    EmptyIdentifier(&'static str),
}

/// Exchange code, normalised to lower case.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExchangeCode(String);

impl ExchangeCode {
    pub fn new(code: &str) -> Result<Self, DomainError> {
        let code = code.trim().to_ascii_lowercase();
        if code.is_empty() {
            return Err(DomainError::EmptyIdentifier("exchange"));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ExchangeCode {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<ExchangeCode> for String {
    fn from(value: ExchangeCode) -> Self {
        value.0
    }
}

impl fmt::Display for ExchangeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Display metadata recorded when an exchange is first referenced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeMeta {
    pub code: ExchangeCode,
    pub name: Option<String>,
    pub timezone: Option<String>,
    pub currency: Option<String>,
}

impl ExchangeMeta {
    pub fn bare(code: ExchangeCode) -> Self {
        Self {
            code,
            name: None,
            timezone: None,
            currency: None,
        }
    }
}

/// A tracked symbol: ticker (upper case) qualified by its exchange.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SymbolRef {
    pub exchange: ExchangeCode,
    pub ticker: String,
}

impl SymbolRef {
    pub fn new(exchange: ExchangeCode, ticker: &str) -> Result<Self, DomainError> {
        let ticker = ticker.trim().to_ascii_uppercase();
        if ticker.is_empty() {
            return Err(DomainError::EmptyIdentifier("ticker"));
        }
        Ok(Self { exchange, ticker })
    }

    pub fn parse(exchange: &str, ticker: &str) -> Result<Self, DomainError> {
        Self::new(ExchangeCode::new(exchange)?, ticker)
    }
}

impl fmt::Display for SymbolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.ticker)
    }
}

/// Daily classification produced by the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum SentimentValue {
    Neutral,
    Positive,
    Negative,
}

impl SentimentValue {
    pub fn as_i16(self) -> i16 {
        match self {
            Self::Neutral => 0,
            Self::Positive => 1,
            Self::Negative => 2,
        }
    }
}

impl TryFrom<i64> for SentimentValue {
    type Error = DomainError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Neutral),
            1 => Ok(Self::Positive),
            2 => Ok(Self::Negative),
            other => Err(DomainError::ValueOutOfRange(other)),
        }
    }
}

impl From<SentimentValue> for i64 {
    fn from(value: SentimentValue) -> Self {
        i64::from(value.as_i16())
    }
}

impl fmt::Display for SentimentValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i16())
    }
}

/// One (date, value) row destined for a symbol's series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentimentRecord {
    pub date: NaiveDate,
    pub value: SentimentValue,
}

impl SentimentRecord {
    pub fn new(date: NaiveDate, value: SentimentValue) -> Self {
        Self { date, value }
    }
}

/// Version token captured by `read_state` and handed back on commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreSnapshot {
    /// Nothing stored yet; the commit creates the collection.
    Absent,
    /// Opaque token of the blob that was read.
    Version(String),
    /// Backend without optimistic concurrency.
    Unversioned,
}

impl StoreSnapshot {
    pub fn version(&self) -> Option<&str> {
        match self {
            Self::Version(token) => Some(token),
            Self::Absent | Self::Unversioned => None,
        }
    }
}

/// Current UTC calendar date.
pub fn today_utc() -> NaiveDate {
    Utc::now().date_naive()
}

/// UTC calendar date of an epoch-milliseconds timestamp.
pub fn ms_to_utc_date(ms: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.date_naive())
}

/// Epoch milliseconds of UTC midnight on `date`.
pub fn utc_midnight_ms(date: NaiveDate) -> i64 {
    date.and_time(chrono::NaiveTime::MIN).and_utc().timestamp_millis()
}
