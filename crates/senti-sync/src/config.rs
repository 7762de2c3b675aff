//! Process configuration, read once from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use senti_core::ExchangeCode;
use senti_oracle::{DEFAULT_GEMINI_BASE_URL, DEFAULT_GEMINI_MODEL};
use senti_storage::github::DEFAULT_API_URL;
use senti_storage::{BackoffPolicy, HttpClientConfig, TokenBucketConfig};
use thiserror::Error;

const DEFAULT_EXCHANGES: &str = "nasdaq,bse,nse,nyse";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("universe document {path}: {message}")]
    Universe { path: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Postgres,
    Github,
    Fs,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "github" | "gh" => Ok(Self::Github),
            "fs" | "file" | "local" => Ok(Self::Fs),
            other => Err(format!("unknown backend {other:?} (expected postgres, github or fs)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubSettings {
    pub token: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub api_url: String,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub exchanges: Vec<ExchangeCode>,
    pub max_days_per_symbol: usize,
    pub concurrency: usize,
    pub backend: BackendKind,
    pub database_url: Option<String>,
    pub github: Option<GithubSettings>,
    pub blob_root: String,
    pub fs_root: PathBuf,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,
    pub grounded_search: bool,
    pub oracle_rpm: Option<u32>,
    pub retry: BackoffPolicy,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub universe_path: Option<PathBuf>,
    pub partition_first_year: i32,
    pub partition_years_ahead: u32,
    pub reports_dir: Option<PathBuf>,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let exchanges = parse_exchanges(
            &get("SENTIMENT_EXCHANGES").unwrap_or_else(|| DEFAULT_EXCHANGES.to_string()),
        )?;

        let max_days_per_symbol: usize = parse_or(&get, "SENTIMENT_MAX_DAYS_PER_SYMBOL", 30)?;
        if !(1..=366).contains(&max_days_per_symbol) {
            return Err(ConfigError::Invalid {
                key: "SENTIMENT_MAX_DAYS_PER_SYMBOL",
                value: max_days_per_symbol.to_string(),
                reason: "must be between 1 and 366".to_string(),
            });
        }
        let concurrency: usize = parse_or(&get, "SENTIMENT_CONCURRENCY", 4)?;

        let backend = match get("SENTIMENT_BACKEND") {
            None => BackendKind::Postgres,
            Some(raw) => raw.parse().map_err(|reason| ConfigError::Invalid {
                key: "SENTIMENT_BACKEND",
                value: raw.clone(),
                reason,
            })?,
        };

        let database_url = get("DATABASE_URL");
        let github = match (get("GITHUB_TOKEN"), get("GH_OWNER"), get("GH_REPO")) {
            (Some(token), Some(owner), Some(repo)) => Some(GithubSettings {
                token,
                owner,
                repo,
                branch: get("GH_BRANCH").unwrap_or_else(|| "main".to_string()),
                api_url: get("GITHUB_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            }),
            _ if backend == BackendKind::Github => {
                let missing = ["GITHUB_TOKEN", "GH_OWNER", "GH_REPO"]
                    .into_iter()
                    .find(|key| get(*key).is_none())
                    .unwrap_or("GITHUB_TOKEN");
                return Err(ConfigError::Missing(missing));
            }
            _ => None,
        };
        if backend == BackendKind::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let retry = BackoffPolicy {
            max_attempts: parse_or(&get, "SENTIMENT_RETRY_MAX_ATTEMPTS", 5usize)?.max(1),
            base_delay: Duration::from_millis(parse_or(&get, "SENTIMENT_RETRY_BASE_MS", 1000u64)?),
            max_delay: Duration::from_millis(parse_or(
                &get,
                "SENTIMENT_RETRY_MAX_DELAY_MS",
                60_000u64,
            )?),
            jitter: true,
        };

        Ok(Self {
            exchanges,
            max_days_per_symbol,
            concurrency: concurrency.max(1),
            backend,
            database_url,
            github,
            blob_root: get("SENTIMENT_BLOB_ROOT").unwrap_or_else(|| "data".to_string()),
            fs_root: get("SENTIMENT_FS_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sentiment-data")),
            gemini_api_key: get("GEMINI_API_KEY").or_else(|| get("GOOGLE_API_KEY")),
            gemini_model: get("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            gemini_base_url: get("GEMINI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string()),
            grounded_search: get("ENABLE_GOOGLE_SEARCH")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            oracle_rpm: get("SENTIMENT_ORACLE_RPM")
                .map(|raw| {
                    raw.parse::<u32>().map_err(|err| ConfigError::Invalid {
                        key: "SENTIMENT_ORACLE_RPM",
                        value: raw.clone(),
                        reason: err.to_string(),
                    })
                })
                .transpose()?
                .filter(|rpm| *rpm > 0),
            retry,
            http_timeout_secs: parse_or(&get, "SENTIMENT_HTTP_TIMEOUT_SECS", 30u64)?,
            user_agent: get("SENTIMENT_USER_AGENT")
                .unwrap_or_else(|| "senti-backfill/0.1".to_string()),
            universe_path: get("SENTIMENT_UNIVERSE_PATH").map(PathBuf::from),
            partition_first_year: parse_or(&get, "SENTIMENT_PARTITION_FIRST_YEAR", 2023i32)?,
            partition_years_ahead: parse_or(&get, "SENTIMENT_PARTITION_YEARS_AHEAD", 3u32)?,
            reports_dir: get("SENTIMENT_REPORTS_DIR").map(PathBuf::from),
            sync_cron: get("SENTIMENT_SYNC_CRON").unwrap_or_else(|| "0 30 0 * * *".to_string()),
        })
    }

    /// Transport settings for store traffic.
    pub fn store_http(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.concurrency.max(1) * 2,
            backoff: self.retry,
            token_bucket: None,
        }
    }

    /// Transport settings for oracle traffic, throttled when an RPM ceiling is set.
    pub fn oracle_http(&self) -> HttpClientConfig {
        HttpClientConfig {
            token_bucket: self.oracle_rpm.map(TokenBucketConfig::per_minute),
            global_concurrency: self.concurrency.max(1),
            ..self.store_http()
        }
    }
}

fn parse_exchanges(raw: &str) -> Result<Vec<ExchangeCode>, ConfigError> {
    let mut out: Vec<ExchangeCode> = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let code = ExchangeCode::new(part).map_err(|err| ConfigError::Invalid {
            key: "SENTIMENT_EXCHANGES",
            value: raw.to_string(),
            reason: err.to_string(),
        })?;
        if !out.contains(&code) {
            out.push(code);
        }
    }
    if out.is_empty() {
        return Err(ConfigError::Invalid {
            key: "SENTIMENT_EXCHANGES",
            value: raw.to_string(),
            reason: "no exchange codes".to_string(),
        });
    }
    Ok(out)
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|err: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: err.to_string(),
        }),
    }
}
