//! Classification oracle: `classify(symbol, date) -> {0, 1, 2}`.
//!
//! The Gemini client speaks the REST `generateContent` API through the shared
//! [`RetryingHttpClient`], so throttling and gateway failures are retried there and only
//! exhausted retries reach the caller.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use senti_core::{SentimentValue, SymbolRef};
use senti_storage::{RetryingHttpClient, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, instrument};

pub const CRATE_NAME: &str = "senti-oracle";

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle initialisation failed: {0}")]
    Init(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("oracle api returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("invalid classification for {symbol} on {date}: {output:?}")]
    InvalidOutput {
        symbol: String,
        date: NaiveDate,
        output: String,
    },
}

impl OracleError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(err) if err.is_transient())
    }
}

#[async_trait]
pub trait SentimentOracle: Send + Sync {
    fn name(&self) -> &str;

    /// Classify the day's coverage of `symbol`. Never guesses: anything outside the
    /// closed value set is an error.
    async fn classify(
        &self,
        symbol: &SymbolRef,
        date: NaiveDate,
    ) -> Result<SentimentValue, OracleError>;
}

/// Strict parse of a model reply: a bare `0`, `1` or `2`, optionally JSON-quoted.
pub fn parse_classification(text: &str) -> Option<SentimentValue> {
    let trimmed = text.trim();
    let number = match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Number(n)) => n.as_i64(),
        Ok(serde_json::Value::String(s)) if s.trim().len() == 1 => s.trim().parse().ok(),
        _ => None,
    }?;
    SentimentValue::try_from(number).ok()
}

/// Strip a `models/` prefix so both spellings of the model id work.
pub fn resolve_model_name(name: &str) -> &str {
    name.trim().strip_prefix("models/").unwrap_or(name.trim())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    /// Research the day with Google Search grounding, then classify that summary.
    pub grounded_search: bool,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_GEMINI_MODEL.to_string(),
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            grounded_search: false,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

impl GenerateResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy)]
enum CallMode {
    Research,
    Classify,
}

pub struct GeminiOracle {
    http: Arc<RetryingHttpClient>,
    config: GeminiConfig,
    model: String,
}

impl GeminiOracle {
    pub fn new(http: Arc<RetryingHttpClient>, config: GeminiConfig) -> Result<Self, OracleError> {
        if config.api_key.trim().is_empty() {
            return Err(OracleError::Init(
                "GEMINI_API_KEY or GOOGLE_API_KEY must be set".to_string(),
            ));
        }
        let model = resolve_model_name(&config.model).to_string();
        if model.is_empty() {
            return Err(OracleError::Init("empty model name".to_string()));
        }
        Ok(Self { http, config, model })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.model
        )
    }

    async fn generate(
        &self,
        prompt: &str,
        mode: CallMode,
    ) -> Result<GenerateResponse, OracleError> {
        let request = match mode {
            CallMode::Research => GenerateRequest {
                contents: vec![json!({"role": "user", "parts": [{"text": prompt}]})],
                generation_config: None,
                tools: Some(vec![json!({"google_search": {}})]),
            },
            CallMode::Classify => GenerateRequest {
                contents: vec![json!({"role": "user", "parts": [{"text": prompt}]})],
                generation_config: Some(json!({
                    "temperature": 0.0,
                    "responseMimeType": "application/json",
                })),
                tools: None,
            },
        };

        let url = self.endpoint();
        let resp = self
            .http
            .send("gemini.generate", &url, |c| {
                c.post(&url)
                    .header("x-goog-api-key", &self.config.api_key)
                    .json(&request)
            })
            .await?;

        if resp.status != StatusCode::OK {
            let message: String = resp.text().chars().take(300).collect();
            return Err(OracleError::Api {
                status: resp.status.as_u16(),
                message,
            });
        }
        resp.json::<GenerateResponse>().map_err(|err| OracleError::Api {
            status: resp.status.as_u16(),
            message: format!("{err:#}"),
        })
    }

    async fn research(&self, symbol: &SymbolRef, date: NaiveDate) -> Result<String, OracleError> {
        let prompt = format!(
            "List, as 3 to 5 short bullet points, the public news about stock ticker {} \
             published on {} (UTC). Keep to facts and analyst actions from that day only.",
            symbol.ticker, date
        );
        Ok(self.generate(&prompt, CallMode::Research).await?.text().trim().to_string())
    }
}

fn classification_prompt(ticker: &str, date: NaiveDate, context: Option<&str>) -> String {
    let mut prompt = format!(
        "Classify the overall news sentiment for stock ticker {ticker} on {date} (UTC).\n\
         Answer with one JSON integer and nothing else: 0 = neutral, 1 = positive, 2 = negative."
    );
    if let Some(context) = context {
        prompt.push_str("\nUse only this context:\n");
        prompt.push_str(context);
    }
    prompt
}

#[async_trait]
impl SentimentOracle for GeminiOracle {
    fn name(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(symbol = %symbol, %date))]
    async fn classify(
        &self,
        symbol: &SymbolRef,
        date: NaiveDate,
    ) -> Result<SentimentValue, OracleError> {
        let context = if self.config.grounded_search {
            Some(self.research(symbol, date).await?)
        } else {
            None
        };

        let prompt = classification_prompt(&symbol.ticker, date, context.as_deref());
        let response = self.generate(&prompt, CallMode::Classify).await?;
        let text = response.text();

        if let Some(value) = parse_classification(&text) {
            debug!(value = %value, "classified");
            return Ok(value);
        }

        let output = match response.prompt_feedback.and_then(|f| f.block_reason) {
            Some(reason) if text.trim().is_empty() => format!("blocked: {reason}"),
            _ => text,
        };
        Err(OracleError::InvalidOutput {
            symbol: symbol.to_string(),
            date,
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use senti_storage::{BackoffPolicy, HttpClientConfig};
    use serde_json::Value;

    #[derive(Clone)]
    struct Mock {
        replies: Arc<Mutex<Vec<Value>>>,
        requests: Arc<Mutex<Vec<Value>>>,
        hits: Arc<AtomicUsize>,
    }

    async fn generate(State(mock): State<Mock>, Json(body): Json<Value>) -> Json<Value> {
        mock.hits.fetch_add(1, Ordering::SeqCst);
        mock.requests.lock().unwrap().push(body);
        let mut replies = mock.replies.lock().unwrap();
        let reply = if replies.len() > 1 { replies.remove(0) } else { replies[0].clone() };
        Json(reply)
    }

    fn text_reply(text: &str) -> Value {
        serde_json::json!({"candidates": [{"content": {"parts": [{"text": text}]}}]})
    }

    async fn oracle(replies: Vec<Value>, grounded_search: bool) -> (GeminiOracle, Mock) {
        let mock = Mock {
            replies: Arc::new(Mutex::new(replies)),
            requests: Arc::new(Mutex::new(Vec::new())),
            hits: Arc::new(AtomicUsize::new(0)),
        };
        let app = Router::new()
            .route("/v1beta/models/{call}", post(generate))
            .with_state(mock.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        let http = RetryingHttpClient::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                jitter: false,
            },
            ..Default::default()
        })
        .expect("client");
        let config = GeminiConfig {
            model: "models/gemini-test".to_string(),
            base_url: format!("http://{addr}"),
            grounded_search,
            ..GeminiConfig::new("key")
        };
        (GeminiOracle::new(Arc::new(http), config).expect("oracle"), mock)
    }

    fn aapl() -> SymbolRef {
        SymbolRef::parse("nasdaq", "AAPL").unwrap()
    }

    fn jan(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    #[test]
    fn only_the_closed_value_set_parses() {
        assert_eq!(parse_classification(" 1\n"), Some(SentimentValue::Positive));
        assert_eq!(parse_classification("\"2\""), Some(SentimentValue::Negative));
        assert_eq!(parse_classification("0"), Some(SentimentValue::Neutral));
        for bad in ["", "3", "-1", "1.5", "positive", "1 (positive)", "[1]"] {
            assert_eq!(parse_classification(bad), None, "{bad:?}");
        }
    }

    #[test]
    fn model_prefix_is_stripped() {
        assert_eq!(resolve_model_name("models/gemini-2.5-flash"), "gemini-2.5-flash");
        assert_eq!(resolve_model_name("gemini-2.5-flash"), "gemini-2.5-flash");
    }

    #[test]
    fn missing_key_is_an_init_error() {
        let http = Arc::new(RetryingHttpClient::new(HttpClientConfig::default()).expect("client"));
        let err = GeminiOracle::new(http, GeminiConfig::new("  ")).err().expect("error");
        assert!(matches!(err, OracleError::Init(_)));
    }

    #[tokio::test]
    async fn direct_classification_uses_json_mode() {
        let (oracle, mock) = oracle(vec![text_reply("2")], false).await;
        assert_eq!(oracle.model(), "gemini-test");

        let value = oracle.classify(&aapl(), jan(9)).await.expect("classified");
        assert_eq!(value, SentimentValue::Negative);

        let requests = mock.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["generationConfig"]["responseMimeType"], "application/json");
        assert!(requests[0].get("tools").is_none());
        let prompt = requests[0]["contents"][0]["parts"][0]["text"].as_str().unwrap();
        assert!(prompt.contains("AAPL") && prompt.contains("2024-01-09"));
    }

    #[tokio::test]
    async fn grounded_mode_researches_then_classifies() {
        let (oracle, mock) = oracle(
            vec![text_reply("- earnings beat\n- guidance raised"), text_reply("1")],
            true,
        )
        .await;

        let value = oracle.classify(&aapl(), jan(9)).await.expect("classified");
        assert_eq!(value, SentimentValue::Positive);

        let requests = mock.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0]["tools"][0].get("google_search").is_some());
        let second = requests[1]["contents"][0]["parts"][0]["text"].as_str().unwrap();
        assert!(second.contains("guidance raised"));
    }

    #[tokio::test]
    async fn out_of_set_output_is_fatal_and_not_retried() {
        let (oracle, mock) = oracle(vec![text_reply("probably positive")], false).await;
        let err = oracle.classify(&aapl(), jan(9)).await.expect_err("invalid");
        assert!(matches!(err, OracleError::InvalidOutput { .. }));
        assert!(!err.is_transient());
        assert_eq!(mock.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn blocked_prompt_reports_the_reason() {
        let (oracle, _mock) = oracle(
            vec![serde_json::json!({
                "candidates": [],
                "promptFeedback": {"blockReason": "SAFETY"}
            })],
            false,
        )
        .await;
        match oracle.classify(&aapl(), jan(9)).await {
            Err(OracleError::InvalidOutput { output, .. }) => assert_eq!(output, "blocked: SAFETY"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
