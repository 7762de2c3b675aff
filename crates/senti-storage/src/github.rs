//! Blob backend over the GitHub repository contents API.
//!
//! The blob's `sha` is the version token: GitHub refuses a PUT whose `sha` no longer
//! matches the file on the branch (409), or a create for a path that already exists (422).

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::blob::{BlobBackend, BlobError, BlobObject};
use crate::http::{HttpResponse, RetryingHttpClient};

pub const DEFAULT_API_URL: &str = "https://api.github.com";
const JSON_ACCEPT: &str = "application/vnd.github.v3+json";
const RAW_ACCEPT: &str = "application/vnd.github.raw";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubTarget {
    pub api_url: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub token: String,
}

impl GithubTarget {
    fn contents_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_url.trim_end_matches('/'),
            self.owner,
            self.repo,
            path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Deserialize)]
struct ContentsFile {
    sha: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Serialize)]
struct PutContents<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    content: PutResponseContent,
}

#[derive(Debug, Deserialize)]
struct PutResponseContent {
    sha: String,
}

pub struct GithubContentsBackend {
    http: Arc<RetryingHttpClient>,
    target: GithubTarget,
}

impl GithubContentsBackend {
    pub fn new(http: Arc<RetryingHttpClient>, target: GithubTarget) -> Self {
        Self { http, target }
    }

    pub fn target(&self) -> &GithubTarget {
        &self.target
    }

    async fn fetch(&self, path: &str, accept: &'static str) -> Result<HttpResponse, BlobError> {
        let url = self.target.contents_url(path);
        let resp = self
            .http
            .send("github.get", &url, |c| {
                c.get(&url)
                    .query(&[("ref", self.target.branch.as_str())])
                    .header(AUTHORIZATION, format!("Bearer {}", self.target.token))
                    .header(ACCEPT, accept)
            })
            .await?;
        Ok(resp)
    }
}

fn unexpected(path: &str, resp: &HttpResponse) -> BlobError {
    let body = resp.text();
    let snippet: String = body.chars().take(200).collect();
    BlobError::Backend {
        path: path.to_string(),
        message: format!("unexpected status {}: {snippet}", resp.status),
    }
}

fn decode_base64(path: &str, content: &str) -> Result<String, BlobError> {
    let compact: String = content.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD.decode(compact).map_err(|err| BlobError::Backend {
        path: path.to_string(),
        message: format!("invalid base64 content: {err}"),
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[async_trait]
impl BlobBackend for GithubContentsBackend {
    fn describe(&self) -> String {
        format!(
            "github:{}/{}@{}",
            self.target.owner, self.target.repo, self.target.branch
        )
    }

    async fn get(&self, path: &str) -> Result<Option<BlobObject>, BlobError> {
        let resp = self.fetch(path, JSON_ACCEPT).await?;
        match resp.status {
            StatusCode::NOT_FOUND => return Ok(None),
            StatusCode::OK => {}
            _ => return Err(unexpected(path, &resp)),
        }

        let file: ContentsFile = resp.json().map_err(|err| BlobError::Backend {
            path: path.to_string(),
            message: format!("{err:#}"),
        })?;

        let body = match file.encoding.as_str() {
            "base64" => decode_base64(path, &file.content)?,
            // Files over 1 MB come back without inline content.
            _ if file.content.is_empty() && file.size > 0 => {
                debug!(path, size = file.size, "content not inlined; fetching raw");
                let raw = self.fetch(path, RAW_ACCEPT).await?;
                if raw.status != StatusCode::OK {
                    return Err(unexpected(path, &raw));
                }
                raw.text()
            }
            _ => file.content,
        };

        Ok(Some(BlobObject {
            body,
            version: file.sha,
        }))
    }

    async fn put(
        &self,
        path: &str,
        body: &str,
        message: &str,
        expected: Option<&str>,
    ) -> Result<String, BlobError> {
        let url = self.target.contents_url(path);
        let payload = PutContents {
            message,
            content: STANDARD.encode(body.as_bytes()),
            branch: &self.target.branch,
            sha: expected,
        };

        let resp = self
            .http
            .send("github.put", &url, |c| {
                c.put(&url)
                    .header(AUTHORIZATION, format!("Bearer {}", self.target.token))
                    .header(ACCEPT, JSON_ACCEPT)
                    .json(&payload)
            })
            .await?;

        match resp.status {
            StatusCode::OK | StatusCode::CREATED => {
                let parsed: PutResponse = resp.json().map_err(|err| BlobError::Backend {
                    path: path.to_string(),
                    message: format!("{err:#}"),
                })?;
                Ok(parsed.content.sha)
            }
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => Err(BlobError::Conflict {
                path: path.to_string(),
            }),
            _ => Err(unexpected(path, &resp)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use axum::extract::{Path as UrlPath, State};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use crate::http::{BackoffPolicy, HttpClientConfig};

    type Files = Arc<Mutex<HashMap<String, (String, u32)>>>;

    async fn get_file(
        State(files): State<Files>,
        UrlPath((_o, _r, path)): UrlPath<(String, String, String)>,
    ) -> axum::response::Response {
        let files = files.lock().unwrap();
        match files.get(&path) {
            None => (StatusCode::NOT_FOUND, Json(json!({"message": "Not Found"}))).into_response(),
            Some((body, rev)) => {
                // GitHub wraps base64 at 60 columns
                let encoded = STANDARD.encode(body.as_bytes());
                let wrapped: Vec<String> = encoded
                    .as_bytes()
                    .chunks(60)
                    .map(|c| String::from_utf8_lossy(c).into_owned())
                    .collect();
                Json(json!({
                    "sha": format!("sha{rev}"),
                    "content": wrapped.join("\n"),
                    "encoding": "base64",
                    "size": body.len(),
                }))
                .into_response()
            }
        }
    }

    async fn put_file(
        State(files): State<Files>,
        UrlPath((_o, _r, path)): UrlPath<(String, String, String)>,
        Json(payload): Json<Value>,
    ) -> axum::response::Response {
        let mut files = files.lock().unwrap();
        let sent_sha = payload.get("sha").and_then(Value::as_str).map(str::to_string);
        let current = files.get(&path).map(|(_, rev)| format!("sha{rev}"));
        match (current, sent_sha) {
            (Some(_), None) => {
                return (StatusCode::UNPROCESSABLE_ENTITY, "sha wasn't supplied").into_response()
            }
            (Some(cur), Some(sent)) if cur != sent => {
                return (StatusCode::CONFLICT, "does not match").into_response()
            }
            _ => {}
        }
        let content = payload["content"].as_str().unwrap_or_default();
        let body = String::from_utf8(STANDARD.decode(content).unwrap()).unwrap();
        let rev = files.get(&path).map(|(_, rev)| rev + 1).unwrap_or(1);
        files.insert(path, (body, rev));
        let reply = json!({"content": {"sha": format!("sha{rev}")}});
        (StatusCode::CREATED, Json(reply)).into_response()
    }

    async fn backend() -> GithubContentsBackend {
        let files: Files = Arc::new(Mutex::new(HashMap::new()));
        let app = Router::new()
            .route("/repos/{owner}/{repo}/contents/{*path}", get(get_file).put(put_file))
            .with_state(files);
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

        GithubContentsBackend::new(
            Arc::new(http),
            GithubTarget {
                api_url: format!("http://{addr}"),
                owner: "acme".to_string(),
                repo: "sentiment".to_string(),
                branch: "main".to_string(),
                token: "test-token".to_string(),
            },
        )
    }

    #[test]
    fn contents_url_joins_without_double_slashes() {
        let target = GithubTarget {
            api_url: "https://api.github.com/".to_string(),
            owner: "o".to_string(),
            repo: "r".to_string(),
            branch: "main".to_string(),
            token: String::new(),
        };
        assert_eq!(
            target.contents_url("/data/nse/tcs.csv"),
            "https://api.github.com/repos/o/r/contents/data/nse/tcs.csv"
        );
    }

    #[tokio::test]
    async fn missing_file_is_none_and_create_then_read_round_trips_sha() {
        let backend = backend().await;
        assert_eq!(backend.get("data/nse/tcs.csv").await.unwrap(), None);

        let long_body = format!("date,sentiment\n{}", "2024-01-01,1\n".repeat(20));
        let sha = backend
            .put("data/nse/tcs.csv", &long_body, "TCS: add sentiment", None)
            .await
            .unwrap();
        let obj = backend.get("data/nse/tcs.csv").await.unwrap().unwrap();
        assert_eq!(obj.version, sha);
        assert_eq!(obj.body, long_body);
    }

    #[tokio::test]
    async fn stale_sha_and_blind_create_are_conflicts() {
        let backend = backend().await;
        let first = backend.put("a.csv", "one", "m", None).await.unwrap();
        backend.put("a.csv", "two", "m", Some(&first)).await.unwrap();

        let stale = backend.put("a.csv", "three", "m", Some(&first)).await;
        assert!(matches!(stale, Err(BlobError::Conflict { .. })));
        let blind = backend.put("a.csv", "four", "m", None).await;
        assert!(matches!(blind, Err(BlobError::Conflict { .. })));
        assert_eq!(backend.get("a.csv").await.unwrap().unwrap().body, "two");
    }
}
