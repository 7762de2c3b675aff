//! Typed view of the exchanges/stocks document maintained by the configuration UI.

use std::collections::BTreeMap;
use std::path::Path;

use senti_core::{ExchangeCode, ExchangeMeta, SymbolRef};
use senti_storage::{SentimentStore, StoreError};
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::ConfigError;

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UniverseDocument {
    #[serde(default)]
    pub apis: BTreeMap<String, ApiEntry>,
    #[serde(default)]
    pub exchanges: BTreeMap<String, ExchangeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiEntry {
    /// Name of the environment variable holding the credential, never the credential.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub base_endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExchangeEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub stocks: BTreeMap<String, StockEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StockEntry {
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub news_sources: Vec<NewsSource>,
    #[serde(default)]
    pub social_sources: BTreeMap<String, SourceToggle>,
    #[serde(default)]
    pub financial_sources: BTreeMap<String, SourceToggle>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewsSource {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceToggle {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
}

/// Store changes implied by the document for the tracked exchanges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniversePlan {
    pub exchanges: Vec<ExchangeMeta>,
    pub activate: Vec<SymbolRef>,
    pub deactivate: Vec<SymbolRef>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UniverseApplied {
    pub created: usize,
    pub activated: usize,
    pub deactivated: usize,
}

impl UniverseDocument {
    pub fn parse(text: &str, origin: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text.trim_start_matches('\u{feff}')).map_err(|err| {
            ConfigError::Universe {
                path: origin.to_string(),
                message: err.to_string(),
            }
        })
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let origin = path.display().to_string();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| ConfigError::Universe {
                path: origin.clone(),
                message: err.to_string(),
            })?;
        Self::parse(&text, &origin)
    }

    /// Env var named by `apis.gemini.api_key`, when that entry is enabled.
    pub fn gemini_key_env(&self) -> Option<&str> {
        self.apis
            .get("gemini")
            .filter(|api| api.enabled)
            .and_then(|api| api.api_key.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    pub fn plan(&self, tracked: &[ExchangeCode]) -> Result<UniversePlan, ConfigError> {
        let mut plan = UniversePlan::default();
        for (key, exchange) in &self.exchanges {
            let code = ExchangeCode::new(key).map_err(|err| ConfigError::Universe {
                path: format!("exchanges.{key}"),
                message: err.to_string(),
            })?;
            if !tracked.contains(&code) {
                continue;
            }

            plan.exchanges.push(ExchangeMeta {
                code: code.clone(),
                name: exchange.name.clone(),
                timezone: exchange.timezone.clone(),
                currency: exchange.currency.clone(),
            });

            for (ticker, stock) in &exchange.stocks {
                let symbol =
                    SymbolRef::new(code.clone(), ticker).map_err(|err| ConfigError::Universe {
                        path: format!("exchanges.{key}.stocks.{ticker}"),
                        message: err.to_string(),
                    })?;
                if exchange.enabled && stock.enabled {
                    plan.activate.push(symbol);
                } else {
                    plan.deactivate.push(symbol);
                }
            }
        }
        Ok(plan)
    }
}

impl UniversePlan {
    /// Lazily create what is enabled and deactivate what is not. Nothing is deleted.
    pub async fn apply(&self, store: &dyn SentimentStore) -> Result<UniverseApplied, StoreError> {
        let mut applied = UniverseApplied::default();
        for meta in &self.exchanges {
            store.ensure_exchange(meta).await?;
        }
        for symbol in &self.activate {
            if store.ensure_symbol(symbol).await? {
                applied.created += 1;
            }
            store.set_symbol_active(symbol, true).await?;
            applied.activated += 1;
        }
        for symbol in &self.deactivate {
            match store.set_symbol_active(symbol, false).await {
                Ok(()) => applied.deactivated += 1,
                Err(StoreError::UnknownSymbol(_)) => {}
                Err(err) => {
                    warn!(%symbol, error = %err, "could not deactivate symbol");
                    return Err(err);
                }
            }
        }
        info!(
            created = applied.created,
            activated = applied.activated,
            deactivated = applied.deactivated,
            "universe applied"
        );
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use senti_storage::{BlobLayout, BlobSentimentStore, MemoryBlobBackend};

    const DOC: &str = r#"{
        "apis": {
            "gemini": {
                "api_key": "MY_GEMINI_KEY", "api_secret": "",
                "enabled": true, "base_endpoint": ""
            }
        },
        "exchanges": {
            "NASDAQ": {
                "name": "NASDAQ", "enabled": true,
                "timezone": "America/New_York", "currency": "USD",
                "stocks": {
                    "aapl": { "full_name": "Apple Inc.", "enabled": true,
                              "news_sources": [
                                  { "name": "reuters", "enabled": true,
                                    "url": "https://reuters.com" }
                              ],
                              "social_sources": { "reddit": { "enabled": false } },
                              "financial_sources": {} },
                    "MSFT": { "enabled": false }
                }
            },
            "lse": { "enabled": true, "stocks": { "VOD": {} } },
            "nse": { "enabled": false, "stocks": { "TCS": { "enabled": true } } }
        }
    }"#;

    fn tracked() -> Vec<ExchangeCode> {
        ["nasdaq", "nse"].iter().map(|c| ExchangeCode::new(c).unwrap()).collect()
    }

    #[test]
    fn plan_splits_enabled_and_disabled_for_tracked_exchanges() {
        let doc = UniverseDocument::parse(DOC, "test").unwrap();
        assert_eq!(doc.gemini_key_env(), Some("MY_GEMINI_KEY"));

        let plan = doc.plan(&tracked()).unwrap();
        assert_eq!(plan.exchanges.len(), 2);
        assert_eq!(plan.exchanges[0].timezone.as_deref(), Some("America/New_York"));
        assert_eq!(plan.activate, vec![SymbolRef::parse("nasdaq", "AAPL").unwrap()]);
        assert_eq!(
            plan.deactivate,
            vec![
                SymbolRef::parse("nasdaq", "MSFT").unwrap(),
                SymbolRef::parse("nse", "TCS").unwrap()
            ]
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let doc = r#"{"exchanges": {"nse": {"stocks": {}, "colour": "red"}}}"#;
        let err = UniverseDocument::parse(doc, "doc.json").unwrap_err();
        match err {
            ConfigError::Universe { path, message } => {
                assert_eq!(path, "doc.json");
                assert!(message.contains("colour"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn applying_twice_creates_once_and_never_deletes() {
        let store = BlobSentimentStore::new(MemoryBlobBackend::default(), BlobLayout::new("data"));
        let plan = UniverseDocument::parse(DOC, "test").unwrap().plan(&tracked()).unwrap();

        let first = plan.apply(&store).await.unwrap();
        assert_eq!(first.created, 1);
        let second = plan.apply(&store).await.unwrap();
        assert_eq!(second.created, 0);

        let nasdaq = ExchangeCode::new("nasdaq").unwrap();
        assert_eq!(
            store.active_symbols(&nasdaq).await.unwrap(),
            vec![SymbolRef::parse("nasdaq", "AAPL").unwrap()]
        );
    }
}
