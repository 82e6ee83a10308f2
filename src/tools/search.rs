use log::{ info, warn };
use serde::{ Deserialize, Serialize };
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::retry::{ with_retry, RetryPolicy, Retryable };

const SERPAPI_URL: &str = "https://serpapi.com/search.json";

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("SERPAPI_API_KEY not found in environment variables.")]
    MissingApiKey,
    #[error("Unsupported search engine '{0}'. Choose from 'google', 'baidu', or 'yandex'.")]
    UnsupportedEngine(String),
    #[error("Error from SerpAPI: {0}")]
    Provider(String),
    #[error("SerpAPI returned HTTP {status}: {body}")]
    Status {
        status: u16,
        body: String,
    },
    #[error("Failed to fetch search results: {0}")]
    Http(#[from] reqwest::Error),
}

impl Retryable for SearchError {
    fn is_retryable(&self) -> bool {
        match self {
            SearchError::Http(e) => e.is_timeout() || e.is_connect(),
            SearchError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchEngine {
    Google,
    Baidu,
    Yandex,
}

impl SearchEngine {
    /// SerpAPI query parameters for this engine, without the API key.
    pub fn params(&self, query: &str) -> Vec<(&'static str, String)> {
        match self {
            SearchEngine::Google =>
                vec![
                    ("engine", "google".to_string()),
                    ("q", query.to_string()),
                    ("location", "Ukraine".to_string()),
                    ("google_domain", "google.com.ua".to_string())
                ],
            SearchEngine::Baidu => vec![("engine", "baidu".to_string()), ("q", query.to_string())],
            SearchEngine::Yandex =>
                vec![
                    ("engine", "yandex".to_string()),
                    ("text", query.to_string()),
                    ("lr", "1".to_string()),
                    ("yandex_domain", "yandex.ru".to_string()),
                    ("lang", "ru".to_string())
                ],
        }
    }
}

impl fmt::Display for SearchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchEngine::Google => write!(f, "google"),
            SearchEngine::Baidu => write!(f, "baidu"),
            SearchEngine::Yandex => write!(f, "yandex"),
        }
    }
}

impl FromStr for SearchEngine {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "google" => Ok(SearchEngine::Google),
            "baidu" => Ok(SearchEngine::Baidu),
            "yandex" => Ok(SearchEngine::Yandex),
            _ => Err(SearchError::UnsupportedEngine(s.to_string())),
        }
    }
}

/// One organic result, trimmed to the fields the report needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub link: Option<String>,
    pub position: Option<u64>,
    pub snippet: Option<String>,
    pub title: Option<String>,
    pub source: Option<String>,
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraped_content: Option<String>,
}

pub struct SerpApiClient {
    http: reqwest::Client,
    api_key: Option<String>,
    url: String,
    retry: RetryPolicy,
}

impl SerpApiClient {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            url: SERPAPI_URL.to_string(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn search(&self, engine: SearchEngine, query: &str) -> Result<Vec<SearchResult>, SearchError> {
        let api_key = self.api_key.as_deref().ok_or(SearchError::MissingApiKey)?;
        let mut params = engine.params(query);
        params.push(("api_key", api_key.to_string()));

        info!("Searching {} for '{}'", engine, query);
        let (http, url, params) = (&self.http, self.url.as_str(), &params);
        let body = with_retry(&self.retry, "SerpAPI search", move || async move {
            let resp = http.get(url).query(params).send().await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                // SerpAPI reports most failures as a JSON body with an "error" key.
                if let Ok(parsed) = serde_json::from_str::<Value>(&body) {
                    if let Some(message) = parsed.get("error").and_then(Value::as_str) {
                        return Err(SearchError::Provider(message.to_string()));
                    }
                }
                return Err(SearchError::Status { status: status.as_u16(), body });
            }
            Ok(resp.json::<Value>().await?)
        }).await?;

        let results = filter_results(&body)?;
        if results.is_empty() {
            warn!("No organic results found.");
        }
        Ok(results)
    }
}

/// Keeps `link, position, snippet, title, source, date` of each organic result.
pub fn filter_results(body: &Value) -> Result<Vec<SearchResult>, SearchError> {
    if let Some(error) = body.get("error") {
        let message = error
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(SearchError::Provider(message));
    }

    let organic = body
        .get("organic_results")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    Ok(
        organic
            .iter()
            .map(|result| SearchResult {
                link: string_field(result, "link"),
                position: result.get("position").and_then(Value::as_u64),
                snippet: string_field(result, "snippet"),
                title: string_field(result, "title"),
                source: string_field(result, "source"),
                date: string_field(result, "date"),
                scraped_content: None,
            })
            .collect()
    )
}

fn string_field(result: &Value, key: &str) -> Option<String> {
    result.get(key).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn engine_names_parse_case_insensitively() {
        assert_eq!("Google".parse::<SearchEngine>().unwrap(), SearchEngine::Google);
        assert_eq!(" yandex ".parse::<SearchEngine>().unwrap(), SearchEngine::Yandex);
        let err = "bing".parse::<SearchEngine>().unwrap_err();
        assert_eq!(err.to_string(), "Unsupported search engine 'bing'. Choose from 'google', 'baidu', or 'yandex'.");
    }

    #[test]
    fn engines_carry_regional_parameters() {
        let google = SearchEngine::Google.params("elections");
        assert!(google.contains(&("q", "elections".to_string())));
        assert!(google.contains(&("google_domain", "google.com.ua".to_string())));

        let yandex = SearchEngine::Yandex.params("выборы");
        assert!(yandex.contains(&("text", "выборы".to_string())));
        assert!(yandex.contains(&("lang", "ru".to_string())));
        assert!(!yandex.iter().any(|(k, _)| *k == "q"));
    }

    #[test]
    fn keeps_only_report_fields() {
        let body =
            json!({
            "search_metadata": {"status": "Success"},
            "organic_results": [
                {
                    "position": 6,
                    "title": "2024 United States presidential election",
                    "link": "https://en.wikipedia.org/wiki/2024_United_States_presidential_election",
                    "snippet": "The 2024 United States presidential election...",
                    "source": "Wikipedia",
                    "favicon": "https://example.com/icon.png"
                },
                {
                    "position": 9,
                    "title": "驻美大使谢锋",
                    "link": "https://m.thepaper.cn/newsDetail_forward_28728643",
                    "date": "2024年9月13日"
                }
            ]
        });
        let results = filter_results(&body).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].source.as_deref(), Some("Wikipedia"));
        assert_eq!(results[0].date, None);
        assert_eq!(results[1].position, Some(9));

        let encoded = serde_json::to_value(&results[0]).unwrap();
        assert!(encoded.get("favicon").is_none());
        assert_eq!(encoded["date"], Value::Null);
        assert!(encoded.get("scraped_content").is_none());
    }

    #[test]
    fn missing_organic_results_is_empty() {
        assert!(filter_results(&json!({"search_metadata": {}})).unwrap().is_empty());
    }

    #[test]
    fn error_key_is_a_provider_error() {
        let err = filter_results(&json!({"error": "Invalid API key."})).unwrap_err();
        assert_eq!(err.to_string(), "Error from SerpAPI: Invalid API key.");
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let client = SerpApiClient::new(Some(String::new()));
        let err = client.search(SearchEngine::Google, "query").await.unwrap_err();
        assert!(matches!(err, SearchError::MissingApiKey));
    }
}
