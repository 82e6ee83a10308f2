use async_trait::async_trait;
use governor::{ DefaultDirectRateLimiter, Quota, RateLimiter };
use log::{ error, info };
use serde::Deserialize;
use serde_json::{ json, Value };
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::search::{ SearchEngine, SearchResult, SerpApiClient };
use super::{ required_str, ToolDescriptor, ToolError, ToolHandler };
use crate::retry::{ with_retry, RetryPolicy, Retryable };

pub const GET_SEARCH_AND_SCRAPE: &str = "get_search_and_scrape";

const FIRECRAWL_URL: &str = "https://api.firecrawl.dev/v1/scrape";
const SCRAPE_FAILED: &str = "Error during scraping";
const NO_CONTENT: &str = "No content found";
pub const DEFAULT_MAX_CHARS: usize = 20_000;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("FIRECRAWL_API_KEY not found in environment variables.")]
    MissingApiKey,
    #[error("Firecrawl returned HTTP {status}: {body}")]
    Status {
        status: u16,
        body: String,
    },
    #[error("Firecrawl could not scrape the page: {0}")]
    Failed(String),
    #[error("HTTP request to Firecrawl failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl Retryable for ScrapeError {
    fn is_retryable(&self) -> bool {
        match self {
            ScrapeError::Http(e) => e.is_timeout() || e.is_connect(),
            ScrapeError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Fetches one page as markdown.
#[async_trait]
pub trait PageScraper: Send + Sync {
    async fn scrape(&self, url: &str) -> Result<String, ScrapeError>;

    /// Checked once before a batch so a missing credential fails the whole call.
    fn ensure_configured(&self) -> Result<(), ScrapeError> {
        Ok(())
    }
}

#[derive(Deserialize)]
struct FirecrawlResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<FirecrawlData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct FirecrawlData {
    #[serde(default)]
    markdown: Option<String>,
}

pub struct FirecrawlClient {
    http: reqwest::Client,
    api_key: Option<String>,
    url: String,
    retry: RetryPolicy,
}

impl FirecrawlClient {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            url: FIRECRAWL_URL.to_string(),
            retry: RetryPolicy::fixed(1, Duration::from_secs(2)),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl PageScraper for FirecrawlClient {
    async fn scrape(&self, url: &str) -> Result<String, ScrapeError> {
        let api_key = self.api_key.as_deref().ok_or(ScrapeError::MissingApiKey)?;
        let body = json!({ "url": url, "formats": ["markdown"] });
        let (http, endpoint, body) = (&self.http, self.url.as_str(), &body);

        let resp: FirecrawlResponse = with_retry(&self.retry, "Firecrawl scrape", move || async move {
            let resp = http.post(endpoint).bearer_auth(api_key).json(body).send().await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(ScrapeError::Status { status: status.as_u16(), body });
            }
            Ok(resp.json::<FirecrawlResponse>().await?)
        }).await?;

        if !resp.success {
            return Err(ScrapeError::Failed(resp.error.unwrap_or_else(|| "unknown error".to_string())));
        }
        Ok(
            resp.data
                .and_then(|d| d.markdown)
                .unwrap_or_else(|| NO_CONTENT.to_string())
        )
    }

    fn ensure_configured(&self) -> Result<(), ScrapeError> {
        self.api_key.as_ref().map(|_| ()).ok_or(ScrapeError::MissingApiKey)
    }
}

/// Cuts `text` to at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// `get_search_and_scrape`: organic search results with each page's markdown
/// attached as `scraped_content`. Pages are fetched one after another, paced
/// by a rate limiter.
pub struct SearchAndScrapeTool {
    search: SerpApiClient,
    scraper: Arc<dyn PageScraper>,
    limiter: DefaultDirectRateLimiter,
    max_chars: usize,
}

impl SearchAndScrapeTool {
    pub fn new(search: SerpApiClient, scraper: Arc<dyn PageScraper>) -> Self {
        Self {
            search,
            scraper,
            limiter: RateLimiter::direct(Quota::per_second(NonZeroU32::MIN)),
            max_chars: DEFAULT_MAX_CHARS,
        }
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    pub fn with_pages_per_second(mut self, pages: NonZeroU32) -> Self {
        self.limiter = RateLimiter::direct(Quota::per_second(pages));
        self
    }

    /// Scrapes every linked result in place. A page that fails gets the
    /// failure marker instead of aborting the batch.
    pub async fn scrape_all(&self, results: &mut [SearchResult]) -> Result<(), ScrapeError> {
        self.scraper.ensure_configured()?;

        for result in results.iter_mut() {
            let Some(url) = result.link.as_deref() else {
                continue;
            };
            self.limiter.until_ready().await;
            let content = match self.scraper.scrape(url).await {
                Ok(markdown) => truncate_chars(&markdown, self.max_chars).to_string(),
                Err(e) => {
                    error!("Error scraping {}: {}", url, e);
                    SCRAPE_FAILED.to_string()
                }
            };
            result.scraped_content = Some(content);
        }
        Ok(())
    }

    pub async fn search_and_scrape(
        &self,
        engine: SearchEngine,
        query: &str
    ) -> Result<Vec<SearchResult>, ToolError> {
        let mut results = self.search.search(engine, query).await?;
        self.scrape_all(&mut results).await?;
        info!("Scraped {} results for '{}'", results.len(), query);
        Ok(results)
    }
}

pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        GET_SEARCH_AND_SCRAPE,
        "Search the web with the chosen engine and scrape the content of every result page",
        json!({
            "type": "object",
            "properties": {
                "search_query": {
                    "type": "string",
                    "description": "The search query string."
                },
                "search_engine": {
                    "type": "string",
                    "enum": ["google", "baidu", "yandex"],
                    "description": "Search engine to use: google, baidu or yandex."
                }
            },
            "required": ["search_query", "search_engine"]
        })
    )
}

#[async_trait]
impl ToolHandler for SearchAndScrapeTool {
    async fn call(&self, arguments: &Value) -> Result<String, ToolError> {
        let query = required_str(arguments, "search_query")?;
        let engine: SearchEngine = required_str(arguments, "search_engine")?.parse()?;
        let results = self.search_and_scrape(engine, query).await?;
        Ok(serde_json::to_string(&results)?)
    }
}
