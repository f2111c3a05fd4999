//! HTTP/JSON market-data source.
//!
//! Each remote method maps to an endpoint path template. Path parameters
//! (`{ticker}`) are substituted from the spec and removed from the query
//! string; everything else is sent as query parameters. The API key travels
//! as a bearer token, never in the URL. Responses carry `results` and an
//! optional `next_url` whose `cursor` query parameter is the continuation
//! token.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::PageSource;
use crate::types::{Cursor, FetchSpec, Page, Record, ScreenError};

/// Method name → endpoint path template.
const ENDPOINTS: &[(&str, &str)] = &[
    ("list_short_interest", "/stocks/v1/short-interest"),
    ("list_short_volume", "/stocks/v1/short-volume"),
    ("list_stock_ratios", "/stocks/financials/v1/ratios"),
    ("list_aggs", "/v2/aggs/ticker/{ticker}/range/1/day/{from}/{to}"),
    ("list_earnings", "/benzinga/v1/earnings"),
];

/// Default page size requested when a spec does not set one.
const DEFAULT_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Deserialize)]
struct ApiPage {
    #[serde(default)]
    results: Vec<Record>,
    #[serde(default)]
    next_url: Option<String>,
}

/// REST client for the market-data API.
pub struct RestSource {
    http: Client,
    base_url: String,
    api_key: SecretString,
    default_page_size: u32,
}

impl RestSource {
    pub fn new(base_url: &str, api_key: SecretString, timeout: Duration) -> Result<Self, ScreenError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("SCREENER/0.1.0 (market-data-screener)")
            .build()
            .map_err(|e| ScreenError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            default_page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// Page size for specs that do not set their own.
    pub fn with_default_page_size(mut self, page_size: u32) -> Self {
        self.default_page_size = page_size.max(1);
        self
    }

    /// Resolve the URL and query parameters for one page request.
    fn build_request(
        &self,
        spec: &FetchSpec,
        cursor: Option<&Cursor>,
    ) -> Result<(String, Vec<(String, String)>), ScreenError> {
        let template = ENDPOINTS
            .iter()
            .find(|(method, _)| *method == spec.method)
            .map(|(_, path)| *path)
            .ok_or_else(|| ScreenError::permanent(&spec.method, "unknown remote method"))?;

        let mut path = template.to_string();
        let mut query = Vec::new();
        for (name, value) in spec.params() {
            let placeholder = format!("{{{name}}}");
            if path.contains(&placeholder) {
                path = path.replace(&placeholder, &urlencoding::encode(&value.to_string()));
            } else {
                query.push((name.clone(), value.to_string()));
            }
        }
        if path.contains('{') {
            return Err(ScreenError::permanent(
                &spec.method,
                format!("missing path parameter in {path}"),
            ));
        }

        query.push((
            "limit".to_string(),
            spec.page_size.unwrap_or(self.default_page_size).to_string(),
        ));
        if let Some(cursor) = cursor {
            query.push(("cursor".to_string(), cursor.as_str().to_string()));
        }
        Ok((format!("{}{}", self.base_url, path), query))
    }
}

#[async_trait]
impl PageSource for RestSource {
    async fn fetch_page(&self, spec: &FetchSpec, cursor: Option<Cursor>) -> Result<Page, ScreenError> {
        let (url, query) = self.build_request(spec, cursor.as_ref())?;
        let method = spec.method.as_str();

        let response = self
            .http
            .get(&url)
            .query(&query)
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| classify_transport(method, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(method, status, &body));
        }

        // Body read failures are transport errors; only decoding is permanent.
        let body = response
            .bytes()
            .await
            .map_err(|e| classify_transport(method, e))?;
        let page: ApiPage = serde_json::from_slice(&body)
            .map_err(|e| ScreenError::permanent(method, format!("malformed response body: {e}")))?;

        let next = page.next_url.as_deref().and_then(cursor_from_next_url);
        debug!(
            method,
            records = page.results.len(),
            has_next = next.is_some(),
            "Fetched page"
        );
        Ok(Page {
            records: page.results,
            next,
        })
    }
}

/// Map a reqwest error to the source taxonomy. The URL is stripped so the
/// message never carries query parameters into logs.
fn classify_transport(method: &str, e: reqwest::Error) -> ScreenError {
    let transient = e.is_timeout() || e.is_connect() || e.is_request() || e.is_body();
    let message = e.without_url().to_string();
    if transient {
        ScreenError::transient(method, message)
    } else {
        ScreenError::permanent(method, message)
    }
}

fn classify_status(method: &str, status: StatusCode, body: &str) -> ScreenError {
    let message = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ScreenError::transient(method, message)
    } else {
        ScreenError::permanent(method, message)
    }
}

/// Pull the `cursor` query parameter out of a `next_url`.
fn cursor_from_next_url(next_url: &str) -> Option<Cursor> {
    let query = next_url.split_once('?').map_or(next_url, |(_, q)| q);
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("cursor="))
        .filter(|raw| !raw.is_empty())
        .map(|raw| {
            let decoded = urlencoding::decode(raw).map_or_else(|_| raw.to_string(), |d| d.into_owned());
            Cursor(decoded)
        })
}
