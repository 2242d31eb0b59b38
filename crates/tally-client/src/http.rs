use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tally_core::{AppError, ProviderError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(15 * 60);
const DEFAULT_CACHE_CAPACITY: u64 = 10_000;

/// HTTP client shared by providers.
///
/// Successful (200) response bodies are cached by URL for a short while so
/// that several capabilities of one provider can share a single lookup.
/// Transport and status failures come back already classified as
/// [`ProviderError`]s.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    cache: Cache<String, Arc<str>>,
}

impl HttpClient {
    pub fn new() -> Result<Self, AppError> {
        Self::with_settings(DEFAULT_TIMEOUT, DEFAULT_CACHE_TTL)
    }

    pub fn with_settings(timeout: Duration, cache_ttl: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(concat!("Tally/", env!("CARGO_PKG_VERSION"), " (metrics collector)"))
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        let cache = Cache::builder()
            .max_capacity(DEFAULT_CACHE_CAPACITY)
            .time_to_live(cache_ttl)
            .build();

        Ok(Self { client, cache })
    }

    /// GET `url` and return the body.
    ///
    /// `Ok(None)` means the server answered 404, which most providers treat
    /// as "nothing known about this identifier" rather than a failure.
    pub async fn get_text(&self, url: &str) -> Result<Option<Arc<str>>, ProviderError> {
        if let Some(body) = self.cache.get(url).await {
            tracing::trace!(%url, "HTTP cache hit");
            return Ok(Some(body));
        }

        tracing::debug!(%url, "HTTP GET");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if let Some(err) = classify_status(status, url) {
            return Err(err);
        }

        let body: Arc<str> = response
            .text()
            .await
            .map_err(|e| classify_transport(&e))?
            .into();

        if status == StatusCode::OK {
            self.cache.insert(url.to_string(), Arc::clone(&body)).await;
        }
        Ok(Some(body))
    }

    /// GET `url` and decode the body as JSON. 404 is `Ok(None)`.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>, ProviderError> {
        match self.get_text(url).await? {
            None => Ok(None),
            Some(body) => serde_json::from_str(&body).map(Some).map_err(|e| {
                ProviderError::malformed(format!("Invalid JSON from {url}: {e}"))
            }),
        }
    }
}

/// Map a non-success status to a provider error. `None` for 2xx/3xx.
pub fn classify_status(status: StatusCode, url: &str) -> Option<ProviderError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Some(ProviderError::rate_limited(format!("HTTP 429 for {url}")));
    }
    if status.is_client_error() || status.is_server_error() {
        return Some(ProviderError::client_server(format!(
            "HTTP {} for {url}",
            status.as_u16()
        )));
    }
    None
}

fn classify_transport(err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::timeout(err.to_string())
    } else if err.is_decode() {
        ProviderError::malformed(err.to_string())
    } else {
        ProviderError::http(err.to_string())
    }
}
