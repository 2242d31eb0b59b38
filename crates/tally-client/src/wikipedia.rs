use async_trait::async_trait;
use serde::Deserialize;
use tally_core::{
    Capabilities, Item, MetricValue, MetricsUpdate, Provider, ProviderDescriptor, ProviderError,
};
use url::Url;

use crate::http::HttpClient;

const DEFAULT_BASE_URL: &str = "https://en.wikipedia.org";
const SUPPORTED_NAMESPACES: [&str; 2] = ["doi", "url"];

/// Counts Wikipedia articles that mention one of an item's identifiers.
pub struct WikipediaProvider {
    descriptor: ProviderDescriptor,
    http: HttpClient,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    query: SearchQuery,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    searchinfo: SearchInfo,
}

#[derive(Debug, Deserialize)]
struct SearchInfo {
    totalhits: u64,
}

impl WikipediaProvider {
    pub const NAME: &'static str = "wikipedia";

    pub fn capabilities() -> Capabilities {
        Capabilities {
            metrics: true,
            ..Default::default()
        }
    }

    pub fn new(http: HttpClient, descriptor: ProviderDescriptor) -> Self {
        Self {
            descriptor,
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn search_url(&self, id: &str) -> Result<Url, ProviderError> {
        let quoted = format!("\"{id}\"");
        Url::parse_with_params(
            &format!("{}/w/api.php", self.base_url),
            [
                ("action", "query"),
                ("list", "search"),
                ("srsearch", quoted.as_str()),
                ("srlimit", "1"),
                ("format", "json"),
            ],
        )
        .map_err(|e| ProviderError::Fatal(format!("Bad Wikipedia base URL: {e}")))
    }

    fn provenance_url(&self, id: &str) -> Option<String> {
        Url::parse_with_params(
            &format!("{}/wiki/Special:Search", self.base_url),
            [("search", format!("\"{id}\"")), ("go", "Go".to_string())],
        )
        .ok()
        .map(String::from)
    }
}

#[async_trait]
impl Provider for WikipediaProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn metrics(&self, item: &Item) -> Result<MetricsUpdate, ProviderError> {
        let mut mentions = 0u64;
        let mut provenance = None;

        for alias in item
            .aliases
            .iter()
            .filter(|alias| SUPPORTED_NAMESPACES.contains(&alias.namespace.as_str()))
        {
            let url = self.search_url(&alias.id)?;
            let Some(response) = self.http.get_json::<SearchResponse>(url.as_str()).await? else {
                continue;
            };
            let hits = response.query.searchinfo.totalhits;
            if hits > 0 && provenance.is_none() {
                provenance = self.provenance_url(&alias.id);
            }
            mentions += hits;
        }

        let mut update = MetricsUpdate::new();
        if mentions > 0 {
            update.insert("mentions".into(), MetricValue::new(mentions, provenance));
        }
        Ok(update)
    }
}
