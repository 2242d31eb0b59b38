use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tally_core::{
    Alias, Biblio, Capabilities, Item, Provider, ProviderDescriptor, ProviderError,
};

use crate::http::HttpClient;

const DEFAULT_BASE_URL: &str = "https://api.crossref.org";

/// DOI registration agency lookups: resolver URLs and bibliographic data.
pub struct CrossrefProvider {
    descriptor: ProviderDescriptor,
    http: HttpClient,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct WorkEnvelope {
    message: Work,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Work {
    #[serde(rename = "URL")]
    url: Option<String>,
    #[serde(default)]
    title: Vec<String>,
    #[serde(default)]
    container_title: Vec<String>,
    #[serde(default)]
    short_container_title: Vec<String>,
    issued: Option<DateParts>,
    #[serde(default)]
    author: Vec<Author>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DateParts {
    date_parts: Vec<Vec<Option<i64>>>,
}

#[derive(Debug, Deserialize)]
struct Author {
    family: Option<String>,
}

impl CrossrefProvider {
    pub const NAME: &'static str = "crossref";

    pub fn capabilities() -> Capabilities {
        Capabilities {
            aliases: true,
            biblio: true,
            members: true,
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

    /// Look up the first DOI of `item`. `None` when the item has no DOI or
    /// Crossref does not know it.
    async fn work(&self, item: &Item) -> Result<Option<Work>, ProviderError> {
        let Some(doi) = item.aliases.first("doi") else {
            return Ok(None);
        };
        let url = format!("{}/works/{}", self.base_url, doi);
        let envelope: Option<WorkEnvelope> = self.http.get_json(&url).await?;
        Ok(envelope.map(|e| e.message))
    }
}

#[async_trait]
impl Provider for CrossrefProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    /// Split a whitespace- or comma-separated list of DOIs into aliases.
    async fn member_items(&self, query: &str) -> Result<Vec<Alias>, ProviderError> {
        let members: Vec<Alias> = query
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|token| !token.is_empty())
            .map(|token| Alias::new("doi", token).normalized())
            .filter(|alias| alias.id.starts_with("10."))
            .collect();

        if members.is_empty() && !query.trim().is_empty() {
            return Err(ProviderError::validation(format!(
                "No DOIs found in query '{query}'"
            )));
        }
        Ok(members)
    }

    async fn aliases(&self, item: &Item) -> Result<Vec<Alias>, ProviderError> {
        let Some(work) = self.work(item).await? else {
            return Ok(Vec::new());
        };

        let mut aliases = Vec::new();
        if let Some(url) = work.url {
            aliases.push(Alias::new("url", url));
        }
        if let Some(title) = work.title.into_iter().next() {
            aliases.push(Alias::new("title", title));
        }
        Ok(aliases)
    }

    async fn biblio(&self, item: &Item) -> Result<Biblio, ProviderError> {
        let Some(work) = self.work(item).await? else {
            return Ok(Biblio::new());
        };

        let mut biblio = Biblio::new();
        if let Some(title) = work.title.first() {
            biblio.insert("title".into(), json!(title));
        }
        if let Some(journal) = work
            .short_container_title
            .first()
            .or_else(|| work.container_title.first())
        {
            biblio.insert("journal".into(), json!(journal));
        }
        if let Some(year) = work
            .issued
            .as_ref()
            .and_then(|d| d.date_parts.first())
            .and_then(|parts| parts.first().copied().flatten())
        {
            biblio.insert("year".into(), json!(year));
        }
        let authors: Vec<&str> = work
            .author
            .iter()
            .filter_map(|a| a.family.as_deref())
            .collect();
        if !authors.is_empty() {
            biblio.insert("authors".into(), json!(authors.join(", ")));
        }
        Ok(biblio)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use httpmock::prelude::*;
    use tally_core::ErrorKind;

    use super::*;

    const WORK: &str = r#"{
        "status": "ok",
        "message": {
            "URL": "http://dx.doi.org/10.1371/journal.pcbi.1000361",
            "title": ["Adventures in Semantic Publishing"],
            "container-title": ["PLoS Computational Biology"],
            "short-container-title": ["PLoS Comput Biol"],
            "issued": { "date-parts": [[2009, 4, 17]] },
            "author": [
                { "given": "David", "family": "Shotton" },
                { "given": "Katie", "family": "Portwin" }
            ]
        }
    }"#;

    async fn provider(server: &MockServer) -> CrossrefProvider {
        CrossrefProvider::new(
            HttpClient::new().unwrap(),
            ProviderDescriptor::new(CrossrefProvider::NAME, CrossrefProvider::capabilities()),
        )
        .with_base_url(server.base_url())
    }

    async fn serve(server: &MockServer, path: &str, status: u16, body: &str) {
        server
            .mock_async(|when, then| {
                when.method(GET).path(path);
                then.status(status).body(body);
            })
            .await;
    }

    fn item_with_doi(doi: &str) -> Item {
        Item::new(Utc::now()).with_aliases([Alias::new("doi", doi)])
    }

    #[tokio::test]
    async fn aliases_and_biblio_share_one_lookup() {
        let server = MockServer::start_async().await;
        let lookup = server
            .mock_async(|when, then| {
                when.method(GET).path("/works/10.1371/journal.pcbi.1000361");
                then.status(200).body(WORK);
            })
            .await;
        let crossref = provider(&server).await;
        let item = item_with_doi("10.1371/journal.pcbi.1000361");

        let aliases = crossref.aliases(&item).await.unwrap();
        assert!(aliases.contains(&Alias::new(
            "url",
            "http://dx.doi.org/10.1371/journal.pcbi.1000361"
        )));

        let biblio = crossref.biblio(&item).await.unwrap();
        assert_eq!(biblio["title"], json!("Adventures in Semantic Publishing"));
        assert_eq!(biblio["journal"], json!("PLoS Comput Biol"));
        assert_eq!(biblio["year"], json!(2009));
        assert_eq!(biblio["authors"], json!("Shotton, Portwin"));

        assert_eq!(lookup.hits_async().await, 1);
    }

    #[tokio::test]
    async fn unknown_doi_yields_nothing() {
        let server = MockServer::start_async().await;
        let crossref = provider(&server).await;
        let item = item_with_doi("10.9999/missing");

        assert!(crossref.aliases(&item).await.unwrap().is_empty());
        assert!(crossref.biblio(&item).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn item_without_doi_makes_no_request() {
        let server = MockServer::start_async().await;
        let any_get = server
            .mock_async(|when, then| {
                when.method(GET);
                then.status(404);
            })
            .await;
        let crossref = provider(&server).await;
        let item = Item::new(Utc::now()).with_aliases([Alias::new("url", "http://a.org")]);

        assert!(crossref.aliases(&item).await.unwrap().is_empty());
        assert_eq!(any_get.hits_async().await, 0);
    }

    #[tokio::test]
    async fn server_errors_are_classified() {
        let server = MockServer::start_async().await;
        serve(&server, "/works/10.1/busy", 429, "").await;
        serve(&server, "/works/10.1/broken", 500, "").await;
        serve(&server, "/works/10.1/garbled", 200, "not json").await;
        let crossref = provider(&server).await;

        let kind = |doi: &'static str| {
            let crossref = &crossref;
            async move {
                crossref
                    .biblio(&item_with_doi(doi))
                    .await
                    .unwrap_err()
                    .kind()
            }
        };
        assert_eq!(kind("10.1/busy").await, Some(ErrorKind::RateLimitReached));
        assert_eq!(kind("10.1/broken").await, Some(ErrorKind::ClientServerError));
        assert_eq!(kind("10.1/garbled").await, Some(ErrorKind::ContentMalformed));
    }

    #[tokio::test]
    async fn member_items_parses_doi_lists() {
        let server = MockServer::start_async().await;
        let crossref = provider(&server).await;

        let members = crossref
            .member_items("doi:10.1/A, 10.2/b\n  https://doi.org/10.3/C")
            .await
            .unwrap();
        assert_eq!(
            members,
            vec![
                Alias::new("doi", "10.1/a"),
                Alias::new("doi", "10.2/b"),
                Alias::new("doi", "10.3/c"),
            ]
        );

        let err = crossref.member_items("not-a-doi").await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ValidationFailed));
    }

    #[tokio::test]
    async fn metrics_are_not_offered() {
        let server = MockServer::start_async().await;
        let crossref = provider(&server).await;
        let err = crossref
            .metrics(&item_with_doi("10.1/x"))
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::NotImplemented);
    }
}
