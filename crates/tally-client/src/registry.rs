use std::sync::Arc;

use tally_core::{AppError, Provider, ProviderSettings};

use crate::crossref::CrossrefProvider;
use crate::http::HttpClient;
use crate::wikipedia::WikipediaProvider;

/// Names accepted in the provider settings file.
pub const KNOWN_PROVIDERS: [&str; 2] = [CrossrefProvider::NAME, WikipediaProvider::NAME];

/// Instantiate providers in settings order, sharing one HTTP client.
pub fn build_providers(
    settings: &[ProviderSettings],
    http: &HttpClient,
) -> Result<Vec<Arc<dyn Provider>>, AppError> {
    settings
        .iter()
        .map(|entry| -> Result<Arc<dyn Provider>, AppError> {
            match entry.name.as_str() {
                CrossrefProvider::NAME => Ok(Arc::new(CrossrefProvider::new(
                    http.clone(),
                    entry.descriptor(CrossrefProvider::capabilities())?,
                ))),
                WikipediaProvider::NAME => Ok(Arc::new(WikipediaProvider::new(
                    http.clone(),
                    entry.descriptor(WikipediaProvider::capabilities())?,
                ))),
                other => Err(AppError::ConfigError(format!(
                    "Unknown provider '{other}'. Known providers: {}",
                    KNOWN_PROVIDERS.join(", ")
                ))),
            }
        })
        .collect()
}

/// Settings used when no settings file is given: every known provider with
/// default retry policies.
pub fn default_settings() -> Vec<ProviderSettings> {
    KNOWN_PROVIDERS
        .iter()
        .map(|name| ProviderSettings::named(*name))
        .collect()
}
