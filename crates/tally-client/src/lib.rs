pub mod crossref;
pub mod http;
pub mod registry;
pub mod wikipedia;

pub use crossref::CrossrefProvider;
pub use http::HttpClient;
pub use registry::{build_providers, default_settings};
pub use wikipedia::WikipediaProvider;
