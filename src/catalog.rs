use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;

use crate::store::{ContentKind, ContentRef};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Content type is supported but the title was not found")]
    NotFound,
    #[error("Failed to fetch metadata: {0}")]
    FetchError(String),
    #[error("Failed to parse metadata: {0}")]
    ParseError(String),
    #[error("No catalog is configured")]
    Unavailable,
    #[error("{0}")]
    Other(String),
}

/// Display metadata for the content a session is watching
#[derive(Debug, Clone, PartialEq)]
pub struct ContentMeta {
    pub title: String,
    pub poster_url: Option<String>,
    pub runtime_seconds: f32,
}

/// Represents a read-only metadata source for content references.
///
/// Looked up once at session creation, purely for display. A failing
/// catalog never blocks a session; the engine proceeds with the opaque
/// reference.
#[async_trait]
pub trait Catalog: Send + Sync + 'static {
    async fn content_meta(&self, content: &ContentRef) -> Result<ContentMeta, CatalogError>;
}

/// A catalog backed by an HTTP metadata service.
pub struct HttpCatalog {
    base_url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawContentMeta {
    title: String,
    poster_url: Option<String>,
    runtime_seconds: f32,
}

impl HttpCatalog {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn url_for(&self, content: &ContentRef) -> String {
        let collection = match content.kind {
            ContentKind::Movie => "movies",
            ContentKind::Episode => "episodes",
        };

        format!("{}/{}/{}", self.base_url, collection, content.id)
    }
}

#[async_trait]
impl Catalog for HttpCatalog {
    async fn content_meta(&self, content: &ContentRef) -> Result<ContentMeta, CatalogError> {
        let response = self
            .client
            .get(self.url_for(content))
            .send()
            .await
            .map_err(|e| CatalogError::FetchError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(handle_unsuccessful_request(response, status).await);
        }

        let raw: RawContentMeta = response
            .json()
            .await
            .map_err(|e| CatalogError::ParseError(e.to_string()))?;

        Ok(ContentMeta {
            title: raw.title,
            poster_url: raw.poster_url,
            runtime_seconds: raw.runtime_seconds,
        })
    }
}

async fn handle_unsuccessful_request(response: Response, status: StatusCode) -> CatalogError {
    if status == StatusCode::NOT_FOUND {
        return CatalogError::NotFound;
    }

    match response.text().await {
        Ok(text) => CatalogError::Other(text),
        Err(e) => CatalogError::Other(e.to_string()),
    }
}

/// A catalog that knows nothing. Used in tests and headless deployments
/// where no metadata service exists.
pub struct NullCatalog;

#[async_trait]
impl Catalog for NullCatalog {
    async fn content_meta(&self, _content: &ContentRef) -> Result<ContentMeta, CatalogError> {
        Err(CatalogError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_shapes() {
        let catalog = HttpCatalog::new("https://catalog.example.com/");

        let movie = ContentRef {
            id: "tt0133093".to_string(),
            kind: ContentKind::Movie,
        };
        let episode = ContentRef {
            id: "tt0959621".to_string(),
            kind: ContentKind::Episode,
        };

        assert_eq!(
            catalog.url_for(&movie),
            "https://catalog.example.com/movies/tt0133093"
        );
        assert_eq!(
            catalog.url_for(&episode),
            "https://catalog.example.com/episodes/tt0959621"
        );
    }

    #[tokio::test]
    async fn test_null_catalog_is_unavailable() {
        let content = ContentRef {
            id: "anything".to_string(),
            kind: ContentKind::Movie,
        };

        let err = NullCatalog.content_meta(&content).await.unwrap_err();
        assert!(matches!(err, CatalogError::Unavailable));
    }
}
