//! External source systems.
//!
//! A `SourceConnector` fetches page content and live metadata from one
//! source system (Notion today). Connectors register under their source
//! name; the pipeline looks them up when refreshing stale context, and
//! the ingestion path uses them to pull pages into the store.

pub mod notion;

pub use notion::{NotionConnector, NotionMetadataTool};

use crate::error::SourceError;
use crate::types::{ContextItem, FreshnessRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

/// A page fetched from a source: chunked content plus the metadata the
/// store needs.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub page_id: String,
    pub title: String,
    pub updated_at: String,
    pub chunks: Vec<String>,
}

/// Trait over one external source system.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// The source name this connector registers under.
    fn source(&self) -> &str;

    /// Fetch a page's content, chunked for embedding. With `recursive`,
    /// child pages are fetched too; each page stays its own entry.
    async fn fetch(&self, page_id: &str, recursive: bool) -> Result<Vec<FetchedPage>, SourceError>;

    /// Fetch live metadata for a single page without its content.
    async fn page_metadata(&self, page_id: &str) -> Result<FreshnessRecord, SourceError>;
}

/// Registry of connectors keyed by source name.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn SourceConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector under its own source name.
    pub fn register(&mut self, connector: Arc<dyn SourceConnector>) {
        self.connectors
            .insert(connector.source().to_string(), connector);
    }

    /// Look up a connector, or `None` when the source is unknown. The
    /// refresh stage treats a miss as "return what we have", not an
    /// error.
    pub fn get(&self, source: &str) -> Option<Arc<dyn SourceConnector>> {
        self.connectors.get(source).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

/// Build the citation URL for a context item, when the source has a
/// stable page URL scheme. Unknown sources get no citation.
pub fn citation_url(source: &str, page_id: &str) -> Option<String> {
    match source {
        notion::SOURCE_NAME => Some(format!("https://www.notion.so/{}", page_id.replace('-', ""))),
        _ => None,
    }
}

/// Convenience: citation URL for an item.
pub fn item_citation_url(item: &ContextItem) -> Option<String> {
    citation_url(&item.source, &item.page_id)
}

/// Extract the page id from a shared Notion page URL.
///
/// Notion URLs end in `Title-Slug-<32 hex chars>`; bare-id URLs have
/// just the hex. Anything else is an `InvalidUrl` error.
pub fn extract_page_id(page_url: &str) -> Result<String, SourceError> {
    let invalid = || SourceError::InvalidUrl {
        url: page_url.to_string(),
    };

    let parsed = Url::parse(page_url).map_err(|_| invalid())?;
    let last_segment = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .ok_or_else(invalid)?;

    let candidate = last_segment.rsplit('-').next().ok_or_else(invalid)?;
    if candidate.len() == 32 && candidate.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(candidate.to_ascii_lowercase())
    } else {
        Err(invalid())
    }
}
