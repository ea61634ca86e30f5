//! Ingestion path: pull pages from a source into the context store.
//!
//! Uploading a page fetches it through its connector, embeds every chunk
//! with the document task type, and upserts the points tagged with an
//! access-group list. Existing points for the page are replaced, not
//! appended to.

use crate::error::{GroundedError, SourceError};
use crate::llm::LanguageModel;
use crate::source::{ConnectorRegistry, extract_page_id};
use crate::store::{ContextStore, ItemPayload, MetadataFilter, StoredPoint};
use crate::types::EmbeddingTask;
use std::sync::Arc;
use tracing::info;

/// Moves source pages into the context store.
pub struct Ingestor {
    llm: Arc<dyn LanguageModel>,
    store: Arc<dyn ContextStore>,
    connectors: Arc<ConnectorRegistry>,
}

impl Ingestor {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        store: Arc<dyn ContextStore>,
        connectors: Arc<ConnectorRegistry>,
    ) -> Self {
        Self {
            llm,
            store,
            connectors,
        }
    }

    /// Upload a page (and, when `recursive`, its sub-pages) into the
    /// store, visible to the given access groups. Returns the number of
    /// chunks stored.
    pub async fn upload(
        &self,
        source: &str,
        page_id: &str,
        access_groups: &[String],
        recursive: bool,
    ) -> Result<usize, GroundedError> {
        let connector =
            self.connectors
                .get(source)
                .ok_or_else(|| SourceError::UnknownSource {
                    system: source.to_string(),
                })?;

        let pages = connector.fetch(page_id, recursive).await?;
        let mut stored = 0;

        for page in pages {
            // Replace any previous version of this page.
            self.store
                .delete_by_filter(&MetadataFilter::for_page(source, &page.page_id))
                .await?;

            let mut points = Vec::with_capacity(page.chunks.len());
            for chunk in &page.chunks {
                let vector = self.llm.embed(chunk, EmbeddingTask::Document).await?;
                points.push(StoredPoint::new(
                    vector,
                    ItemPayload {
                        content: chunk.clone(),
                        source: source.to_string(),
                        updated_at: page.updated_at.clone(),
                        page_id: page.page_id.clone(),
                        access_groups: access_groups.to_vec(),
                    },
                ));
            }

            stored += points.len();
            self.store.upsert(points).await?;
            info!(
                source,
                page_id = %page.page_id,
                title = %page.title,
                chunks = page.chunks.len(),
                "Page uploaded"
            );
        }

        Ok(stored)
    }

    /// Upload a page addressed by its shared URL instead of a bare id.
    pub async fn upload_url(
        &self,
        source: &str,
        page_url: &str,
        access_groups: &[String],
        recursive: bool,
    ) -> Result<usize, GroundedError> {
        let page_id = extract_page_id(page_url)?;
        self.upload(source, &page_id, access_groups, recursive).await
    }

    /// Replace the access-group list on every stored chunk of a page.
    pub async fn update_access_groups(
        &self,
        source: &str,
        page_id: &str,
        access_groups: &[String],
    ) -> Result<(), GroundedError> {
        self.store
            .update_access_groups(&MetadataFilter::for_page(source, page_id), access_groups)
            .await?;
        Ok(())
    }

    /// Remove every stored chunk of a page.
    pub async fn delete_page(&self, source: &str, page_id: &str) -> Result<(), GroundedError> {
        self.store
            .delete_by_filter(&MetadataFilter::for_page(source, page_id))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLanguageModel;
    use crate::source::{FetchedPage, SourceConnector};
    use crate::store::MemoryStore;
    use crate::types::FreshnessRecord;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct StubConnector {
        pages: Vec<FetchedPage>,
    }

    #[async_trait]
    impl SourceConnector for StubConnector {
        fn source(&self) -> &str {
            "notion"
        }

        async fn fetch(
            &self,
            _page_id: &str,
            _recursive: bool,
        ) -> Result<Vec<FetchedPage>, SourceError> {
            Ok(self.pages.clone())
        }

        async fn page_metadata(&self, page_id: &str) -> Result<FreshnessRecord, SourceError> {
            Err(SourceError::NotFound {
                system: "notion".into(),
                page_id: page_id.into(),
            })
        }
    }

    fn ingestor_with(pages: Vec<FetchedPage>) -> (Ingestor, Arc<MemoryStore>) {
        let llm = Arc::new(MockLanguageModel::new());
        let store = Arc::new(MemoryStore::new(8));
        let mut connectors = ConnectorRegistry::new();
        connectors.register(Arc::new(StubConnector { pages }));
        let ingestor = Ingestor::new(llm, store.clone(), Arc::new(connectors));
        (ingestor, store)
    }

    fn page(page_id: &str, chunks: &[&str]) -> FetchedPage {
        FetchedPage {
            page_id: page_id.into(),
            title: "Test Page".into(),
            updated_at: "2024-06-01T00:00:00.000Z".into(),
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_upload_stores_every_chunk() {
        let (ingestor, store) = ingestor_with(vec![page("p1", &["chunk a", "chunk b"])]);
        let stored = ingestor
            .upload("notion", "p1", &["eng".into()], false)
            .await
            .unwrap();
        assert_eq!(stored, 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_reupload_replaces_old_points() {
        let (ingestor, store) = ingestor_with(vec![page("p1", &["chunk a", "chunk b"])]);
        ingestor
            .upload("notion", "p1", &["eng".into()], false)
            .await
            .unwrap();
        ingestor
            .upload("notion", "p1", &["eng".into()], false)
            .await
            .unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_source_is_an_error() {
        let (ingestor, _) = ingestor_with(vec![]);
        let err = ingestor
            .upload("wiki", "p1", &["eng".into()], false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GroundedError::Source(SourceError::UnknownSource { .. })
        ));
    }
}
