//! Notion source connector.
//!
//! Talks to the Notion REST API: page retrieval for titles and edit
//! timestamps, paginated block-children listing for content, and a
//! recursive walk over nested blocks and child pages. Timestamps pass
//! through exactly as Notion reports them; the freshness stage compares
//! them by string identity.

use crate::chunk::Chunker;
use crate::config::NotionConfig;
use crate::error::SourceError;
use crate::source::{FetchedPage, SourceConnector};
use crate::types::{FreshnessRecord, ToolDefinition};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

pub const SOURCE_NAME: &str = "notion";

const DEFAULT_BASE_URL: &str = "https://api.notion.com/v1";
const NOTION_VERSION: &str = "2022-06-28";
const PAGE_SIZE: usize = 100;

/// Per-fetch cache of page metadata, keyed by page id.
///
/// One recursive fetch can touch the same page several times (parent
/// lookup plus child walk); the cache keeps that to one API call each.
/// Scoped to a single fetch, never shared across requests.
#[derive(Default)]
struct TimestampCache {
    entries: HashMap<String, PageMeta>,
}

#[derive(Debug, Clone)]
struct PageMeta {
    title: String,
    last_edited_time: String,
}

/// Connector for Notion workspaces.
pub struct NotionConnector {
    client: Client,
    base_url: String,
    token: String,
    chunker: Chunker,
}

impl NotionConnector {
    /// Create a connector from configuration. The integration token is
    /// read from the environment variable named in `config.api_key_env`.
    pub fn new(config: &NotionConfig, chunker: Chunker) -> Result<Self, SourceError> {
        let token = std::env::var(&config.api_key_env).map_err(|_| SourceError::ApiRequest {
            system: SOURCE_NAME.to_string(),
            message: format!("environment variable '{}' not set", config.api_key_env),
        })?;
        Ok(Self::with_token(config, token, chunker))
    }

    /// Create a connector with an explicit token (tests, embedded use).
    pub fn with_token(config: &NotionConfig, token: String, chunker: Chunker) -> Self {
        Self {
            client: Client::new(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            token,
            chunker,
        }
    }

    async fn get(&self, path: &str) -> Result<Value, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .header("Notion-Version", NOTION_VERSION)
            .send()
            .await
            .map_err(|e| SourceError::ApiRequest {
                system: SOURCE_NAME.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| SourceError::ApiRequest {
            system: SOURCE_NAME.to_string(),
            message: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(Self::map_status(status, path, &body));
        }

        serde_json::from_str(&body).map_err(|e| SourceError::ApiRequest {
            system: SOURCE_NAME.to_string(),
            message: format!("invalid JSON from Notion API: {}", e),
        })
    }

    fn map_status(status: reqwest::StatusCode, path: &str, body: &str) -> SourceError {
        match status.as_u16() {
            404 => SourceError::NotFound {
                system: SOURCE_NAME.to_string(),
                page_id: path.rsplit('/').next().unwrap_or(path).to_string(),
            },
            401 | 403 => SourceError::PermissionDenied {
                system: SOURCE_NAME.to_string(),
                message: body.to_string(),
            },
            _ => SourceError::ApiRequest {
                system: SOURCE_NAME.to_string(),
                message: format!("HTTP {} from Notion API: {}", status, body),
            },
        }
    }

    /// Fetch page-level metadata, through the per-fetch cache.
    async fn page_meta(
        &self,
        page_id: &str,
        cache: &mut TimestampCache,
    ) -> Result<PageMeta, SourceError> {
        if let Some(meta) = cache.entries.get(page_id) {
            return Ok(meta.clone());
        }

        let page = self.get(&format!("/pages/{}", page_id)).await?;
        let meta = PageMeta {
            title: Self::extract_title(&page),
            last_edited_time: page["last_edited_time"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
        };
        cache.entries.insert(page_id.to_string(), meta.clone());
        Ok(meta)
    }

    /// Pull the page title out of whichever property carries it.
    fn extract_title(page: &Value) -> String {
        let Some(properties) = page["properties"].as_object() else {
            return String::new();
        };
        for prop in properties.values() {
            if prop["type"].as_str() == Some("title")
                && let Some(parts) = prop["title"].as_array()
            {
                return parts
                    .iter()
                    .filter_map(|p| p["plain_text"].as_str())
                    .collect::<Vec<_>>()
                    .join("");
            }
        }
        String::new()
    }

    /// List all children of a block, following pagination cursors.
    async fn list_children(&self, block_id: &str) -> Result<Vec<Value>, SourceError> {
        let mut blocks = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let path = match &cursor {
                Some(c) => format!(
                    "/blocks/{}/children?page_size={}&start_cursor={}",
                    block_id, PAGE_SIZE, c
                ),
                None => format!("/blocks/{}/children?page_size={}", block_id, PAGE_SIZE),
            };
            let response = self.get(&path).await?;

            if let Some(results) = response["results"].as_array() {
                blocks.extend(results.iter().cloned());
            }
            if response["has_more"].as_bool() == Some(true) {
                cursor = response["next_cursor"].as_str().map(String::from);
                if cursor.is_none() {
                    break;
                }
            } else {
                break;
            }
        }
        Ok(blocks)
    }

    /// Plain text of one block's rich_text payload, whatever its type.
    fn block_text(block: &Value) -> Option<String> {
        let block_type = block["type"].as_str()?;
        if block_type == "child_page" {
            return block["child_page"]["title"].as_str().map(String::from);
        }
        let rich_text = block[block_type]["rich_text"].as_array()?;
        let text: String = rich_text
            .iter()
            .filter_map(|t| t["plain_text"].as_str())
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() { None } else { Some(text) }
    }

    /// Walk a page's block tree depth-first, collecting its text lines
    /// in document order and the ids of any child pages encountered.
    async fn collect_page_text(
        &self,
        page_id: &str,
    ) -> Result<(Vec<String>, Vec<String>), SourceError> {
        let mut lines = Vec::new();
        let mut child_pages = Vec::new();
        self.walk_blocks(page_id.to_string(), &mut lines, &mut child_pages)
            .await?;
        Ok((lines, child_pages))
    }

    /// One DFS step: a block's own text, then its descendants' text,
    /// before any later sibling. Chunk coherence depends on this order.
    fn walk_blocks<'a>(
        &'a self,
        block_id: String,
        lines: &'a mut Vec<String>,
        child_pages: &'a mut Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + 'a>> {
        Box::pin(async move {
            let children = self.list_children(&block_id).await?;
            for block in children {
                let block_type = block["type"].as_str().unwrap_or_default();

                if block_type == "child_page" {
                    if let Some(id) = block["id"].as_str() {
                        child_pages.push(id.to_string());
                    }
                    // Child pages become their own entries; their title
                    // still appears as a line in the parent.
                    if let Some(text) = Self::block_text(&block) {
                        lines.push(text);
                    }
                    continue;
                }

                if let Some(text) = Self::block_text(&block) {
                    lines.push(text);
                }
                if block["has_children"].as_bool() == Some(true)
                    && let Some(id) = block["id"].as_str()
                {
                    self.walk_blocks(id.to_string(), lines, child_pages).await?;
                }
            }
            Ok(())
        })
    }

    /// Fetch one page into a `FetchedPage`, chunked for embedding.
    async fn fetch_one(
        &self,
        page_id: &str,
        cache: &mut TimestampCache,
    ) -> Result<(FetchedPage, Vec<String>), SourceError> {
        let meta = self.page_meta(page_id, cache).await?;
        let (lines, child_pages) = self.collect_page_text(page_id).await?;

        let mut body = meta.title.clone();
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str(&lines.join("\n"));

        let page = FetchedPage {
            page_id: page_id.to_string(),
            title: meta.title,
            updated_at: meta.last_edited_time,
            chunks: self.chunker.split(&body),
        };
        Ok((page, child_pages))
    }
}

#[async_trait]
impl SourceConnector for NotionConnector {
    fn source(&self) -> &str {
        SOURCE_NAME
    }

    async fn fetch(&self, page_id: &str, recursive: bool) -> Result<Vec<FetchedPage>, SourceError> {
        let mut cache = TimestampCache::default();
        let mut pages = Vec::new();
        let mut queue: VecDeque<String> = VecDeque::from([page_id.to_string()]);
        let mut seen: Vec<String> = Vec::new();

        while let Some(current) = queue.pop_front() {
            if seen.contains(&current) {
                continue;
            }
            seen.push(current.clone());

            let (page, child_pages) = self.fetch_one(&current, &mut cache).await?;
            debug!(page_id = %current, chunks = page.chunks.len(), "Fetched Notion page");
            pages.push(page);

            if recursive {
                queue.extend(child_pages);
            }
        }

        Ok(pages)
    }

    async fn page_metadata(&self, page_id: &str) -> Result<FreshnessRecord, SourceError> {
        let mut cache = TimestampCache::default();
        let meta = self.page_meta(page_id, &mut cache).await?;
        Ok(FreshnessRecord {
            data_source: SOURCE_NAME.to_string(),
            page_id: page_id.to_string(),
            last_edited_time: meta.last_edited_time,
        })
    }
}

/// The live-metadata tool exposed to the freshness-check agent.
///
/// Takes a batch of page ids and returns one record per page; pages
/// that fail to resolve are reported as tool-level errors in the output
/// rather than failing the whole batch.
pub struct NotionMetadataTool {
    connector: Arc<NotionConnector>,
}

impl NotionMetadataTool {
    pub fn new(connector: Arc<NotionConnector>) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl crate::freshness::PageMetadataTool for NotionMetadataTool {
    fn source(&self) -> &str {
        SOURCE_NAME
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "notion_page_metadata".to_string(),
            description: "Fetch the live last-edited time of Notion pages by id.".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "page_ids": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Notion page ids to look up."
                    }
                },
                "required": ["page_ids"]
            }),
        }
    }

    async fn call(&self, arguments: &Value) -> Result<Vec<FreshnessRecord>, SourceError> {
        let page_ids = arguments["page_ids"]
            .as_array()
            .ok_or_else(|| SourceError::ApiRequest {
                system: SOURCE_NAME.to_string(),
                message: "tool arguments missing 'page_ids' array".to_string(),
            })?;

        let mut records = Vec::with_capacity(page_ids.len());
        for id in page_ids.iter().filter_map(|v| v.as_str()) {
            match self.connector.page_metadata(id).await {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(page_id = %id, error = %err, "Live metadata lookup failed");
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkingConfig;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP server answering canned JSON per path. Query strings
    /// are ignored when matching, so pagination parameters don't matter.
    async fn stub_api(routes: Vec<(&'static str, Value)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes: Vec<(String, String)> = routes
            .into_iter()
            .map(|(path, body)| (path.to_string(), body.to_string()))
            .collect();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        let Ok(n) = socket.read(&mut chunk).await else {
                            return;
                        };
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let request = String::from_utf8_lossy(&buf);
                    let path = request
                        .lines()
                        .next()
                        .and_then(|line| line.split_whitespace().nth(1))
                        .and_then(|target| target.split('?').next())
                        .unwrap_or("/")
                        .to_string();
                    let (status, body) = match routes.iter().find(|(p, _)| *p == path) {
                        Some((_, body)) => ("200 OK", body.clone()),
                        None => ("404 Not Found", "{}".to_string()),
                    };
                    let response = format!(
                        "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });

        format!("http://{}", addr)
    }

    fn connector_for(base_url: String) -> NotionConnector {
        let config = NotionConfig {
            base_url: Some(base_url),
            ..NotionConfig::default()
        };
        NotionConnector::with_token(
            &config,
            "test-token".to_string(),
            Chunker::new(&ChunkingConfig::default()),
        )
    }

    fn page_json(title: &str, last_edited: &str) -> Value {
        serde_json::json!({
            "last_edited_time": last_edited,
            "properties": {
                "Name": {
                    "type": "title",
                    "title": [ { "plain_text": title } ]
                }
            }
        })
    }

    fn paragraph(id: &str, text: &str, has_children: bool) -> Value {
        serde_json::json!({
            "id": id,
            "type": "paragraph",
            "has_children": has_children,
            "paragraph": { "rich_text": [ { "plain_text": text } ] }
        })
    }

    fn children(blocks: Vec<Value>) -> Value {
        serde_json::json!({ "results": blocks, "has_more": false })
    }

    #[tokio::test]
    async fn test_fetch_splices_nested_block_text_in_document_order() {
        let base_url = stub_api(vec![
            ("/pages/p1", page_json("Parent", "2024-01-01T00:00:00.000Z")),
            (
                "/blocks/p1/children",
                children(vec![paragraph("a", "1", true), paragraph("b", "2", false)]),
            ),
            (
                "/blocks/a/children",
                children(vec![paragraph("a1", "1a", false)]),
            ),
        ])
        .await;

        let connector = connector_for(base_url);
        let pages = connector.fetch("p1", false).await.unwrap();

        assert_eq!(pages.len(), 1);
        // The nested block's text follows its parent line, not the
        // later sibling's.
        assert_eq!(pages[0].chunks, vec!["Parent\n1\n1a\n2".to_string()]);
    }

    #[tokio::test]
    async fn test_fetch_scopes_timestamps_per_page_and_honors_recursion() {
        let routes = vec![
            ("/pages/p1", page_json("Parent", "2024-01-01T00:00:00.000Z")),
            (
                "/blocks/p1/children",
                children(vec![serde_json::json!({
                    "id": "c1",
                    "type": "child_page",
                    "has_children": true,
                    "child_page": { "title": "Child" }
                })]),
            ),
            ("/pages/c1", page_json("Child", "2024-02-02T00:00:00.000Z")),
            (
                "/blocks/c1/children",
                children(vec![paragraph("cb", "child body", false)]),
            ),
        ];

        let base_url = stub_api(routes.clone()).await;
        let connector = connector_for(base_url);

        let flat = connector.fetch("p1", false).await.unwrap();
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].page_id, "p1");
        assert_eq!(flat[0].updated_at, "2024-01-01T00:00:00.000Z");
        // The child page's title still shows up as a line in the parent.
        assert_eq!(flat[0].chunks, vec!["Parent\nChild".to_string()]);

        let base_url = stub_api(routes).await;
        let connector = connector_for(base_url);

        let deep = connector.fetch("p1", true).await.unwrap();
        assert_eq!(deep.len(), 2);
        assert_eq!(deep[0].page_id, "p1");
        assert_eq!(deep[0].updated_at, "2024-01-01T00:00:00.000Z");
        assert_eq!(deep[1].page_id, "c1");
        assert_eq!(deep[1].updated_at, "2024-02-02T00:00:00.000Z");
        assert_eq!(deep[1].chunks, vec!["Child\nchild body".to_string()]);
    }

    #[test]
    fn test_extract_title_finds_title_property() {
        let page = serde_json::json!({
            "properties": {
                "Name": {
                    "type": "title",
                    "title": [
                        { "plain_text": "Team " },
                        { "plain_text": "Handbook" }
                    ]
                },
                "Status": { "type": "select" }
            }
        });
        assert_eq!(NotionConnector::extract_title(&page), "Team Handbook");
    }

    #[test]
    fn test_block_text_joins_rich_text() {
        let block = serde_json::json!({
            "type": "paragraph",
            "paragraph": {
                "rich_text": [
                    { "plain_text": "Hello " },
                    { "plain_text": "world" }
                ]
            }
        });
        assert_eq!(
            NotionConnector::block_text(&block),
            Some("Hello world".to_string())
        );
    }

    #[test]
    fn test_block_text_child_page_uses_title() {
        let block = serde_json::json!({
            "type": "child_page",
            "child_page": { "title": "Onboarding" }
        });
        assert_eq!(
            NotionConnector::block_text(&block),
            Some("Onboarding".to_string())
        );
    }

    #[test]
    fn test_block_text_empty_rich_text_is_none() {
        let block = serde_json::json!({
            "type": "paragraph",
            "paragraph": { "rich_text": [] }
        });
        assert_eq!(NotionConnector::block_text(&block), None);
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            NotionConnector::map_status(reqwest::StatusCode::NOT_FOUND, "/pages/p1", ""),
            SourceError::NotFound { page_id, .. } if page_id == "p1"
        ));
        assert!(matches!(
            NotionConnector::map_status(reqwest::StatusCode::FORBIDDEN, "/pages/p1", "denied"),
            SourceError::PermissionDenied { .. }
        ));
    }
}
