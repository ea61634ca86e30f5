//! Core type definitions for the Grounded pipeline.
//!
//! Defines the fundamental data structures used throughout the system:
//! conversation messages, retrievable context items, model call shapes,
//! and the structured outputs the pipeline stages decode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Represents a participant role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// Content within a message — text, tool call, or tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        output: String,
        is_error: bool,
    },
}

impl Content {
    /// Create a simple text content.
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text { text: text.into() }
    }

    /// Return the text if this is a text content.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// A single message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: Content,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a new message with auto-generated ID and current timestamp.
    pub fn new(role: Role, content: Content) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content,
            timestamp: Utc::now(),
        }
    }

    /// Create a system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, Content::text(text))
    }

    /// Create a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, Content::text(text))
    }

    /// Create an assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, Content::text(text))
    }

    /// Create a tool result message.
    pub fn tool_result(
        call_id: impl Into<String>,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::new(
            Role::Tool,
            Content::ToolResult {
                call_id: call_id.into(),
                output: output.into(),
                is_error,
            },
        )
    }
}

/// A definition describing a tool for the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A stream event received during LLM response streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token(String),
    Done,
    Error(String),
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// The result of an LLM completion request.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub message: Message,
    /// Tool invocations requested alongside (or instead of) text.
    pub tool_calls: Vec<ToolCall>,
    pub model: String,
    pub finish_reason: Option<String>,
}

/// A request to the LLM for completion.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Option<Vec<ToolDefinition>>,
    pub temperature: f32,
    pub max_tokens: Option<usize>,
    pub model: Option<String>,
}

impl Default for CompletionRequest {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            tools: None,
            temperature: 0.0,
            max_tokens: None,
            model: None,
        }
    }
}

impl CompletionRequest {
    /// Build a request from a message list, leaving the rest at defaults.
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Override the model used for this request.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// The embedding task type. The backing model produces different vector
/// geometry for query-time and document-time embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingTask {
    Query,
    Document,
}

impl EmbeddingTask {
    /// API wire name for the task type.
    pub fn as_str(self) -> &'static str {
        match self {
            EmbeddingTask::Query => "RETRIEVAL_QUERY",
            EmbeddingTask::Document => "RETRIEVAL_DOCUMENT",
        }
    }
}

/// Identity of a page within a source system. Freshness is matched on
/// exact `(source, page_id)` pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageKey {
    pub source: String,
    pub page_id: String,
}

/// One retrievable unit of source content with provenance metadata.
///
/// `updated_at` is an opaque, source-defined timestamp string; freshness
/// comparison is exact string identity, never parsed. Immutable once
/// constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub content: String,
    pub source: String,
    pub updated_at: String,
    pub page_id: String,
}

impl ContextItem {
    pub fn new(
        content: impl Into<String>,
        source: impl Into<String>,
        updated_at: impl Into<String>,
        page_id: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
            updated_at: updated_at.into(),
            page_id: page_id.into(),
        }
    }

    /// The `(source, page_id)` identity used for freshness matching.
    pub fn key(&self) -> PageKey {
        PageKey {
            source: self.source.clone(),
            page_id: self.page_id.clone(),
        }
    }
}

/// Structured output of the question-refinement call (stage 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinedQuestion {
    pub rewritten_question: String,
}

impl RefinedQuestion {
    /// JSON schema constraint sent alongside the model call.
    pub fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "rewritten_question": {
                    "type": "string",
                    "description": "The rewritten question based on the previous conversation."
                }
            },
            "required": ["rewritten_question"]
        })
    }
}

/// The two-way routing outcome of the context-necessity call (stage 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteChoice {
    #[serde(rename = "context required")]
    ContextRequired,
    #[serde(rename = "context not required")]
    ContextNotRequired,
}

/// Structured output of the context-necessity call (stage 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub decision: RouteChoice,
}

impl RouteDecision {
    /// JSON schema constraint sent alongside the model call.
    pub fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "decision": {
                    "type": "string",
                    "enum": ["context required", "context not required"],
                    "description": "Whether the question needs context from the vector store."
                }
            },
            "required": ["decision"]
        })
    }
}

/// One live-metadata entry reported by the freshness-check agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshnessRecord {
    pub data_source: String,
    pub page_id: String,
    pub last_edited_time: String,
}

/// Structured final report of the freshness-check agent session (stage 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreshnessReport {
    pub data: Vec<FreshnessRecord>,
}

impl FreshnessReport {
    /// JSON schema constraint sent alongside the final agent call.
    pub fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "data": {
                    "type": "array",
                    "description": "List of page IDs and their last edited times.",
                    "items": {
                        "type": "object",
                        "properties": {
                            "data_source": { "type": "string" },
                            "page_id": { "type": "string" },
                            "last_edited_time": { "type": "string" }
                        },
                        "required": ["data_source", "page_id", "last_edited_time"]
                    }
                }
            },
            "required": ["data"]
        })
    }
}

/// Stale items grouped per source for one agent batch request.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceBatch {
    pub source: String,
    pub page_ids: Vec<String>,
}

/// Group context items by source system, preserving first-seen order of
/// sources and of page ids within each source.
pub fn group_by_source(items: &[ContextItem]) -> Vec<SourceBatch> {
    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, Vec<String>> = HashMap::new();

    for item in items {
        let ids = grouped.entry(item.source.clone()).or_insert_with(|| {
            order.push(item.source.clone());
            Vec::new()
        });
        if !ids.contains(&item.page_id) {
            ids.push(item.page_id.clone());
        }
    }

    order
        .into_iter()
        .map(|source| {
            let page_ids = grouped.remove(&source).unwrap_or_default();
            SourceBatch { source, page_ids }
        })
        .collect()
}
