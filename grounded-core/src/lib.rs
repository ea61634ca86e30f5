//! # Grounded Core
//!
//! Core library for the Grounded retrieval-augmented chat backend.
//! Provides the six-stage answer pipeline, the language model and
//! context store clients, the Notion source connector, the
//! freshness-check agent, and the ingestion path.

pub mod chunk;
pub mod config;
pub mod error;
pub mod freshness;
pub mod ingest;
pub mod llm;
pub mod pipeline;
pub mod prompts;
pub mod source;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root.
pub use chunk::Chunker;
pub use config::{GroundedConfig, load_config};
pub use error::{GroundedError, Result, StageError};
pub use freshness::{FreshnessAgent, PageMetadataTool, ToolSessionAgent};
pub use ingest::Ingestor;
pub use llm::{GeminiClient, LanguageModel, MockLanguageModel};
pub use pipeline::{Pipeline, PipelineOptions, PipelineState, Route, RunRequest, StageId};
pub use source::{ConnectorRegistry, NotionConnector, SourceConnector};
pub use store::{ContextStore, MemoryStore, QdrantStore};
pub use types::{
    CompletionRequest, CompletionResponse, Content, ContextItem, EmbeddingTask, Message, Role,
    StreamEvent, ToolDefinition,
};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Set up tracing for embedding hosts: human-readable stderr, filtered
/// by `RUST_LOG` with the given default.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .try_init();
}
