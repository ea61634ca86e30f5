//! Error types for the Grounded pipeline core.
//!
//! Uses `thiserror` for public API error types, with one enum per external
//! collaborator (model, store, source, agent, config) and a stage-tagged
//! wrapper for pipeline failures. Every pipeline-stage failure is fatal to
//! the run; the caller translates tagged errors into transport responses.

use crate::pipeline::StageId;

/// Top-level error type for the Grounded core library.
#[derive(Debug, thiserror::Error)]
pub enum GroundedError {
    #[error("Model error: {0}")]
    Llm(#[from] LlmError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from generative and embedding model calls.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Structured output did not match schema: {message}")]
    SchemaDecode { message: String },

    #[error("Streaming error: {message}")]
    Streaming { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
}

/// Errors from context store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store connection failed: {message}")]
    Connection { message: String },

    #[error("Store operation '{op}' failed: {message}")]
    Operation { op: String, message: String },

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Errors from external source systems (page fetch, metadata lookup).
///
/// The original error text from the source API is carried for diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Source '{system}' API request failed: {message}")]
    ApiRequest { system: String, message: String },

    #[error("Page '{page_id}' not found in source '{system}'")]
    NotFound { system: String, page_id: String },

    #[error("Permission denied by source '{system}': {message}")]
    PermissionDenied { system: String, message: String },

    #[error("No connector registered for source '{system}'")]
    UnknownSource { system: String },

    #[error("Unexpected source URL format: {url}")]
    InvalidUrl { url: String },
}

/// Errors from the freshness-check agent session.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent session failed: {message}")]
    Session { message: String },

    #[error("Tool '{name}' call failed: {message}")]
    ToolCall { name: String, message: String },

    #[error("Maximum iterations ({max}) reached without a freshness report")]
    MaxIterationsReached { max: usize },

    #[error("Malformed freshness report: {message}")]
    MalformedReport { message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid distance metric '{value}' (expected cosine, dot, euclid, or manhattan)")]
    InvalidDistanceMetric { value: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// A pipeline failure tagged with the stage that produced it.
///
/// Stages wrap every external call and re-raise as a `StageError` carrying
/// the stage identifier and the original cause; no stage retries.
#[derive(Debug, thiserror::Error)]
#[error("Stage '{stage}' failed: {source}")]
pub struct StageError {
    /// The stage that produced the failure.
    pub stage: StageId,
    /// The underlying cause.
    #[source]
    pub source: GroundedError,
}

impl StageError {
    /// Tag an underlying error with its originating stage.
    pub fn new(stage: StageId, source: impl Into<GroundedError>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }
}

/// A type alias for results using the top-level `GroundedError`.
pub type Result<T> = std::result::Result<T, GroundedError>;
