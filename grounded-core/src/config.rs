//! Configuration system for Grounded.
//!
//! Uses `figment` for layered configuration: defaults -> config file ->
//! environment. Configuration is loaded from `~/.config/grounded/config.toml`
//! and/or `.grounded/config.toml` in the workspace directory, then overlaid
//! with `GROUNDED_`-prefixed environment variables.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// Top-level configuration for the Grounded pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroundedConfig {
    pub llm: LlmConfig,
    pub store: StoreConfig,
    pub notion: NotionConfig,
    pub chunking: ChunkingConfig,
    pub freshness: FreshnessConfig,
}

/// Configuration for the generative/embedding model client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model identifier used for answer generation.
    pub model: String,
    /// Lighter model used for the rewrite and routing calls.
    pub lite_model: String,
    /// Model identifier used for embeddings.
    pub embedding_model: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// Optional base URL override for the API endpoint.
    pub base_url: Option<String>,
    /// Maximum tokens to generate in a response.
    pub max_output_tokens: usize,
    /// Default temperature for generation.
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".into(),
            lite_model: "gemini-2.0-flash-lite".into(),
            embedding_model: "gemini-embedding-001".into(),
            api_key_env: "GEMINI_API_KEY".into(),
            base_url: None,
            max_output_tokens: 8192,
            temperature: 0.0,
        }
    }
}

/// The distance metric used by the context store collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    Cosine,
    Dot,
    Euclid,
    Manhattan,
}

impl std::str::FromStr for DistanceMetric {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "dot" => Ok(DistanceMetric::Dot),
            "euclid" => Ok(DistanceMetric::Euclid),
            "manhattan" => Ok(DistanceMetric::Manhattan),
            other => Err(ConfigError::InvalidDistanceMetric {
                value: other.to_string(),
            }),
        }
    }
}

/// Configuration for the vector context store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Qdrant server URL.
    pub url: String,
    /// Collection name; created lazily at process start if absent.
    pub collection: String,
    /// Fixed vector dimensionality for the collection.
    pub vector_size: usize,
    /// Distance metric; parse failure at configuration time is startup-fatal.
    pub distance_metric: String,
    /// Default result bound applied when a query does not specify one.
    pub default_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".into(),
            collection: "grounded_documents".into(),
            vector_size: 3072,
            distance_metric: "cosine".into(),
            default_limit: 10,
        }
    }
}

impl StoreConfig {
    /// Parse the configured metric string. An unrecognized value is a
    /// startup-fatal configuration error.
    pub fn metric(&self) -> Result<DistanceMetric, ConfigError> {
        self.distance_metric.parse()
    }
}

/// Configuration for the Notion source connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotionConfig {
    /// Environment variable name containing the integration token.
    pub api_key_env: String,
    /// Optional base URL override for the Notion API.
    pub base_url: Option<String>,
}

impl Default for NotionConfig {
    fn default() -> Self {
        Self {
            api_key_env: "NOTION_API_KEY".into(),
            base_url: None,
        }
    }
}

/// Configuration for the sliding-window chunker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Maximum chunk size in characters.
    pub chunk_size: usize,
    /// Overlap carried between adjacent chunks, in characters.
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

/// Configuration for the freshness-check agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreshnessConfig {
    /// Cap on tool-call round trips before the session is abandoned.
    pub max_iterations: usize,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self { max_iterations: 8 }
    }
}

impl GroundedConfig {
    /// Validate startup-fatal constraints: metric string, vector size,
    /// chunker window.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.metric()?;
        if self.store.vector_size == 0 {
            return Err(ConfigError::Invalid {
                message: "store.vector_size must be non-zero".into(),
            });
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(ConfigError::Invalid {
                message: "chunking.chunk_overlap must be smaller than chunking.chunk_size".into(),
            });
        }
        Ok(())
    }

    /// Resolve an API key from the environment variable named in config.
    pub fn resolve_api_key(var: &str) -> Result<String, ConfigError> {
        std::env::var(var).map_err(|_| ConfigError::EnvVarMissing {
            var: var.to_string(),
        })
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `GROUNDED_`)
/// 2. Workspace-local config (`.grounded/config.toml`)
/// 3. User config (`~/.config/grounded/config.toml`)
/// 4. Built-in defaults
pub fn load_config(workspace: Option<&Path>) -> Result<GroundedConfig, ConfigError> {
    // Pull in a .env file when present, for the API key variables.
    dotenvy::dotenv().ok();

    let mut figment = Figment::from(Serialized::defaults(GroundedConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "grounded", "grounded") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".grounded").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // GROUNDED_LLM__MODEL, GROUNDED_STORE__DISTANCE_METRIC, etc.
    figment = figment.merge(Env::prefixed("GROUNDED_").split("__"));

    let config: GroundedConfig = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config_is_valid() {
        let config = GroundedConfig::default();
        config.validate().unwrap();
        assert_eq!(config.store.metric().unwrap(), DistanceMetric::Cosine);
    }

    #[test]
    fn test_all_metric_names_parse() {
        for (name, expected) in [
            ("cosine", DistanceMetric::Cosine),
            ("dot", DistanceMetric::Dot),
            ("euclid", DistanceMetric::Euclid),
            ("manhattan", DistanceMetric::Manhattan),
            ("COSINE", DistanceMetric::Cosine),
        ] {
            assert_eq!(name.parse::<DistanceMetric>().unwrap(), expected);
        }
    }

    #[test]
    fn test_invalid_metric_is_startup_fatal() {
        let mut config = GroundedConfig::default();
        config.store.distance_metric = "hamming".into();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidDistanceMetric { value } if value == "hamming"
        ));
    }

    #[test]
    fn test_workspace_config_overrides_defaults() {
        let workspace = tempfile::tempdir().unwrap();
        let config_dir = workspace.path().join(".grounded");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.toml"),
            "[store]\ncollection = \"custom_docs\"\ndistance_metric = \"dot\"\n",
        )
        .unwrap();

        let config = load_config(Some(workspace.path())).unwrap();
        assert_eq!(config.store.collection, "custom_docs");
        assert_eq!(config.store.metric().unwrap(), DistanceMetric::Dot);
        // Untouched sections keep their defaults.
        assert_eq!(config.llm.model, "gemini-2.0-flash");
    }

    #[test]
    fn test_overlap_must_fit_window() {
        let mut config = GroundedConfig::default();
        config.chunking.chunk_size = 100;
        config.chunking.chunk_overlap = 100;
        assert!(config.validate().is_err());
    }
}
