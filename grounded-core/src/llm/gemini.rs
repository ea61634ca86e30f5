//! Google Gemini API client implementation.
//!
//! Implements the `LanguageModel` trait against the native Gemini REST API.
//!
//! Notable API properties:
//! - Auth via `?key=API_KEY` query parameter
//! - System instruction is a top-level `system_instruction` field
//! - Roles are `"user"` / `"model"` (not `"assistant"`)
//! - Tool calls use `functionCall` / `functionResponse` content parts
//! - Streaming uses the `:streamGenerateContent` endpoint with `?alt=sse`
//! - Structured output via `generationConfig.responseMimeType` + `responseSchema`
//! - Embeddings via `:embedContent` with a `taskType` (query vs. document)

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::LanguageModel;
use crate::types::{
    CompletionRequest, CompletionResponse, Content, EmbeddingTask, Message, Role, StreamEvent,
    ToolCall,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

/// The default Google Gemini API base URL.
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Google Gemini API client.
///
/// Supports full and streaming completions, schema-constrained structured
/// output, and task-typed embeddings.
pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    lite_model: String,
    embedding_model: String,
    max_output_tokens: usize,
    temperature: f32,
}

impl GeminiClient {
    /// Create a new client from configuration.
    ///
    /// Reads the API key from the environment variable named in
    /// `config.api_key_env`; returns `LlmError::AuthFailed` if unset.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| LlmError::AuthFailed {
            provider: format!("Gemini (env var '{}' not set)", config.api_key_env),
        })?;
        Self::new_with_key(config, api_key)
    }

    /// Create a new client with an explicitly provided API key.
    pub fn new_with_key(config: &LlmConfig, api_key: String) -> Result<Self, LlmError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| LlmError::ApiRequest {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url,
            api_key,
            model: config.model.clone(),
            lite_model: config.lite_model.clone(),
            embedding_model: config.embedding_model.clone(),
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
        })
    }

    /// The lighter model used for rewrite and routing calls.
    pub fn lite_model(&self) -> &str {
        &self.lite_model
    }

    /// Build the JSON request body for a Gemini generate call.
    ///
    /// Extracts system messages into the top-level `system_instruction`
    /// field; converts everything else to Gemini `contents`. When a
    /// `schema` is given, constrains the response to JSON output.
    fn build_request_body(&self, request: &CompletionRequest, schema: Option<&Value>) -> Value {
        let max_tokens = request.max_tokens.unwrap_or(self.max_output_tokens);

        let (system_text, non_system) = Self::extract_system_instruction(&request.messages);
        let raw_contents: Vec<Value> = non_system.iter().map(|m| Self::message_json(m)).collect();
        let contents = Self::merge_consecutive_turns(raw_contents);

        let mut body = serde_json::json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": max_tokens,
                "temperature": request.temperature,
            },
        });

        if let Some(system) = &system_text {
            body["system_instruction"] = serde_json::json!({
                "parts": [{"text": system}]
            });
        }

        if let Some(schema) = schema {
            body["generationConfig"]["responseMimeType"] = Value::String("application/json".into());
            body["generationConfig"]["responseSchema"] = schema.clone();
        }

        if let Some(tools) = &request.tools {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|tool| {
                    serde_json::json!({
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    })
                })
                .collect();
            body["tools"] = serde_json::json!([{ "functionDeclarations": declarations }]);
        }

        body
    }

    /// Extract system messages, returning (concatenated text, the rest).
    fn extract_system_instruction(messages: &[Message]) -> (Option<String>, Vec<&Message>) {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut non_system: Vec<&Message> = Vec::new();

        for msg in messages {
            if msg.role == Role::System {
                if let Some(text) = msg.content.as_text() {
                    system_parts.push(text);
                }
            } else {
                non_system.push(msg);
            }
        }

        let system_text = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };

        (system_text, non_system)
    }

    /// Convert a single `Message` to Gemini JSON format.
    ///
    /// `User` / `Tool` map to `"user"`, `Assistant` maps to `"model"`.
    fn message_json(msg: &Message) -> Value {
        let role = match msg.role {
            Role::User | Role::Tool => "user",
            Role::Assistant => "model",
            Role::System => "user", // unreachable after extraction
        };

        let parts = match &msg.content {
            Content::Text { text } => serde_json::json!([{"text": text}]),
            Content::ToolCall {
                name, arguments, ..
            } => serde_json::json!([{
                "functionCall": { "name": name, "args": arguments }
            }]),
            Content::ToolResult { output, .. } => {
                // Gemini requires the response field to be an object.
                let response_value = match serde_json::from_str::<Value>(output) {
                    Ok(Value::Object(map)) => Value::Object(map),
                    Ok(other) => serde_json::json!({"result": other}),
                    Err(_) => serde_json::json!({"result": output}),
                };
                serde_json::json!([{
                    "functionResponse": { "name": "tool", "response": response_value }
                }])
            }
        };

        serde_json::json!({ "role": role, "parts": parts })
    }

    /// Merge consecutive same-role turns; Gemini rejects histories where
    /// two entries of the same role follow each other (e.g., an assistant
    /// tool call split from its sibling calls, or stacked tool results).
    fn merge_consecutive_turns(contents: Vec<Value>) -> Vec<Value> {
        let mut merged: Vec<Value> = Vec::with_capacity(contents.len());
        for entry in contents {
            let role = entry["role"].as_str().unwrap_or("").to_string();
            let same_role = merged
                .last()
                .is_some_and(|last| last["role"].as_str().unwrap_or("") == role);

            if same_role {
                let last = merged.last_mut().unwrap();
                if let (Some(existing), Some(new)) =
                    (last["parts"].as_array().cloned(), entry["parts"].as_array())
                {
                    let mut combined = existing;
                    combined.extend(new.iter().cloned());
                    last["parts"] = Value::Array(combined);
                }
            } else {
                merged.push(entry);
            }
        }
        merged
    }

    /// Parse a Gemini generate response into a `CompletionResponse`.
    fn parse_response(body: &Value) -> Result<CompletionResponse, LlmError> {
        let candidates = body["candidates"]
            .as_array()
            .ok_or_else(|| LlmError::ResponseParse {
                message: "Missing 'candidates' array in response".to_string(),
            })?;

        let candidate = candidates.first().ok_or_else(|| LlmError::ResponseParse {
            message: "Empty 'candidates' array in response".to_string(),
        })?;

        let parts = candidate["content"]["parts"]
            .as_array()
            .ok_or_else(|| LlmError::ResponseParse {
                message: "Missing 'parts' array in candidate content".to_string(),
            })?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for part in parts {
            if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                text.push_str(t);
            } else if let Some(fc) = part.get("functionCall") {
                tool_calls.push(ToolCall {
                    id: format!("gemini_call_{}", uuid::Uuid::new_v4()),
                    name: fc["name"].as_str().unwrap_or("").to_string(),
                    arguments: fc["args"].clone(),
                });
            } else {
                debug!(?part, "Ignoring unknown Gemini part type");
            }
        }

        let finish_reason = candidate["finishReason"].as_str().map(|s| s.to_string());
        let model = body["modelVersion"]
            .as_str()
            .unwrap_or("gemini")
            .to_string();

        Ok(CompletionResponse {
            message: Message::assistant(text),
            tool_calls,
            model,
            finish_reason,
        })
    }

    /// Map an HTTP status code to the appropriate `LlmError`.
    fn map_http_error(status: reqwest::StatusCode, body_text: &str) -> LlmError {
        match status.as_u16() {
            401 | 403 => LlmError::AuthFailed {
                provider: "Gemini".to_string(),
            },
            429 => LlmError::RateLimited {
                retry_after_secs: 30,
            },
            _ => LlmError::ApiRequest {
                message: format!("HTTP {} from Gemini API: {}", status, body_text),
            },
        }
    }

    /// Build the endpoint URL for a Gemini API call.
    fn endpoint_url(&self, model: &str, method: &str) -> String {
        format!(
            "{}/models/{}:{}?key={}",
            self.base_url, model, method, self.api_key
        )
    }

    /// Send a generate request and parse the response.
    async fn generate(
        &self,
        request: &CompletionRequest,
        schema: Option<&Value>,
    ) -> Result<CompletionResponse, LlmError> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let body = self.build_request_body(request, schema);
        let url = self.endpoint_url(model, "generateContent");

        debug!(model, structured = schema.is_some(), "Sending Gemini completion request");

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::ApiRequest {
                message: format!("Request to Gemini API failed: {}", e),
            })?;

        let status = response.status();
        let body_text = response.text().await.map_err(|e| LlmError::ResponseParse {
            message: format!("Failed to read response body: {}", e),
        })?;

        if !status.is_success() {
            return Err(Self::map_http_error(status, &body_text));
        }

        let response_json: Value =
            serde_json::from_str(&body_text).map_err(|e| LlmError::ResponseParse {
                message: format!("Invalid JSON in response: {}", e),
            })?;

        Self::parse_response(&response_json)
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.generate(&request, None).await
    }

    /// Perform a streaming completion via `:streamGenerateContent?alt=sse`,
    /// forwarding text fragments in arrival order.
    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), LlmError> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let body = self.build_request_body(&request, None);
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, model, self.api_key
        );

        debug!(model, "Sending Gemini streaming request");

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::ApiRequest {
                message: format!("Streaming request to Gemini API failed: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(Self::map_http_error(status, &body_text));
        }

        let mut byte_stream = response.bytes_stream();
        let mut line_buffer = String::new();

        while let Some(chunk_result) = byte_stream.next().await {
            let chunk = chunk_result.map_err(|e| LlmError::Streaming {
                message: format!("Failed to read streaming chunk: {}", e),
            })?;

            line_buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Process complete SSE lines from the buffer.
            while let Some(newline_pos) = line_buffer.find('\n') {
                let line = line_buffer[..newline_pos].trim().to_string();
                line_buffer.drain(..=newline_pos);

                if line.is_empty() || line.starts_with("event:") {
                    continue;
                }
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    continue;
                }

                let parsed: Value =
                    serde_json::from_str(data).map_err(|e| LlmError::Streaming {
                        message: format!("Invalid JSON in SSE chunk: {}", e),
                    })?;

                if let Some(parts) = parsed["candidates"][0]["content"]["parts"].as_array() {
                    for part in parts {
                        if let Some(text) = part.get("text").and_then(|t| t.as_str())
                            && !text.is_empty()
                        {
                            let _ = tx.send(StreamEvent::Token(text.to_string())).await;
                        }
                    }
                }
            }
        }

        let _ = tx.send(StreamEvent::Done).await;
        Ok(())
    }

    /// Perform a schema-constrained completion and return the decoded
    /// JSON value. A response that is not valid JSON for the schema is a
    /// `SchemaDecode` error, distinct from transport failures.
    async fn complete_structured(
        &self,
        request: CompletionRequest,
        schema: Value,
    ) -> Result<Value, LlmError> {
        let response = self.generate(&request, Some(&schema)).await?;
        let text = response
            .message
            .content
            .as_text()
            .unwrap_or_default()
            .to_string();

        serde_json::from_str(&text).map_err(|e| LlmError::SchemaDecode {
            message: format!("Model output is not valid JSON: {}", e),
        })
    }

    /// Generate an embedding via `:embedContent` with the given task type.
    async fn embed(&self, text: &str, task: EmbeddingTask) -> Result<Vec<f32>, LlmError> {
        let url = self.endpoint_url(&self.embedding_model, "embedContent");
        let body = serde_json::json!({
            "content": { "parts": [{ "text": text }] },
            "taskType": task.as_str(),
        });

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::ApiRequest {
                message: format!("Embedding request to Gemini API failed: {}", e),
            })?;

        let status = response.status();
        let body_text = response.text().await.map_err(|e| LlmError::ResponseParse {
            message: format!("Failed to read response body: {}", e),
        })?;

        if !status.is_success() {
            return Err(Self::map_http_error(status, &body_text));
        }

        let parsed: Value = serde_json::from_str(&body_text).map_err(|e| {
            LlmError::ResponseParse {
                message: format!("Invalid JSON in embedding response: {}", e),
            }
        })?;

        let values = parsed["embedding"]["values"]
            .as_array()
            .ok_or_else(|| LlmError::ResponseParse {
                message: "Missing 'embedding.values' in response".to_string(),
            })?;

        values
            .iter()
            .map(|v| {
                v.as_f64().map(|f| f as f32).ok_or_else(|| {
                    LlmError::ResponseParse {
                        message: "Non-numeric embedding value".to_string(),
                    }
                })
            })
            .collect()
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
