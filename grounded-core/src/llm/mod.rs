//! Language model abstraction.
//!
//! Defines the `LanguageModel` trait for model-agnostic generative and
//! embedding calls, a typed decode helper for schema-constrained outputs,
//! and a queued-response mock used across the test suites.

pub mod gemini;

pub use gemini::GeminiClient;

use crate::error::LlmError;
use crate::types::{
    CompletionRequest, CompletionResponse, EmbeddingTask, Message, StreamEvent,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

/// Trait for language model clients, covering the three call shapes the
/// pipeline uses: full completion, streaming completion, and
/// schema-constrained structured output — plus task-typed embeddings.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Perform a full completion and return the response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Perform a streaming completion, sending events to the channel in
    /// the order the model produces them.
    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), LlmError>;

    /// Perform a completion constrained to the given JSON schema and
    /// return the raw JSON value.
    async fn complete_structured(
        &self,
        request: CompletionRequest,
        schema: serde_json::Value,
    ) -> Result<serde_json::Value, LlmError>;

    /// Generate an embedding for the text under the given task type.
    async fn embed(&self, text: &str, task: EmbeddingTask) -> Result<Vec<f32>, LlmError>;

    /// Return the default model name.
    fn model_name(&self) -> &str;
}

/// Run a schema-constrained completion and decode the result into `T`.
///
/// A decode failure is a `SchemaDecode` error — a distinct kind from the
/// network failures `complete_structured` itself may return; both are
/// fatal at the calling stage.
pub async fn structured<T: DeserializeOwned>(
    model: &dyn LanguageModel,
    request: CompletionRequest,
    schema: serde_json::Value,
) -> Result<T, LlmError> {
    let value = model.complete_structured(request, schema).await?;
    serde_json::from_value(value).map_err(|e| LlmError::SchemaDecode {
        message: e.to_string(),
    })
}

/// A mock language model with queued responses, for tests.
///
/// Each call shape pops from its own queue; an injected error fails the
/// next call of any shape.
pub struct MockLanguageModel {
    model: String,
    responses: std::sync::Mutex<Vec<CompletionResponse>>,
    structured: std::sync::Mutex<Vec<serde_json::Value>>,
    embeddings: std::sync::Mutex<Vec<Vec<f32>>>,
    streams: std::sync::Mutex<Vec<Vec<String>>>,
    fail_next: std::sync::Mutex<Option<LlmError>>,
}

impl MockLanguageModel {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            responses: std::sync::Mutex::new(Vec::new()),
            structured: std::sync::Mutex::new(Vec::new()),
            embeddings: std::sync::Mutex::new(Vec::new()),
            streams: std::sync::Mutex::new(Vec::new()),
            fail_next: std::sync::Mutex::new(None),
        }
    }

    /// Queue a full-completion response.
    pub fn queue_text(&self, text: &str) {
        self.responses.lock().unwrap().push(CompletionResponse {
            message: Message::assistant(text),
            tool_calls: Vec::new(),
            model: self.model.clone(),
            finish_reason: Some("stop".to_string()),
        });
    }

    /// Queue a response requesting a single tool call.
    pub fn queue_tool_call(&self, name: &str, arguments: serde_json::Value) {
        let id = format!("call_{}", uuid::Uuid::new_v4());
        self.responses.lock().unwrap().push(CompletionResponse {
            message: Message::assistant(""),
            tool_calls: vec![crate::types::ToolCall {
                id,
                name: name.to_string(),
                arguments,
            }],
            model: self.model.clone(),
            finish_reason: Some("tool_calls".to_string()),
        });
    }

    /// Queue a structured-output value.
    pub fn queue_structured(&self, value: serde_json::Value) {
        self.structured.lock().unwrap().push(value);
    }

    /// Queue an embedding vector.
    pub fn queue_embedding(&self, vector: Vec<f32>) {
        self.embeddings.lock().unwrap().push(vector);
    }

    /// Queue an ordered fragment sequence for the next streaming call.
    pub fn queue_stream(&self, fragments: Vec<&str>) {
        self.streams
            .lock()
            .unwrap()
            .push(fragments.into_iter().map(String::from).collect());
    }

    /// Fail the next call of any shape with the given error.
    pub fn fail_next(&self, err: LlmError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    fn take_failure(&self) -> Option<LlmError> {
        self.fail_next.lock().unwrap().take()
    }
}

impl Default for MockLanguageModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageModel for MockLanguageModel {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(CompletionResponse {
                message: Message::assistant("mock response"),
                tool_calls: Vec::new(),
                model: self.model.clone(),
                finish_reason: Some("stop".to_string()),
            })
        } else {
            Ok(responses.remove(0))
        }
    }

    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), LlmError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let queued = {
            let mut streams = self.streams.lock().unwrap();
            if streams.is_empty() {
                None
            } else {
                Some(streams.remove(0))
            }
        };
        match queued {
            Some(fragments) => {
                for fragment in fragments {
                    let _ = tx.send(StreamEvent::Token(fragment)).await;
                }
            }
            None => {
                // Fall back to word-splitting the next full response.
                let response = self.complete(request).await?;
                if let Some(text) = response.message.content.as_text() {
                    for word in text.split_whitespace() {
                        let _ = tx.send(StreamEvent::Token(format!("{} ", word))).await;
                    }
                }
            }
        }
        let _ = tx.send(StreamEvent::Done).await;
        Ok(())
    }

    async fn complete_structured(
        &self,
        _request: CompletionRequest,
        _schema: serde_json::Value,
    ) -> Result<serde_json::Value, LlmError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let mut structured = self.structured.lock().unwrap();
        if structured.is_empty() {
            Err(LlmError::ResponseParse {
                message: "no structured response queued".to_string(),
            })
        } else {
            Ok(structured.remove(0))
        }
    }

    async fn embed(&self, _text: &str, _task: EmbeddingTask) -> Result<Vec<f32>, LlmError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let mut embeddings = self.embeddings.lock().unwrap();
        if embeddings.is_empty() {
            Ok(vec![0.0; 8])
        } else {
            Ok(embeddings.remove(0))
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RefinedQuestion;

    #[tokio::test]
    async fn test_mock_queued_responses_in_order() {
        let model = MockLanguageModel::new();
        model.queue_text("first");
        model.queue_text("second");

        let r1 = model.complete(CompletionRequest::default()).await.unwrap();
        assert_eq!(r1.message.content.as_text(), Some("first"));
        let r2 = model.complete(CompletionRequest::default()).await.unwrap();
        assert_eq!(r2.message.content.as_text(), Some("second"));
    }

    #[tokio::test]
    async fn test_structured_decode() {
        let model = MockLanguageModel::new();
        model.queue_structured(serde_json::json!({"rewritten_question": "What is Rust?"}));

        let out: RefinedQuestion = structured(
            &model,
            CompletionRequest::default(),
            RefinedQuestion::schema(),
        )
        .await
        .unwrap();
        assert_eq!(out.rewritten_question, "What is Rust?");
    }

    #[tokio::test]
    async fn test_structured_decode_failure_is_schema_kind() {
        let model = MockLanguageModel::new();
        model.queue_structured(serde_json::json!({"unexpected": true}));

        let err = structured::<RefinedQuestion>(
            &model,
            CompletionRequest::default(),
            RefinedQuestion::schema(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LlmError::SchemaDecode { .. }));
    }

    #[tokio::test]
    async fn test_mock_streaming_preserves_fragment_order() {
        let model = MockLanguageModel::new();
        model.queue_stream(vec!["Hel", "lo ", "world"]);

        let (tx, mut rx) = mpsc::channel(16);
        model
            .complete_streaming(CompletionRequest::default(), tx)
            .await
            .unwrap();

        let mut out = String::new();
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Token(t) => out.push_str(&t),
                StreamEvent::Done => break,
                StreamEvent::Error(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(out, "Hello world");
    }

    #[tokio::test]
    async fn test_injected_failure_applies_once() {
        let model = MockLanguageModel::new();
        model.queue_text("after failure");
        model.fail_next(LlmError::ApiRequest {
            message: "boom".into(),
        });

        assert!(model.complete(CompletionRequest::default()).await.is_err());
        let ok = model.complete(CompletionRequest::default()).await.unwrap();
        assert_eq!(ok.message.content.as_text(), Some("after failure"));
    }
}
