//! Freshness-check agent.
//!
//! Given the stale-candidate pages grouped by source, the agent runs a
//! bounded tool-calling session against the model: it exposes one live
//! metadata tool per source, executes the calls the model makes, and
//! finally decodes a structured report of live last-edited times. The
//! pipeline compares those against cached timestamps by string identity.

use crate::error::{AgentError, SourceError};
use crate::llm::{LanguageModel, structured};
use crate::prompts;
use crate::types::{
    CompletionRequest, Content, FreshnessRecord, FreshnessReport, Message, Role, SourceBatch,
    ToolDefinition,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A per-source tool the agent can call for live page metadata.
#[async_trait]
pub trait PageMetadataTool: Send + Sync {
    /// The source system this tool covers.
    fn source(&self) -> &str;

    /// Tool definition advertised to the model.
    fn definition(&self) -> ToolDefinition;

    /// Execute a lookup with the model-provided arguments.
    async fn call(&self, arguments: &Value) -> Result<Vec<FreshnessRecord>, SourceError>;
}

/// Trait over the freshness-check step, seam for tests.
#[async_trait]
pub trait FreshnessAgent: Send + Sync {
    /// Resolve live timestamps for the given batches of pages.
    async fn live_timestamps(
        &self,
        batches: &[SourceBatch],
    ) -> Result<Vec<FreshnessRecord>, AgentError>;
}

/// Tool-calling agent session over a language model.
pub struct ToolSessionAgent {
    llm: Arc<dyn LanguageModel>,
    tools: HashMap<String, Arc<dyn PageMetadataTool>>,
    max_iterations: usize,
}

impl ToolSessionAgent {
    pub fn new(llm: Arc<dyn LanguageModel>, max_iterations: usize) -> Self {
        Self {
            llm,
            tools: HashMap::new(),
            max_iterations,
        }
    }

    /// Register a tool under its definition name.
    pub fn register_tool(&mut self, tool: Arc<dyn PageMetadataTool>) {
        self.tools.insert(tool.definition().name, tool);
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    /// Execute one model-requested tool call, returning the result as a
    /// tool message. Tool failures go back to the model as error results
    /// instead of aborting the session.
    async fn execute_call(
        &self,
        call_id: &str,
        name: &str,
        arguments: &Value,
    ) -> Message {
        let Some(tool) = self.tools.get(name) else {
            warn!(tool = %name, "Model requested an unknown tool");
            return Message::tool_result(call_id, format!("unknown tool '{}'", name), true);
        };

        match tool.call(arguments).await {
            Ok(records) => {
                let output =
                    serde_json::to_string(&records).unwrap_or_else(|_| "[]".to_string());
                Message::tool_result(call_id, output, false)
            }
            Err(err) => {
                warn!(tool = %name, error = %err, "Tool call failed");
                Message::tool_result(call_id, err.to_string(), true)
            }
        }
    }
}

#[async_trait]
impl FreshnessAgent for ToolSessionAgent {
    async fn live_timestamps(
        &self,
        batches: &[SourceBatch],
    ) -> Result<Vec<FreshnessRecord>, AgentError> {
        let mut messages = vec![
            Message::system(prompts::freshness_agent_system()),
            Message::user(prompts::freshness_batch(batches)),
        ];
        let definitions = self.definitions();

        for iteration in 0..self.max_iterations {
            let mut request = CompletionRequest::from_messages(messages.clone());
            request.tools = Some(definitions.clone());

            let response = self
                .llm
                .complete(request)
                .await
                .map_err(|e| AgentError::Session {
                    message: e.to_string(),
                })?;

            if response.tool_calls.is_empty() {
                // The model is done looking things up; decode the report.
                debug!(iteration, "Agent session complete, requesting report");
                messages.push(response.message);
                messages.push(Message::user(
                    "Report the last edited time of every page you looked up.",
                ));

                let report: FreshnessReport = structured(
                    self.llm.as_ref(),
                    CompletionRequest::from_messages(messages),
                    FreshnessReport::schema(),
                )
                .await
                .map_err(|e| AgentError::MalformedReport {
                    message: e.to_string(),
                })?;
                return Ok(report.data);
            }

            debug!(
                iteration,
                calls = response.tool_calls.len(),
                "Executing tool calls"
            );
            for call in &response.tool_calls {
                messages.push(Message::new(
                    Role::Assistant,
                    Content::ToolCall {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                ));
                let result = self.execute_call(&call.id, &call.name, &call.arguments).await;
                messages.push(result);
            }
        }

        Err(AgentError::MaxIterationsReached {
            max: self.max_iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLanguageModel;
    use pretty_assertions::assert_eq;

    struct FixedTool {
        records: Vec<FreshnessRecord>,
    }

    #[async_trait]
    impl PageMetadataTool for FixedTool {
        fn source(&self) -> &str {
            "notion"
        }

        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "notion_page_metadata".into(),
                description: "test tool".into(),
                parameters: serde_json::json!({"type": "object"}),
            }
        }

        async fn call(&self, _arguments: &Value) -> Result<Vec<FreshnessRecord>, SourceError> {
            Ok(self.records.clone())
        }
    }

    fn record(page_id: &str, ts: &str) -> FreshnessRecord {
        FreshnessRecord {
            data_source: "notion".into(),
            page_id: page_id.into(),
            last_edited_time: ts.into(),
        }
    }

    fn batches() -> Vec<SourceBatch> {
        vec![SourceBatch {
            source: "notion".into(),
            page_ids: vec!["p1".into()],
        }]
    }

    #[tokio::test]
    async fn test_session_executes_tool_then_reports() {
        let llm = Arc::new(MockLanguageModel::new());
        llm.queue_tool_call(
            "notion_page_metadata",
            serde_json::json!({"page_ids": ["p1"]}),
        );
        llm.queue_text("Looked up all pages.");
        llm.queue_structured(serde_json::json!({
            "data": [{
                "data_source": "notion",
                "page_id": "p1",
                "last_edited_time": "2024-06-02T00:00:00.000Z"
            }]
        }));

        let mut agent = ToolSessionAgent::new(llm, 4);
        agent.register_tool(Arc::new(FixedTool {
            records: vec![record("p1", "2024-06-02T00:00:00.000Z")],
        }));

        let records = agent.live_timestamps(&batches()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].page_id, "p1");
        assert_eq!(records[0].last_edited_time, "2024-06-02T00:00:00.000Z");
    }

    #[tokio::test]
    async fn test_session_without_tool_calls_goes_straight_to_report() {
        let llm = Arc::new(MockLanguageModel::new());
        llm.queue_text("No lookups needed.");
        llm.queue_structured(serde_json::json!({ "data": [] }));

        let agent = ToolSessionAgent::new(llm, 4);
        let records = agent.live_timestamps(&batches()).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_runaway_session_hits_iteration_cap() {
        let llm = Arc::new(MockLanguageModel::new());
        for _ in 0..3 {
            llm.queue_tool_call(
                "notion_page_metadata",
                serde_json::json!({"page_ids": ["p1"]}),
            );
        }

        let mut agent = ToolSessionAgent::new(llm, 3);
        agent.register_tool(Arc::new(FixedTool { records: vec![] }));

        let err = agent.live_timestamps(&batches()).await.unwrap_err();
        assert!(matches!(err, AgentError::MaxIterationsReached { max: 3 }));
    }

    #[tokio::test]
    async fn test_malformed_report_is_tagged() {
        let llm = Arc::new(MockLanguageModel::new());
        llm.queue_text("done");
        llm.queue_structured(serde_json::json!({"wrong": true}));

        let agent = ToolSessionAgent::new(llm, 4);
        let err = agent.live_timestamps(&batches()).await.unwrap_err();
        assert!(matches!(err, AgentError::MalformedReport { .. }));
    }

    #[tokio::test]
    async fn test_unknown_tool_call_is_reported_back_not_fatal() {
        let llm = Arc::new(MockLanguageModel::new());
        llm.queue_tool_call("no_such_tool", serde_json::json!({}));
        llm.queue_text("ok");
        llm.queue_structured(serde_json::json!({ "data": [] }));

        let agent = ToolSessionAgent::new(llm, 4);
        let records = agent.live_timestamps(&batches()).await.unwrap();
        assert!(records.is_empty());
    }
}
