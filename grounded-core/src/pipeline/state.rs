//! Pipeline run state.
//!
//! One `PipelineState` per run; never shared across runs. Stages write
//! their outputs into it in order, and the finished state is handed back
//! to the caller alongside the streamed answer.

use crate::types::{ContextItem, Message};

/// Identifies the pipeline stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageId {
    Refine,
    Route,
    Retrieve,
    CheckFreshness,
    Refresh,
    Generate,
}

impl StageId {
    pub fn as_str(self) -> &'static str {
        match self {
            StageId::Refine => "refine_question",
            StageId::Route => "route_context",
            StageId::Retrieve => "retrieve_context",
            StageId::CheckFreshness => "check_freshness",
            StageId::Refresh => "refresh_context",
            StageId::Generate => "generate_answer",
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two-way fork taken after the routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    ContextRequired,
    ContextNotRequired,
}

/// Mutable state threaded through one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineState {
    /// Permission group of the requesting user; set once, read-only after.
    pub access_group: String,
    /// The conversation turns the run was invoked with.
    pub turns: Vec<Message>,
    /// Self-contained question produced by the refine stage.
    pub rewritten_question: String,
    /// Fork taken; `None` until the routing stage has run.
    pub route: Option<Route>,
    /// Retrieved context, overwritten by the freshness and refresh stages.
    pub context_items: Vec<ContextItem>,
    /// Items flagged outdated; consumed and cleared by the refresh stage.
    pub stale_items: Vec<ContextItem>,
    /// Final accumulated answer text.
    pub answer: String,
}

impl PipelineState {
    pub fn new(access_group: impl Into<String>, turns: Vec<Message>) -> Self {
        Self {
            access_group: access_group.into(),
            turns,
            rewritten_question: String::new(),
            route: None,
            context_items: Vec::new(),
            stale_items: Vec::new(),
            answer: String::new(),
        }
    }
}
