//! The answer pipeline.
//!
//! A six-stage conditionally-branching state machine: refine the
//! question, decide whether context is needed, and either go straight to
//! generation or retrieve context, check its freshness against the live
//! sources, refresh what is stale, and then generate. Stages run
//! strictly in order within a run; each run owns its state and every
//! external-call failure aborts the run tagged with its stage.

pub mod state;

pub use state::{PipelineState, Route, StageId};

use crate::error::{GroundedError, StageError};
use crate::freshness::FreshnessAgent;
use crate::llm::{LanguageModel, structured};
use crate::prompts;
use crate::source::{ConnectorRegistry, item_citation_url};
use crate::store::{ContextStore, MetadataFilter};
use crate::types::{
    CompletionRequest, ContextItem, EmbeddingTask, Message, RefinedQuestion, Role, RouteChoice,
    RouteDecision, StreamEvent, group_by_source,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// One conversation request into the pipeline.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Permission group of the requesting user.
    pub access_group: String,
    /// Ordered conversation turns; the last user turn is the question.
    pub turns: Vec<Message>,
}

/// Tuning knobs the pipeline reads from configuration.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Lighter model for the rewrite and routing calls; `None` uses the
    /// client default.
    pub lite_model: Option<String>,
    /// Result bound for the retrieval query.
    pub retrieval_limit: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            lite_model: None,
            retrieval_limit: 10,
        }
    }
}

/// The pipeline with its injected collaborators.
pub struct Pipeline {
    llm: Arc<dyn LanguageModel>,
    store: Arc<dyn ContextStore>,
    agent: Arc<dyn FreshnessAgent>,
    connectors: Arc<ConnectorRegistry>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        store: Arc<dyn ContextStore>,
        agent: Arc<dyn FreshnessAgent>,
        connectors: Arc<ConnectorRegistry>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            llm,
            store,
            agent,
            connectors,
            options,
        }
    }

    /// Execute one run, streaming the answer to `tx` as it arrives and
    /// returning the finished state.
    ///
    /// Cancellation is checked at stage boundaries; an in-flight external
    /// call is not aborted, but no further stage starts after the token
    /// trips. A closed `tx` stops delivery without failing the run.
    #[instrument(skip_all, fields(access_group = %request.access_group))]
    pub async fn run(
        &self,
        request: RunRequest,
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Result<PipelineState, StageError> {
        let mut state = PipelineState::new(request.access_group, request.turns);

        self.checkpoint(&cancel, StageId::Refine)?;
        state.rewritten_question = self
            .refine_question(&state)
            .await
            .map_err(|e| StageError::new(StageId::Refine, e))?;
        debug!(question = %state.rewritten_question, "Question refined");

        self.checkpoint(&cancel, StageId::Route)?;
        let route = self
            .decide_route(&state)
            .await
            .map_err(|e| StageError::new(StageId::Route, e))?;
        state.route = Some(route);
        info!(?route, "Routing decision made");

        // Exactly one branch runs per request.
        match route {
            Route::ContextNotRequired => {}
            Route::ContextRequired => {
                self.checkpoint(&cancel, StageId::Retrieve)?;
                state.context_items = self
                    .retrieve_context(&state)
                    .await
                    .map_err(|e| StageError::new(StageId::Retrieve, e))?;
                debug!(count = state.context_items.len(), "Context retrieved");

                self.checkpoint(&cancel, StageId::CheckFreshness)?;
                if !state.context_items.is_empty() {
                    let (latest, stale) = self
                        .check_freshness(&state.context_items)
                        .await
                        .map_err(|e| StageError::new(StageId::CheckFreshness, e))?;
                    state.context_items = latest;
                    state.stale_items = stale;
                    debug!(
                        latest = state.context_items.len(),
                        stale = state.stale_items.len(),
                        "Freshness checked"
                    );
                }

                self.checkpoint(&cancel, StageId::Refresh)?;
                if !state.stale_items.is_empty() {
                    let stale = std::mem::take(&mut state.stale_items);
                    let refreshed = self
                        .refresh_stale(&stale, &state.context_items)
                        .await
                        .map_err(|e| StageError::new(StageId::Refresh, e))?;
                    state.context_items = refreshed;
                }
            }
        }

        self.checkpoint(&cancel, StageId::Generate)?;
        state.answer = self
            .generate_answer(&state, tx, &cancel)
            .await
            .map_err(|e| StageError::new(StageId::Generate, e))?;

        Ok(state)
    }

    fn checkpoint(&self, cancel: &CancellationToken, stage: StageId) -> Result<(), StageError> {
        if cancel.is_cancelled() {
            Err(StageError::new(stage, GroundedError::Cancelled))
        } else {
            Ok(())
        }
    }

    /// Stage 1: rewrite the latest user turn into a self-contained
    /// question using the conversation so far.
    async fn refine_question(&self, state: &PipelineState) -> Result<String, GroundedError> {
        let latest = state
            .turns
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.content.as_text())
            .ok_or_else(|| GroundedError::InvalidRequest {
                message: "conversation has no user turn".to_string(),
            })?;

        let history = prompts::render_history(&state.turns);
        let mut request = CompletionRequest::from_messages(vec![
            Message::system(prompts::refine_question()),
            Message::user(format!(
                "### Conversation:\n{}\n\n### Latest question:\n{}",
                history, latest
            )),
        ]);
        if let Some(model) = &self.options.lite_model {
            request = request.with_model(model);
        }

        let refined: RefinedQuestion =
            structured(self.llm.as_ref(), request, RefinedQuestion::schema()).await?;
        Ok(refined.rewritten_question)
    }

    /// Stage 2: binary routing decision; the model's output is taken as
    /// is, with no default bias.
    async fn decide_route(&self, state: &PipelineState) -> Result<Route, GroundedError> {
        let mut request = CompletionRequest::from_messages(vec![
            Message::system(prompts::check_context_need()),
            Message::user(state.rewritten_question.clone()),
        ]);
        if let Some(model) = &self.options.lite_model {
            request = request.with_model(model);
        }

        let decision: RouteDecision =
            structured(self.llm.as_ref(), request, RouteDecision::schema()).await?;
        Ok(match decision.decision {
            RouteChoice::ContextRequired => Route::ContextRequired,
            RouteChoice::ContextNotRequired => Route::ContextNotRequired,
        })
    }

    /// Stage 3: embed the question and query the store, filtered to the
    /// caller's access group. An empty result is valid.
    async fn retrieve_context(
        &self,
        state: &PipelineState,
    ) -> Result<Vec<ContextItem>, GroundedError> {
        let vector = self
            .llm
            .embed(&state.rewritten_question, EmbeddingTask::Query)
            .await?;

        let hits = self
            .store
            .query(
                &vector,
                &MetadataFilter::for_group(&state.access_group),
                self.options.retrieval_limit,
            )
            .await?;

        Ok(hits.into_iter().map(|h| h.payload.to_context_item()).collect())
    }

    /// Stage 4: compare cached timestamps against live ones.
    ///
    /// For each item the first matching (source, page id) entry in the
    /// agent's report wins; items with no matching entry are dropped.
    /// Timestamps compare by exact string identity, never parsed.
    async fn check_freshness(
        &self,
        items: &[ContextItem],
    ) -> Result<(Vec<ContextItem>, Vec<ContextItem>), GroundedError> {
        let batches = group_by_source(items);
        let records = self.agent.live_timestamps(&batches).await?;

        let mut latest = Vec::new();
        let mut stale = Vec::new();
        for item in items {
            let record = records
                .iter()
                .find(|r| r.data_source == item.source && r.page_id == item.page_id);
            match record {
                Some(r) if r.last_edited_time == item.updated_at => latest.push(item.clone()),
                Some(_) => stale.push(item.clone()),
                None => {
                    warn!(
                        source = %item.source,
                        page_id = %item.page_id,
                        "No live timestamp reported for item, dropping"
                    );
                }
            }
        }
        Ok((latest, stale))
    }

    /// Stage 5: best-effort re-fetch of stale pages.
    ///
    /// Stale pages are fetched non-recursively, one pass each; fresh
    /// chunks replace the stale items. A source with no registered
    /// connector short-circuits the stage, returning what has been
    /// accumulated so far with no error.
    async fn refresh_stale(
        &self,
        stale: &[ContextItem],
        latest: &[ContextItem],
    ) -> Result<Vec<ContextItem>, GroundedError> {
        let mut refreshed: Vec<ContextItem> = latest.to_vec();
        let mut seen_pages = HashSet::new();

        for item in stale {
            if !seen_pages.insert(item.key()) {
                continue;
            }
            let Some(connector) = self.connectors.get(&item.source) else {
                warn!(source = %item.source, "No connector registered, keeping current context");
                return Ok(refreshed);
            };

            let pages = connector.fetch(&item.page_id, false).await?;
            for page in pages {
                debug!(
                    page_id = %page.page_id,
                    chunks = page.chunks.len(),
                    "Refreshed stale page"
                );
                for chunk in page.chunks {
                    refreshed.push(ContextItem::new(
                        chunk,
                        item.source.clone(),
                        page.updated_at.clone(),
                        page.page_id.clone(),
                    ));
                }
            }
        }
        Ok(refreshed)
    }

    /// Stage 6: stream the answer.
    ///
    /// Fragments are forwarded in arrival order; empty fragments are
    /// skipped silently. If the caller's channel closes, delivery stops
    /// but the run still finishes and accumulates the full answer.
    async fn generate_answer(
        &self,
        state: &PipelineState,
        tx: mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<String, GroundedError> {
        let history = prompts::render_history(&state.turns);
        let context: Option<Vec<(ContextItem, Option<String>)>> = if state.context_items.is_empty()
        {
            None
        } else {
            Some(
                state
                    .context_items
                    .iter()
                    .map(|item| (item.clone(), item_citation_url(item)))
                    .collect(),
            )
        };

        let prompt = prompts::answer(&history, &state.rewritten_question, context.as_deref());
        let request = CompletionRequest::from_messages(vec![Message::user(prompt)]);

        let (inner_tx, mut inner_rx) = mpsc::channel::<StreamEvent>(64);
        let llm = self.llm.clone();
        let generation =
            tokio::spawn(async move { llm.complete_streaming(request, inner_tx).await });

        let mut answer = String::new();
        let mut caller_open = true;
        while let Some(event) = inner_rx.recv().await {
            if cancel.is_cancelled() {
                caller_open = false;
            }
            match event {
                StreamEvent::Token(t) if t.is_empty() => {}
                StreamEvent::Token(t) => {
                    answer.push_str(&t);
                    if caller_open && tx.send(StreamEvent::Token(t)).await.is_err() {
                        caller_open = false;
                    }
                }
                StreamEvent::Done => break,
                StreamEvent::Error(message) => {
                    return Err(crate::error::LlmError::Streaming { message }.into());
                }
            }
        }

        generation
            .await
            .map_err(|e| crate::error::LlmError::Streaming {
                message: format!("generation task failed: {}", e),
            })??;

        if caller_open {
            let _ = tx.send(StreamEvent::Done).await;
        }
        Ok(answer)
    }
}
