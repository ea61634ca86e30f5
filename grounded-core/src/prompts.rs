//! Prompt construction for the pipeline stages.
//!
//! Each stage gets its instructions from one builder here so the wording
//! lives in a single place. Builders return plain strings; the pipeline
//! wraps them into messages.

use crate::types::{ContextItem, Message, SourceBatch};

/// System instruction for the question-refinement call (stage 1).
pub fn refine_question() -> String {
    "You rewrite the user's latest question into a fully self-contained \
     question. Resolve pronouns and references using the previous \
     conversation. Keep the user's intent and wording where possible. \
     If the question is already self-contained, return it unchanged. \
     Return only the rewritten question."
        .to_string()
}

/// System instruction for the context-necessity call (stage 2).
pub fn check_context_need() -> String {
    "Decide whether answering the question requires retrieving documents \
     from the knowledge base. Questions about facts, procedures, people, \
     projects, or anything that may be documented require context. \
     Greetings, small talk, and questions answerable from the \
     conversation alone do not. Answer with exactly one of: \
     'context required' or 'context not required'."
        .to_string()
}

/// Render the conversation history as a plain transcript.
pub fn render_history(turns: &[Message]) -> String {
    turns
        .iter()
        .filter_map(|m| m.content.as_text().map(|t| format!("{}: {}", m.role, t)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Task prompt for the freshness-check agent session (stage 4): one
/// numbered block per source listing the page ids to look up.
pub fn freshness_batch(batches: &[SourceBatch]) -> String {
    let mut prompt = String::from(
        "Look up the live last-edited time of each page below using the \
         available tools. Report every page exactly once.\n\n",
    );
    for (i, batch) in batches.iter().enumerate() {
        prompt.push_str(&format!("**{}. Data Source: {}**\n", i + 1, batch.source));
        for page_id in &batch.page_ids {
            prompt.push_str(&format!("- page id: {}\n", page_id));
        }
        prompt.push('\n');
    }
    prompt
}

/// System instruction for the freshness-check agent.
pub fn freshness_agent_system() -> String {
    "You check whether cached documents are up to date. Use the provided \
     tools to fetch live page metadata, then report the last edited time \
     of every requested page. Return timestamps exactly as the source \
     reports them, without reformatting."
        .to_string()
}

/// Build the answer-generation prompt (stage 6).
///
/// The context block is omitted entirely on the no-context path; when
/// present, the model is instructed to cite sources by document URL.
pub fn answer(history: &str, question: &str, context: Option<&[(ContextItem, Option<String>)]>) -> String {
    let mut prompt = String::from(
        "Answer the question using the chat history and, when provided, \
         the context documents. Be accurate and concise.",
    );

    if context.is_some() {
        prompt.push_str(
            " When a statement comes from a context document with a URL, \
             cite it inline as [Source: {document url}]. Do not invent \
             sources.",
        );
    }

    prompt.push_str("\n\n### Chat History:\n");
    prompt.push_str(history);
    prompt.push_str("\n\n### Question:\n");
    prompt.push_str(question);

    if let Some(items) = context {
        prompt.push_str("\n\n### Context:\n");
        for (item, url) in items {
            match url {
                Some(url) => {
                    prompt.push_str(&format!("[document url: {}]\n{}\n\n", url, item.content))
                }
                None => prompt.push_str(&format!("{}\n\n", item.content)),
            }
        }
    }

    prompt
}
