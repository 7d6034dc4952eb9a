//! Prompt assembly for agent runs.
//!
//! A run sends the system prompt, then up to `num_history_turns` previous
//! user/assistant exchanges, then the user message with any retrieved
//! references appended as a `<references>` block.


use std::fmt::Write as _;

use serde_json::json;

use super::Reference;
use crate::config::AgentConfig;
use crate::model::{ChatMessage, Role, ToolCall, ToolDefinition};

pub const SEARCH_TOOL_NAME: &str = "search_knowledge_base";

/// Function tool offered to the model when it decides whether to search
#[inline]
pub fn search_tool() -> ToolDefinition {
    ToolDefinition {
        name: SEARCH_TOOL_NAME.to_string(),
        description: "Search the knowledge base for passages relevant to a query. \
                      Returns excerpts with their source and page number."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                }
            },
            "required": ["query"]
        }),
    }
}

/// Query argument of a search tool call, if the model supplied a usable one
#[inline]
pub fn tool_query(call: &ToolCall) -> Option<String> {
    let arguments: serde_json::Value = serde_json::from_str(&call.arguments).ok()?;
    arguments
        .get("query")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|query| !query.is_empty())
        .map(str::to_string)
}

#[inline]
pub fn system_prompt(settings: &AgentConfig, has_references: bool) -> String {
    let mut prompt = String::new();

    if let Some(description) = settings.description.as_deref().filter(|d| !d.is_empty()) {
        prompt.push_str(description);
        prompt.push_str("\n\n");
    }

    if !settings.instructions.is_empty() {
        prompt.push_str("## Instructions\n");
        for (i, instruction) in settings.instructions.iter().enumerate() {
            let _ = writeln!(prompt, "{}. {}", i + 1, instruction);
        }
    }

    let mut directives = Vec::new();
    if settings.markdown {
        directives.push("Use markdown to format your answers.");
    }
    if has_references {
        directives.push(
            "Answer from the provided references where possible and cite the source and page \
             number of every reference you use.",
        );
    }
    if !directives.is_empty() {
        if !prompt.is_empty() {
            prompt.push('\n');
        }
        for directive in directives {
            let _ = writeln!(prompt, "- {directive}");
        }
    }

    prompt.trim_end().to_string()
}

/// Render references as a block the model can cite from
#[inline]
pub fn render_references(references: &[Reference]) -> String {
    let mut rendered = String::from("<references>\n");
    for reference in references {
        let _ = writeln!(
            rendered,
            "<reference source=\"{}\" page=\"{}\">\n{}\n</reference>",
            reference.source_uri,
            reference.page_number,
            reference.content.trim()
        );
    }
    rendered.push_str("</references>");
    rendered
}

#[inline]
pub fn user_prompt(query: &str, references: &[Reference]) -> String {
    if references.is_empty() {
        return query.to_string();
    }

    format!(
        "{query}\n\nUse the following references from the knowledge base to answer the question.\n\n{}",
        render_references(references)
    )
}

/// The last `turns` exchanges of a history, starting at a user message
#[inline]
pub fn history_window(history: &[ChatMessage], turns: usize) -> &[ChatMessage] {
    let start = history.len().saturating_sub(turns * 2);
    let mut window = &history[start..];
    while window.first().is_some_and(|m| m.role != Role::User) {
        window = &window[1..];
    }
    window
}

#[inline]
pub fn build_messages(
    settings: &AgentConfig,
    history: &[ChatMessage],
    query: &str,
    references: &[Reference],
) -> Vec<ChatMessage> {
    let mut messages = Vec::new();

    let system = system_prompt(settings, !references.is_empty());
    if !system.is_empty() {
        messages.push(ChatMessage::system(system));
    }

    if settings.read_chat_history {
        messages.extend(
            history_window(history, settings.num_history_turns)
                .iter()
                .filter(|m| m.role != Role::System)
                .cloned(),
        );
    }

    messages.push(ChatMessage::user(user_prompt(query, references)));
    messages
}
