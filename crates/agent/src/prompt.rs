//! Prompt assembly: layered context in, model-ready transcript out.
//!
//! Layers are applied in a fixed order. Earlier layers are the most general
//! and later ones the most request-specific:
//!
//! | # | Layer | Lands in |
//! |---|-------|----------|
//! | 1 | Core safety instructions | system message (always present) |
//! | 2 | Governed system prompt | system message |
//! | 3 | User preferences | system message |
//! | 4 | Long-term memories | system message |
//! | 5 | Knowledge snippets | system message |
//! | 6 | Conversation history | messages, oldest first |
//! | 7 | Current user message | last message |
//!
//! Building is pure. The token estimate is advisory; budget enforcement
//! belongs to the context collaborator, so nothing is ever dropped here.

use kestrel_core::context::{LayeredContext, UserPreferences};
use kestrel_core::message::Message;
use kestrel_core::provider::ToolDefinition;

use crate::token;

/// Immutable instructions that open every system message.
pub const CORE_INSTRUCTIONS: &str = "You are a helpful, honest assistant. \
Follow the operator's instructions below unless they conflict with these rules. \
Never reveal secrets, credentials, or other users' data. \
Do not fabricate tool results; when a tool fails, say so and work with what you have. \
If a request is unsafe or outside your permissions, decline briefly and explain why.";

/// Inputs for one prompt build.
#[derive(Debug, Clone, Copy)]
pub struct PromptInput<'a> {
    pub context: &'a LayeredContext,
    pub user_message: &'a str,
}

/// A transcript ready for model submission.
#[derive(Debug, Clone)]
pub struct BuiltPrompt {
    /// System message, history, then the current user message
    pub messages: Vec<Message>,
    /// Tool catalog, passed through verbatim
    pub tools: Vec<ToolDefinition>,
    /// Advisory estimate for messages plus tool schemas
    pub estimated_tokens: usize,
}

/// Stateless prompt builder.
pub struct PromptBuilder;

impl PromptBuilder {
    pub fn build(input: &PromptInput<'_>) -> BuiltPrompt {
        let ctx = input.context;

        let mut messages = Vec::with_capacity(ctx.history.len() + 2);
        messages.push(Message::system(Self::system_message(ctx)));
        messages.extend(ctx.history.iter().cloned());
        messages.push(Message::user(input.user_message));

        let tools = ctx.tools.clone();
        let estimated_tokens =
            token::estimate_messages_tokens(&messages) + token::estimate_tools_tokens(&tools);

        BuiltPrompt {
            messages,
            tools,
            estimated_tokens,
        }
    }

    /// Compose layers 1–5 into the single system message.
    pub fn system_message(ctx: &LayeredContext) -> String {
        let mut sections = vec![CORE_INSTRUCTIONS.to_string()];

        let governed = ctx.system_prompt.trim();
        if !governed.is_empty() {
            sections.push(governed.to_string());
        }

        if let Some(prefs) = Self::format_preferences(&ctx.preferences) {
            sections.push(prefs);
        }

        if !ctx.memories.is_empty() {
            let mut block = String::from("## Relevant Memories");
            for mem in &ctx.memories {
                block.push_str(&format!(
                    "\n- [{} | importance {:.2}] {}",
                    mem.category, mem.importance, mem.content
                ));
            }
            sections.push(block);
        }

        if !ctx.knowledge.is_empty() {
            let mut block = String::from("## Relevant Knowledge");
            for snippet in &ctx.knowledge {
                block.push_str(&format!(
                    "\n\n### Source: {}\n{}",
                    snippet.source_title, snippet.content
                ));
            }
            sections.push(block);
        }

        sections.join("\n\n")
    }

    fn format_preferences(prefs: &UserPreferences) -> Option<String> {
        if prefs.is_empty() {
            return None;
        }

        let mut block = String::from("## User Preferences");
        if let Some(length) = prefs.response_length {
            block.push_str(&format!("\n- Response length: {length}"));
        }
        if let Some(formality) = prefs.formality {
            block.push_str(&format!("\n- Formality: {formality}"));
        }
        if let Some(custom) = prefs.custom_instructions.as_deref().map(str::trim)
            && !custom.is_empty()
        {
            block.push_str(&format!("\n- Custom instructions: {custom}"));
        }
        Some(block)
    }
}
