//! The context collaborator: layered-context assembly and response persistence.
//!
//! Storage, permissions, and retrieval all live behind [`ContextService`].
//! The engine only consumes the assembled [`LayeredContext`] and hands the
//! final answer back through [`ContextService::persist_response`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use crate::error::ContextError;
use crate::message::Message;
use crate::provider::{ToolDefinition, Usage};
use crate::tool::ToolCallRecord;

/// The authenticated caller on whose behalf a request runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: String,
    /// Host-defined role label ("member", "admin", ...), opaque to the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl Actor {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: None,
        }
    }
}

/// Preferred answer length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseLength {
    Concise,
    Balanced,
    Detailed,
}

impl fmt::Display for ResponseLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Concise => "concise",
            Self::Balanced => "balanced",
            Self::Detailed => "detailed",
        })
    }
}

/// Preferred register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Formality {
    Casual,
    Neutral,
    Formal,
}

impl fmt::Display for Formality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Casual => "casual",
            Self::Neutral => "neutral",
            Self::Formal => "formal",
        })
    }
}

/// Per-user directives folded into the system message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_length: Option<ResponseLength>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formality: Option<Formality>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_instructions: Option<String>,
}

impl UserPreferences {
    pub fn is_empty(&self) -> bool {
        self.response_length.is_none()
            && self.formality.is_none()
            && self
                .custom_instructions
                .as_deref()
                .is_none_or(|s| s.trim().is_empty())
    }
}

/// A retrieved long-term memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub content: String,
    pub category: String,
    /// Importance in `0.0..=1.0`
    pub importance: f32,
}

/// A retrieved knowledge-base snippet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeSnippet {
    pub source_title: String,
    pub content: String,
}

/// What the engine asks the collaborator to assemble.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRequest {
    pub chat_id: String,
    pub user_message: String,
}

/// Layered context for one request, already budgeted by the collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayeredContext {
    /// Governed system prompt; may be empty
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub preferences: UserPreferences,
    #[serde(default)]
    pub memories: Vec<MemoryItem>,
    #[serde(default)]
    pub knowledge: Vec<KnowledgeSnippet>,
    /// Prior turns, oldest first
    #[serde(default)]
    pub history: Vec<Message>,
    /// Tools the actor may use in this chat
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
}

/// The final answer handed back for storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistRequest {
    pub chat_id: String,
    pub request_id: String,
    pub user_message: String,
    pub response: String,
    pub model: String,
    pub usage: Usage,
    pub tool_calls: Vec<ToolCallRecord>,
}

/// The context collaborator.
///
/// Both operations are fallible. Only a `build_context` failure prevents the
/// tool loop from starting; a `persist_response` failure is logged and does
/// not affect a result that has already been produced.
#[async_trait]
pub trait ContextService: Send + Sync {
    async fn build_context(
        &self,
        actor: &Actor,
        request: &ContextRequest,
    ) -> std::result::Result<LayeredContext, ContextError>;

    async fn persist_response(
        &self,
        actor: &Actor,
        request: PersistRequest,
    ) -> std::result::Result<(), ContextError>;
}
