//! The tool-execution boundary.
//!
//! The orchestration core never implements tools itself. It hands parsed
//! tool-call input to a [`ToolExecutor`] and records what came back as a
//! [`ToolCallRecord`]. [`ToolRegistry`] is the stock executor: a name-indexed
//! set of [`Tool`] trait objects.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// Request-scoped identity passed to every tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolContext {
    pub user_id: String,
    pub chat_id: String,
    pub request_id: String,
}

/// What the tool boundary reports for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Whether the tool executed successfully
    pub success: bool,

    /// The tool's output (meaningful only on success)
    #[serde(default)]
    pub output: serde_json::Value,

    /// Failure detail when `success` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Wall-clock duration measured by the boundary
    pub duration_ms: u64,
}

impl ToolOutcome {
    pub fn ok(output: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            success: true,
            output,
            error_message: None,
            duration_ms,
        }
    }

    pub fn failed(error_message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error_message: Some(error_message.into()),
            duration_ms,
        }
    }
}

/// The tool-execution boundary consumed by the tool loop.
///
/// Must be safe for concurrent use: one batch dispatches every call at once,
/// and independent requests share the same executor.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute `tool_name` with already-parsed `input`.
    ///
    /// An `Err` and an `Ok` outcome with `success == false` are treated the
    /// same way by the loop: both become failure records.
    async fn execute(
        &self,
        tool_name: &str,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> std::result::Result<ToolOutcome, ToolError>;
}

/// Outcome classification of a recorded tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Success,
    Failure,
}

/// The durable audit trail of one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_call_id: String,
    pub tool_name: String,
    /// Parsed input, or the raw argument string when it failed to parse
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub duration_ms: u64,
}

impl ToolCallRecord {
    pub fn is_success(&self) -> bool {
        self.status == ToolCallStatus::Success
    }
}

/// A single capability the model can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "web_search").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given input.
    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> std::result::Result<serde_json::Value, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools, usable directly as the [`ToolExecutor`].
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Get all tool definitions, sorted by name so prompts are stable.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(
        &self,
        tool_name: &str,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> std::result::Result<ToolOutcome, ToolError> {
        let tool = self
            .tools
            .get(tool_name)
            .ok_or_else(|| ToolError::NotFound(tool_name.to_string()))?;

        let start = Instant::now();
        let result = tool.execute(input, ctx).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        Ok(match result {
            Ok(output) => ToolOutcome::ok(output, duration_ms),
            Err(e) => {
                tracing::debug!(tool = tool_name, error = %e, "Tool reported failure");
                ToolOutcome::failed(e.to_string(), duration_ms)
            }
        })
    }
}
