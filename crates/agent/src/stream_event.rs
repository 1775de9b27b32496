//! Orchestration lifecycle events for stream mode.
//!
//! A stream always opens with exactly one `message.start` and closes with
//! exactly one `done`. Between them, in emission order:
//! - `tool.start` / `tool.complete`: one pair per tool call, after its batch settles
//! - `message.delta`: the final content, in one piece
//! - `message.complete`: final usage and loop statistics
//! - `error`: a request-level failure (always followed by `done`)

use kestrel_core::provider::Usage;
use kestrel_core::tool::{ToolCallRecord, ToolCallStatus};
use serde::{Deserialize, Serialize};

use crate::tool_loop::StopReason;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "message.start")]
    MessageStart { request_id: String, model: String },

    #[serde(rename = "message.delta")]
    MessageDelta { content: String },

    #[serde(rename = "message.complete")]
    MessageComplete {
        model: String,
        iterations: u32,
        tool_calls_made: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stopped_reason: Option<StopReason>,
        usage: Usage,
    },

    #[serde(rename = "tool.start")]
    ToolStart {
        tool_call_id: String,
        tool_name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool.complete")]
    ToolComplete {
        tool_call_id: String,
        tool_name: String,
        status: ToolCallStatus,
        output: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        duration_ms: u64,
    },

    #[serde(rename = "error")]
    Error { code: String, message: String },

    #[serde(rename = "done")]
    Done { request_id: String },
}

impl StreamEvent {
    /// Wire name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MessageStart { .. } => "message.start",
            Self::MessageDelta { .. } => "message.delta",
            Self::MessageComplete { .. } => "message.complete",
            Self::ToolStart { .. } => "tool.start",
            Self::ToolComplete { .. } => "tool.complete",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }

    /// The `tool.start` / `tool.complete` pair for one record.
    pub fn tool_pair(record: &ToolCallRecord) -> [StreamEvent; 2] {
        [
            Self::ToolStart {
                tool_call_id: record.tool_call_id.clone(),
                tool_name: record.tool_name.clone(),
                input: record.input.clone(),
            },
            Self::ToolComplete {
                tool_call_id: record.tool_call_id.clone(),
                tool_name: record.tool_name.clone(),
                status: record.status,
                output: record.output.clone(),
                error_message: record.error_message.clone(),
                duration_ms: record.duration_ms,
            },
        ]
    }
}
