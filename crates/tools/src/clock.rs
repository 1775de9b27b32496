//! Current date and time, optionally shifted to a fixed UTC offset.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use kestrel_core::error::ToolError;
use kestrel_core::tool::{Tool, ToolContext};

/// Largest accepted offset, in minutes either side of UTC.
const MAX_OFFSET_MINUTES: i64 = 14 * 60;

pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time. Optionally pass a UTC offset in minutes (e.g. 120 or -300)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "utc_offset_minutes": {
                    "type": "integer",
                    "description": "Offset from UTC in minutes, between -840 and 840"
                }
            }
        })
    }

    async fn execute(
        &self,
        input: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let offset = match input.get("utc_offset_minutes") {
            None | Some(serde_json::Value::Null) => 0,
            Some(v) => v.as_i64().ok_or_else(|| {
                ToolError::InvalidArguments("'utc_offset_minutes' must be an integer".into())
            })?,
        };
        render(Utc::now(), offset)
    }
}

fn render(now: DateTime<Utc>, offset_minutes: i64) -> Result<serde_json::Value, ToolError> {
    let zone = (-MAX_OFFSET_MINUTES..=MAX_OFFSET_MINUTES)
        .contains(&offset_minutes)
        .then(|| FixedOffset::east_opt((offset_minutes * 60) as i32))
        .flatten()
        .ok_or_else(|| {
            ToolError::InvalidArguments(format!("UTC offset out of range: {offset_minutes}"))
        })?;

    let local = now.with_timezone(&zone);
    Ok(serde_json::json!({
        "iso8601": local.to_rfc3339(),
        "date": local.format("%Y-%m-%d").to_string(),
        "time": local.format("%H:%M:%S").to_string(),
        "weekday": local.format("%A").to_string(),
        "unix": now.timestamp(),
    }))
}
