//! The bounded tool-calling loop.
//!
//! One [`ToolLoop::run`] call supervises a single request:
//!
//! ```text
//!            ┌──────────────── tool results appended ───────────────┐
//!            ▼                                                      │
//!       Iterating ── model answers, no tool calls ──► Completed     │
//!            │                                                      │
//!            ├── call budget would be exceeded ─────► Aborted       │
//!            │                                                      │
//!            └── tool calls requested ──► AwaitingTools ────────────┘
//! ```
//!
//! Model calls are sequential. Each batch of tool calls is fanned out
//! concurrently and fanned back in before the next model call. Tool faults
//! (bad arguments, errors, timeouts, panics) become failure records and flow
//! back to the model as tool messages; only a model-client failure escapes
//! as [`LoopError`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use kestrel_config::LoopConfig;
use kestrel_core::error::ProviderError;
use kestrel_core::message::{Message, MessageToolCall};
use kestrel_core::provider::{Provider, ProviderRequest, ToolDefinition, Usage};
use kestrel_core::tool::{ToolCallRecord, ToolCallStatus, ToolContext, ToolExecutor};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Returned in place of a model answer when a safety limit ends the loop.
pub const DEGRADED_RESPONSE: &str = "I wasn't able to complete this request within the allowed \
number of steps. Please narrow the request or split it into smaller parts and try again.";

/// Why a loop ended without a natural model answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxIterations,
    MaxToolCalls,
    /// The caller abandoned the request; results are not delivered
    Cancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxIterations => "max_iterations",
            Self::MaxToolCalls => "max_tool_calls",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Everything one loop run needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct LoopInput {
    pub messages: Vec<Message>,
    pub model: String,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub context: ToolContext,
}

/// The outcome of a loop run. Partial progress is always kept.
#[derive(Debug, Clone)]
pub struct LoopResult {
    pub content: String,
    /// Model id as reported by the last response
    pub model: String,
    /// Model invocations made
    pub iterations: u32,
    pub tool_calls: Vec<ToolCallRecord>,
    /// `None` only when the model produced a final answer
    pub stopped_reason: Option<StopReason>,
    /// Summed over every model call made
    pub usage: Usage,
    /// The full transcript as last submitted, plus the final answer
    pub transcript: Vec<Message>,
}

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("Model call failed: {0}")]
    Provider(#[from] ProviderError),
}

/// Notified after every fan-in.
#[async_trait]
pub trait LoopObserver: Send + Sync {
    async fn batch_completed(&self, iteration: u32, records: &[ToolCallRecord]);
}

/// Argument payloads that cannot become a tool input.
#[derive(Debug, thiserror::Error)]
pub enum ToolInputError {
    #[error("Invalid tool arguments: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Invalid tool arguments: expected a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// Parse a model-emitted argument string into a structured input object.
///
/// Blank payloads mean "no arguments" and parse as `{}`.
pub fn parse_tool_input(raw: &str) -> Result<serde_json::Value, ToolInputError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    let value: serde_json::Value = serde_json::from_str(raw)?;
    match value {
        serde_json::Value::Object(_) => Ok(value),
        serde_json::Value::Null => Err(ToolInputError::NotAnObject("null")),
        serde_json::Value::Bool(_) => Err(ToolInputError::NotAnObject("a boolean")),
        serde_json::Value::Number(_) => Err(ToolInputError::NotAnObject("a number")),
        serde_json::Value::String(_) => Err(ToolInputError::NotAnObject("a string")),
        serde_json::Value::Array(_) => Err(ToolInputError::NotAnObject("an array")),
    }
}

/// Per-run accumulator, owned by exactly one supervisor.
struct RunState {
    transcript: Vec<Message>,
    model: String,
    iterations: u32,
    total_tool_calls: usize,
    records: Vec<ToolCallRecord>,
    usage: Usage,
}

impl RunState {
    fn finish(self, content: String, stopped_reason: Option<StopReason>) -> LoopResult {
        LoopResult {
            content,
            model: self.model,
            iterations: self.iterations,
            tool_calls: self.records,
            stopped_reason,
            usage: self.usage,
            transcript: self.transcript,
        }
    }

    fn abort(self, reason: StopReason) -> LoopResult {
        warn!(
            reason = reason.as_str(),
            iterations = self.iterations,
            tool_calls = self.total_tool_calls,
            "Tool loop stopped by safety limit"
        );
        self.finish(DEGRADED_RESPONSE.to_string(), Some(reason))
    }

    fn cancelled(self) -> LoopResult {
        debug!(iterations = self.iterations, "Tool loop cancelled by caller");
        self.finish(String::new(), Some(StopReason::Cancelled))
    }
}

/// The bounded execution engine.
///
/// Cheap to construct; build one per request.
pub struct ToolLoop {
    provider: Arc<dyn Provider>,
    executor: Arc<dyn ToolExecutor>,
    config: LoopConfig,
    cancel: Option<CancellationToken>,
    observer: Option<Arc<dyn LoopObserver>>,
}

impl ToolLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        executor: Arc<dyn ToolExecutor>,
        config: LoopConfig,
    ) -> Self {
        Self {
            provider,
            executor,
            config,
            cancel: None,
            observer: None,
        }
    }

    /// Stop at the next iteration or batch boundary once `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Report each completed tool batch to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn LoopObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// Drive the model until it answers or a limit trips.
    pub async fn run(&self, input: LoopInput) -> Result<LoopResult, LoopError> {
        let LoopInput {
            messages,
            model,
            tools,
            temperature,
            max_tokens,
            context,
        } = input;

        info!(
            request_id = %context.request_id,
            model = %model,
            max_iterations = self.config.max_iterations,
            max_tool_calls = self.config.max_tool_calls,
            "Starting tool loop"
        );

        let mut state = RunState {
            transcript: messages,
            model: model.clone(),
            iterations: 0,
            total_tool_calls: 0,
            records: Vec::new(),
            usage: Usage::default(),
        };

        while state.iterations < self.config.max_iterations {
            if self.is_cancelled() {
                return Ok(state.cancelled());
            }
            if state.total_tool_calls >= self.config.max_tool_calls {
                return Ok(state.abort(StopReason::MaxToolCalls));
            }

            state.iterations += 1;
            debug!(
                request_id = %context.request_id,
                iteration = state.iterations,
                transcript = state.transcript.len(),
                "Tool loop iteration"
            );

            let request = ProviderRequest {
                model: model.clone(),
                messages: state.transcript.clone(),
                tools: tools.clone(),
                temperature,
                max_output_tokens: max_tokens,
            };

            let response = match &self.cancel {
                Some(token) => tokio::select! {
                    response = self.provider.complete(request) => response?,
                    _ = token.cancelled() => return Ok(state.cancelled()),
                },
                None => self.provider.complete(request).await?,
            };

            let message = response
                .primary()
                .map(|choice| choice.message.clone())
                .ok_or_else(|| ProviderError::InvalidResponse("No choices in response".into()))?;

            state.usage += response.usage;
            if !response.model.is_empty() {
                state.model = response.model;
            }

            if !message.has_tool_calls() {
                info!(
                    request_id = %context.request_id,
                    iterations = state.iterations,
                    tool_calls = state.records.len(),
                    total_tokens = state.usage.total_tokens,
                    "Tool loop completed"
                );
                let content = message.content.clone();
                state.transcript.push(message);
                return Ok(state.finish(content, None));
            }

            let requested = message.tool_calls.len();
            if state.total_tool_calls + requested > self.config.max_tool_calls {
                debug!(
                    requested,
                    used = state.total_tool_calls,
                    "Tool batch rejected: call budget exhausted"
                );
                return Ok(state.abort(StopReason::MaxToolCalls));
            }

            let calls = message.tool_calls.clone();
            state.transcript.push(message);

            let records = self.execute_batch(&calls, &context).await;
            state.total_tool_calls += records.len();
            for record in &records {
                state
                    .transcript
                    .push(Message::tool_result(&record.tool_call_id, tool_message(record)));
            }

            if let Some(observer) = &self.observer {
                observer.batch_completed(state.iterations, &records).await;
            }
            state.records.extend(records);

            if self.is_cancelled() {
                return Ok(state.cancelled());
            }
        }

        Ok(state.abort(StopReason::MaxIterations))
    }

    /// Fan out one batch and wait for every call to settle.
    ///
    /// Records come back in request order; one call's failure never affects
    /// its siblings.
    async fn execute_batch(
        &self,
        calls: &[MessageToolCall],
        ctx: &ToolContext,
    ) -> Vec<ToolCallRecord> {
        debug!(tool_count = calls.len(), "Executing tool batch");
        join_all(calls.iter().map(|call| self.execute_call(call, ctx))).await
    }

    async fn execute_call(&self, call: &MessageToolCall, ctx: &ToolContext) -> ToolCallRecord {
        let start = Instant::now();
        let failure = |input: serde_json::Value, error: String, duration_ms: u64| {
            warn!(tool = %call.name, call_id = %call.id, error = %error, "Tool call failed");
            ToolCallRecord {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                input,
                output: serde_json::Value::Null,
                status: ToolCallStatus::Failure,
                error_message: Some(error),
                duration_ms,
            }
        };

        let input = match parse_tool_input(&call.arguments) {
            Ok(input) => input,
            Err(e) => {
                return failure(serde_json::Value::String(call.arguments.clone()), e.to_string(), 0);
            }
        };

        let timeout_ms = self.config.tool_call_timeout_ms;
        let execution = AssertUnwindSafe(self.executor.execute(&call.name, input.clone(), ctx))
            .catch_unwind();
        let result = tokio::time::timeout(Duration::from_millis(timeout_ms), execution).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(Ok(outcome))) if outcome.success => {
                debug!(tool = %call.name, duration_ms = outcome.duration_ms, "Tool call succeeded");
                ToolCallRecord {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    input,
                    output: outcome.output,
                    status: ToolCallStatus::Success,
                    error_message: None,
                    duration_ms: outcome.duration_ms,
                }
            }
            Ok(Ok(Ok(outcome))) => failure(
                input,
                outcome
                    .error_message
                    .unwrap_or_else(|| "Tool reported failure".to_string()),
                outcome.duration_ms,
            ),
            Ok(Ok(Err(e))) => failure(input, e.to_string(), elapsed_ms),
            Ok(Err(_panic)) => failure(input, "Tool execution panicked".to_string(), elapsed_ms),
            Err(_) => failure(
                input,
                format!("Tool call timed out after {timeout_ms}ms"),
                elapsed_ms,
            ),
        }
    }
}

/// The tool-role message content fed back to the model for one record.
fn tool_message(record: &ToolCallRecord) -> String {
    match record.status {
        ToolCallStatus::Success => record.output.to_string(),
        ToolCallStatus::Failure => serde_json::json!({
            "error": record.error_message.as_deref().unwrap_or("Tool call failed"),
        })
        .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use kestrel_core::message::Role;
    use std::sync::Mutex;

    fn config(max_iterations: u32, max_tool_calls: usize) -> LoopConfig {
        LoopConfig {
            max_iterations,
            max_tool_calls,
            tool_call_timeout_ms: 1_000,
        }
    }

    fn input() -> LoopInput {
        LoopInput {
            messages: vec![Message::system("sys"), Message::user("question")],
            model: "mock-model".into(),
            tools: vec![],
            temperature: Some(0.2),
            max_tokens: Some(512),
            context: tool_context(),
        }
    }

    #[tokio::test]
    async fn text_on_first_call_completes() {
        let provider = Arc::new(SequentialMockProvider::single_text("Final answer"));
        let tool_loop = ToolLoop::new(provider.clone(), Arc::new(ScriptedExecutor::new()), config(5, 5));

        let result = tool_loop.run(input()).await.unwrap();
        assert_eq!(result.content, "Final answer");
        assert_eq!(result.iterations, 1);
        assert!(result.stopped_reason.is_none());
        assert!(result.tool_calls.is_empty());
        assert_eq!(result.usage.total_tokens, 15);
        assert_eq!(provider.call_count(), 1);
        assert_eq!(result.transcript.last().unwrap().role, Role::Assistant);
    }

    #[tokio::test]
    async fn request_carries_sampling_settings() {
        let provider = Arc::new(SequentialMockProvider::single_text("ok"));
        let tool_loop = ToolLoop::new(provider.clone(), Arc::new(ScriptedExecutor::new()), config(5, 5));
        tool_loop.run(input()).await.unwrap();

        let requests = provider.requests();
        assert_eq!(requests[0].temperature, Some(0.2));
        assert_eq!(requests[0].max_output_tokens, Some(512));
        assert_eq!(requests[0].messages.len(), 2);
    }

    #[tokio::test]
    async fn tool_round_trip_appends_to_transcript() {
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            vec![make_tool_call("call_1", "lookup", r#"{"id":7}"#)],
            "The order shipped",
        ));
        let executor = Arc::new(
            ScriptedExecutor::new().with("lookup", ToolBehavior::Succeed(serde_json::json!({"status": "shipped"}))),
        );
        let tool_loop = ToolLoop::new(provider.clone(), executor.clone(), config(5, 5));

        let result = tool_loop.run(input()).await.unwrap();
        assert_eq!(result.content, "The order shipped");
        assert_eq!(result.iterations, 2);
        assert_eq!(result.usage.total_tokens, 30);
        assert_eq!(result.tool_calls.len(), 1);
        assert!(result.tool_calls[0].is_success());
        assert_eq!(result.tool_calls[0].input, serde_json::json!({"id": 7}));

        // Second request sees: system, user, assistant(tool_calls), tool
        let second = &provider.requests()[1].messages;
        assert_eq!(second.len(), 4);
        assert_eq!(second[2].tool_calls.len(), 1);
        assert_eq!(second[3].role, Role::Tool);
        assert_eq!(second[3].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(second[3].content, r#"{"status":"shipped"}"#);

        assert_eq!(executor.seen_contexts()[0], tool_context());
    }

    #[tokio::test]
    async fn tool_call_budget_scenario() {
        // 2 calls per turn, budget 5: 2 + 2 executed, third batch rejected
        let provider = Arc::new(AlwaysToolProvider::new("lookup", 2));
        let executor = Arc::new(ScriptedExecutor::new());
        let tool_loop = ToolLoop::new(provider.clone(), executor, config(3, 5));

        let result = tool_loop.run(input()).await.unwrap();
        assert_eq!(result.stopped_reason, Some(StopReason::MaxToolCalls));
        assert_eq!(result.iterations, 3);
        assert_eq!(result.tool_calls.len(), 4);
        assert_eq!(result.content, DEGRADED_RESPONSE);
        assert_eq!(provider.call_count(), 3);
        assert_eq!(result.usage.total_tokens, 45);
    }

    #[tokio::test]
    async fn single_iteration_limit() {
        let provider = Arc::new(AlwaysToolProvider::new("lookup", 1));
        let tool_loop = ToolLoop::new(provider.clone(), Arc::new(ScriptedExecutor::new()), config(1, 10));

        let result = tool_loop.run(input()).await.unwrap();
        assert_eq!(provider.call_count(), 1);
        assert_eq!(result.iterations, 1);
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.stopped_reason, Some(StopReason::MaxIterations));
        assert_eq!(result.content, DEGRADED_RESPONSE);
    }

    #[tokio::test]
    async fn limits_hold_for_many_configs() {
        for max_iterations in 1..=4 {
            for max_tool_calls in 0..=7 {
                for per_turn in 1..=3 {
                    let provider = Arc::new(AlwaysToolProvider::new("lookup", per_turn));
                    let tool_loop = ToolLoop::new(
                        provider.clone(),
                        Arc::new(ScriptedExecutor::new()),
                        config(max_iterations, max_tool_calls),
                    );
                    let result = tool_loop.run(input()).await.unwrap();

                    assert!(provider.call_count() <= max_iterations as usize);
                    assert!(result.tool_calls.len() <= max_tool_calls);
                    assert!(result.stopped_reason.is_some());
                    assert_eq!(result.usage.total_tokens, 15 * provider.call_count() as u32);
                }
            }
        }
    }

    #[tokio::test]
    async fn zero_tool_budget_aborts_before_any_model_call() {
        let provider = Arc::new(AlwaysToolProvider::new("lookup", 1));
        let tool_loop = ToolLoop::new(provider.clone(), Arc::new(ScriptedExecutor::new()), config(3, 0));

        let result = tool_loop.run(input()).await.unwrap();
        assert_eq!(provider.call_count(), 0);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.stopped_reason, Some(StopReason::MaxToolCalls));
    }

    #[tokio::test]
    async fn failures_do_not_cancel_siblings() {
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            vec![
                make_tool_call("call_1", "good", "{}"),
                make_tool_call("call_2", "broken", "{}"),
                make_tool_call("call_3", "good", "not json"),
                make_tool_call("call_4", "missing", "{}"),
                make_tool_call("call_5", "explode", "{}"),
            ],
            "Done anyway",
        ));
        let executor = Arc::new(
            ScriptedExecutor::new()
                .with("good", ToolBehavior::Succeed(serde_json::json!("fine")))
                .with("broken", ToolBehavior::Fail("disk full".into()))
                .with("explode", ToolBehavior::Panic),
        );
        let tool_loop = ToolLoop::new(provider.clone(), executor, config(5, 10));

        let result = tool_loop.run(input()).await.unwrap();
        assert_eq!(result.content, "Done anyway");
        assert!(result.stopped_reason.is_none());

        let statuses: Vec<_> = result.tool_calls.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                ToolCallStatus::Success,
                ToolCallStatus::Failure,
                ToolCallStatus::Failure,
                ToolCallStatus::Failure,
                ToolCallStatus::Failure,
            ]
        );
        assert!(result.tool_calls[1].error_message.as_deref().unwrap().contains("disk full"));
        assert!(result.tool_calls[2].error_message.as_deref().unwrap().starts_with("Invalid tool arguments"));
        assert_eq!(result.tool_calls[2].input, serde_json::json!("not json"));
        assert!(result.tool_calls[3].error_message.as_deref().unwrap().contains("not found"));
        assert!(result.tool_calls[4].error_message.as_deref().unwrap().contains("panicked"));

        let tool_messages: Vec<_> = provider.requests()[1]
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.content.clone())
            .collect();
        assert_eq!(tool_messages.len(), 5);
        let err: serde_json::Value = serde_json::from_str(&tool_messages[1]).unwrap();
        assert!(err["error"].as_str().unwrap().contains("disk full"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_times_out_without_blocking_batch() {
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            vec![
                make_tool_call("call_1", "slow", "{}"),
                make_tool_call("call_2", "fast", "{}"),
            ],
            "Partial answer",
        ));
        let executor = Arc::new(
            ScriptedExecutor::new()
                .with("slow", ToolBehavior::Sleep(Duration::from_secs(60)))
                .with("fast", ToolBehavior::Succeed(serde_json::json!(1))),
        );
        let tool_loop = ToolLoop::new(
            provider,
            executor,
            LoopConfig {
                max_iterations: 3,
                max_tool_calls: 5,
                tool_call_timeout_ms: 250,
            },
        );

        let result = tool_loop.run(input()).await.unwrap();
        assert_eq!(result.content, "Partial answer");
        assert_eq!(result.tool_calls[0].status, ToolCallStatus::Failure);
        assert_eq!(
            result.tool_calls[0].error_message.as_deref(),
            Some("Tool call timed out after 250ms")
        );
        assert!(result.tool_calls[1].is_success());
    }

    #[tokio::test]
    async fn batch_calls_run_concurrently() {
        // Each call blocks until all three are in flight at once
        let barrier = Arc::new(tokio::sync::Barrier::new(3));
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            vec![
                make_tool_call("call_1", "meet", "{}"),
                make_tool_call("call_2", "meet", "{}"),
                make_tool_call("call_3", "meet", "{}"),
            ],
            "All met",
        ));
        let executor = Arc::new(ScriptedExecutor::new().with("meet", ToolBehavior::Rendezvous(barrier)));
        let tool_loop = ToolLoop::new(
            provider,
            executor,
            LoopConfig {
                max_iterations: 3,
                max_tool_calls: 5,
                tool_call_timeout_ms: 10_000,
            },
        );

        let result = tokio::time::timeout(Duration::from_secs(2), tool_loop.run(input()))
            .await
            .expect("batch did not fan out")
            .unwrap();
        assert_eq!(result.content, "All met");
        assert_eq!(result.tool_calls.len(), 3);
        assert!(result.tool_calls.iter().all(|r| r.is_success()));
        let ids: Vec<_> = result.tool_calls.iter().map(|r| r.tool_call_id.as_str()).collect();
        assert_eq!(ids, vec!["call_1", "call_2", "call_3"]);
    }

    #[tokio::test]
    async fn failure_then_recovery_in_next_iteration() {
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(vec![make_tool_call("call_1", "broken", "{}")]),
            make_tool_call_response(vec![make_tool_call("call_2", "good", "{}")]),
            make_text_response("Recovered"),
        ]));
        let executor = Arc::new(
            ScriptedExecutor::new()
                .with("broken", ToolBehavior::Fail("nope".into()))
                .with("good", ToolBehavior::Succeed(serde_json::json!({"ok": true}))),
        );
        let tool_loop = ToolLoop::new(provider, executor, config(5, 5));

        let result = tool_loop.run(input()).await.unwrap();
        assert_eq!(result.content, "Recovered");
        assert_eq!(result.iterations, 3);
        assert!(!result.tool_calls[0].is_success());
        assert!(result.tool_calls[1].is_success());
    }

    #[tokio::test]
    async fn empty_response_completes_with_empty_content() {
        let provider = Arc::new(SequentialMockProvider::single_text(""));
        let tool_loop = ToolLoop::new(provider, Arc::new(ScriptedExecutor::new()), config(3, 3));

        let result = tool_loop.run(input()).await.unwrap();
        assert_eq!(result.content, "");
        assert!(result.stopped_reason.is_none());
    }

    #[tokio::test]
    async fn provider_error_escapes() {
        let provider = Arc::new(FailingProvider);
        let tool_loop = ToolLoop::new(provider, Arc::new(ScriptedExecutor::new()), config(3, 3));

        let err = tool_loop.run(input()).await.unwrap_err();
        assert!(matches!(err, LoopError::Provider(ProviderError::ApiError { status_code: 500, .. })));
    }

    #[tokio::test]
    async fn choiceless_response_is_llm_error() {
        let mut empty = make_text_response("unused");
        empty.choices.clear();
        let provider = Arc::new(SequentialMockProvider::new(vec![empty]));
        let tool_loop = ToolLoop::new(provider, Arc::new(ScriptedExecutor::new()), config(3, 3));

        let err = tool_loop.run(input()).await.unwrap_err();
        assert!(matches!(err, LoopError::Provider(ProviderError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn cancelled_before_start_makes_no_calls() {
        let provider = Arc::new(AlwaysToolProvider::new("lookup", 1));
        let token = CancellationToken::new();
        token.cancel();
        let tool_loop = ToolLoop::new(provider.clone(), Arc::new(ScriptedExecutor::new()), config(5, 5))
            .with_cancellation(token);

        let result = tool_loop.run(input()).await.unwrap();
        assert_eq!(result.stopped_reason, Some(StopReason::Cancelled));
        assert_eq!(provider.call_count(), 0);
    }

    struct CancelAfterFirstBatch {
        token: CancellationToken,
        batches: Mutex<Vec<(u32, usize)>>,
    }

    #[async_trait]
    impl LoopObserver for CancelAfterFirstBatch {
        async fn batch_completed(&self, iteration: u32, records: &[ToolCallRecord]) {
            self.batches.lock().unwrap().push((iteration, records.len()));
            self.token.cancel();
        }
    }

    #[tokio::test]
    async fn cancellation_checked_at_batch_boundary() {
        let provider = Arc::new(AlwaysToolProvider::new("lookup", 2));
        let token = CancellationToken::new();
        let observer = Arc::new(CancelAfterFirstBatch {
            token: token.clone(),
            batches: Mutex::new(vec![]),
        });
        let tool_loop = ToolLoop::new(provider.clone(), Arc::new(ScriptedExecutor::new()), config(5, 50))
            .with_cancellation(token)
            .with_observer(observer.clone());

        let result = tool_loop.run(input()).await.unwrap();
        assert_eq!(result.stopped_reason, Some(StopReason::Cancelled));
        assert_eq!(provider.call_count(), 1);
        assert_eq!(*observer.batches.lock().unwrap(), vec![(1, 2)]);
    }

    #[test]
    fn parse_tool_input_variants() {
        assert_eq!(parse_tool_input("").unwrap(), serde_json::json!({}));
        assert_eq!(parse_tool_input("  ").unwrap(), serde_json::json!({}));
        assert_eq!(parse_tool_input(r#"{"a":1}"#).unwrap(), serde_json::json!({"a": 1}));
        assert!(matches!(parse_tool_input("[1,2]"), Err(ToolInputError::NotAnObject("an array"))));
        assert!(matches!(parse_tool_input("{oops"), Err(ToolInputError::Malformed(_))));
    }

    #[test]
    fn stop_reason_wire_names() {
        assert_eq!(serde_json::to_string(&StopReason::MaxToolCalls).unwrap(), r#""max_tool_calls""#);
        assert_eq!(StopReason::MaxIterations.as_str(), "max_iterations");
    }
}
