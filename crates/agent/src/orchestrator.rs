//! The orchestrator: the public façade over context, prompt and tool loop.
//!
//! Two execution modes share one pipeline:
//! - [`Orchestrator::run`] returns a single aggregate [`OrchestratorResult`]
//! - [`Orchestrator::stream`] returns a channel of [`StreamEvent`]s fed by a
//!   spawned supervisor task
//!
//! Failures are contained by layer. Tool faults never leave the loop. Model
//! client faults become `LLM_ERROR`. Context faults keep the collaborator's
//! code. Persistence faults are logged and published but never change a
//! result that was already produced.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use kestrel_config::{ConfigOverrides, LoopConfig, OrchestratorConfig};
use kestrel_core::context::{Actor, ContextRequest, ContextService, PersistRequest};
use kestrel_core::error::{ContextError, ProviderError};
use kestrel_core::event::{DomainEvent, EventBus};
use kestrel_core::provider::{Provider, Usage};
use kestrel_core::tool::{ToolCallRecord, ToolContext, ToolExecutor};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::prompt::{PromptBuilder, PromptInput};
use crate::stream_event::StreamEvent;
use crate::tool_loop::{LoopError, LoopInput, LoopObserver, LoopResult, StopReason, ToolLoop};

const STREAM_BUFFER: usize = 64;

/// A request-level failure.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Model call failed: {0}")]
    Llm(ProviderError),

    #[error("Context assembly failed: {0}")]
    Context(#[from] ContextError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Machine-readable error code.
    pub fn code(&self) -> &str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Llm(_) => "LLM_ERROR",
            Self::Context(e) => &e.code,
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<LoopError> for OrchestratorError {
    fn from(err: LoopError) -> Self {
        match err {
            LoopError::Provider(e) => Self::Llm(e),
        }
    }
}

/// One orchestration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorInput {
    pub actor: Actor,
    pub chat_id: String,
    pub message: String,
    #[serde(default)]
    pub overrides: ConfigOverrides,
    /// Caller-supplied correlation id; a UUID is generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl OrchestratorInput {
    pub fn new(actor: Actor, chat_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            actor,
            chat_id: chat_id.into(),
            message: message.into(),
            overrides: ConfigOverrides::default(),
            request_id: None,
        }
    }

    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// The public result of a `run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorResult {
    pub request_id: String,
    pub content: String,
    pub model: String,
    pub iterations: u32,
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_reason: Option<StopReason>,
    pub usage: Usage,
}

impl OrchestratorResult {
    fn from_loop(request_id: String, result: LoopResult) -> Self {
        Self {
            request_id,
            content: result.content,
            model: result.model,
            iterations: result.iterations,
            tool_calls: result.tool_calls,
            stopped_reason: result.stopped_reason,
            usage: result.usage,
        }
    }
}

/// A validated request with its context built and prompt assembled.
struct Prepared {
    request_id: String,
    actor: Actor,
    chat_id: String,
    message: String,
}

/// The façade. Cheap to clone; every clone shares the same collaborators.
#[derive(Clone)]
pub struct Orchestrator {
    provider: Arc<dyn Provider>,
    tools: Arc<dyn ToolExecutor>,
    context: Arc<dyn ContextService>,
    config: OrchestratorConfig,
    event_bus: Arc<EventBus>,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<dyn ToolExecutor>,
        context: Arc<dyn ContextService>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            context,
            config,
            event_bus: Arc::new(EventBus::default()),
        }
    }

    /// Publish operator events to a shared bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Run a request to completion and return one aggregate result.
    pub async fn run(
        &self,
        input: OrchestratorInput,
    ) -> Result<OrchestratorResult, OrchestratorError> {
        let request_id = request_id_for(&input);

        let (prepared, result) = match self.execute_guarded(&request_id, input, None).await {
            Ok(done) => done,
            Err(e) => {
                self.report_failure(&request_id, &e);
                return Err(e);
            }
        };

        self.persist(&prepared, &result).await;
        Ok(OrchestratorResult::from_loop(prepared.request_id, result))
    }

    /// Run a request, emitting lifecycle events as it progresses.
    ///
    /// Dropping the receiver cancels the request at the next iteration or
    /// batch boundary.
    pub fn stream(&self, input: OrchestratorInput) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let this = self.clone();
        tokio::spawn(async move { this.supervise_stream(input, tx).await });
        rx
    }

    async fn supervise_stream(self, input: OrchestratorInput, tx: mpsc::Sender<StreamEvent>) {
        let request_id = request_id_for(&input);
        let model = input
            .overrides
            .model
            .clone()
            .unwrap_or_else(|| self.config.model.clone());

        // Consumer hang-up cancels the run; finishing the run releases the watcher.
        let cancel = CancellationToken::new();
        let _release_watcher = cancel.clone().drop_guard();
        tokio::spawn({
            let tx = tx.clone();
            let cancel = cancel.clone();
            async move {
                tokio::select! {
                    _ = tx.closed() => cancel.cancel(),
                    _ = cancel.cancelled() => {}
                }
            }
        });

        if !emit(
            &tx,
            StreamEvent::MessageStart {
                request_id: request_id.clone(),
                model,
            },
        )
        .await
        {
            return;
        }

        let observer: Arc<dyn LoopObserver> = Arc::new(StreamObserver {
            tx: tx.clone(),
            cancel: cancel.clone(),
        });
        let outcome = self
            .execute_guarded(&request_id, input, Some((observer, cancel.clone())))
            .await;

        match outcome {
            Ok((prepared, result)) => {
                if result.stopped_reason == Some(StopReason::Cancelled) || tx.is_closed() {
                    debug!(request_id = %request_id, "Stream abandoned by consumer");
                    return;
                }

                let complete = StreamEvent::MessageComplete {
                    model: result.model.clone(),
                    iterations: result.iterations,
                    tool_calls_made: result.tool_calls.len(),
                    stopped_reason: result.stopped_reason,
                    usage: result.usage,
                };
                let delivered = emit(
                    &tx,
                    StreamEvent::MessageDelta {
                        content: result.content.clone(),
                    },
                )
                .await
                    && emit(&tx, complete).await;

                self.persist(&prepared, &result).await;

                if delivered {
                    emit(&tx, StreamEvent::Done { request_id }).await;
                }
            }
            Err(e) => {
                self.report_failure(&request_id, &e);
                let _ = emit(
                    &tx,
                    StreamEvent::Error {
                        code: e.code().to_string(),
                        message: e.to_string(),
                    },
                )
                .await
                    && emit(&tx, StreamEvent::Done { request_id }).await;
            }
        }
    }

    /// [`Self::execute`] with collaborator panics turned into `INTERNAL_ERROR`.
    async fn execute_guarded(
        &self,
        request_id: &str,
        input: OrchestratorInput,
        streaming: Option<(Arc<dyn LoopObserver>, CancellationToken)>,
    ) -> Result<(Prepared, LoopResult), OrchestratorError> {
        AssertUnwindSafe(self.execute(request_id, input, streaming))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(OrchestratorError::Internal(
                    "orchestration pipeline panicked".to_string(),
                ))
            })
    }

    /// Validate, build context, build the prompt, and run the loop.
    async fn execute(
        &self,
        request_id: &str,
        input: OrchestratorInput,
        streaming: Option<(Arc<dyn LoopObserver>, CancellationToken)>,
    ) -> Result<(Prepared, LoopResult), OrchestratorError> {
        let (prepared, loop_input, loop_config) = self.prepare(request_id, input).await?;

        let mut tool_loop = ToolLoop::new(self.provider.clone(), self.tools.clone(), loop_config);
        if let Some((observer, cancel)) = streaming {
            tool_loop = tool_loop.with_observer(observer).with_cancellation(cancel);
        }

        let result = tool_loop.run(loop_input).await?;
        self.publish_outcome(&prepared, &result);
        Ok((prepared, result))
    }

    async fn prepare(
        &self,
        request_id: &str,
        input: OrchestratorInput,
    ) -> Result<(Prepared, LoopInput, LoopConfig), OrchestratorError> {
        let OrchestratorInput {
            actor,
            chat_id,
            message,
            overrides,
            ..
        } = input;

        if actor.user_id.trim().is_empty() {
            return Err(OrchestratorError::Validation("actor user id must not be empty".into()));
        }
        if chat_id.trim().is_empty() {
            return Err(OrchestratorError::Validation("chat id must not be empty".into()));
        }
        if message.trim().is_empty() {
            return Err(OrchestratorError::Validation("message must not be empty".into()));
        }

        let config = self.config.merge(&overrides);
        config
            .validate()
            .map_err(|e| OrchestratorError::Validation(e.to_string()))?;

        info!(
            request_id,
            user_id = %actor.user_id,
            chat_id = %chat_id,
            model = %config.model,
            "Orchestrating request"
        );

        let context = self
            .context
            .build_context(
                &actor,
                &ContextRequest {
                    chat_id: chat_id.clone(),
                    user_message: message.clone(),
                },
            )
            .await?;

        let prompt = PromptBuilder::build(&PromptInput {
            context: &context,
            user_message: &message,
        });
        debug!(
            request_id,
            messages = prompt.messages.len(),
            tools = prompt.tools.len(),
            estimated_tokens = prompt.estimated_tokens,
            "Prompt built"
        );

        let loop_input = LoopInput {
            messages: prompt.messages,
            model: config.model.clone(),
            tools: prompt.tools,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            context: ToolContext {
                user_id: actor.user_id.clone(),
                chat_id: chat_id.clone(),
                request_id: request_id.to_string(),
            },
        };

        let prepared = Prepared {
            request_id: request_id.to_string(),
            actor,
            chat_id,
            message,
        };
        Ok((prepared, loop_input, config.loop_config))
    }

    /// Best-effort persistence of a produced response.
    async fn persist(&self, prepared: &Prepared, result: &LoopResult) {
        let request = PersistRequest {
            chat_id: prepared.chat_id.clone(),
            request_id: prepared.request_id.clone(),
            user_message: prepared.message.clone(),
            response: result.content.clone(),
            model: result.model.clone(),
            usage: result.usage,
            tool_calls: result.tool_calls.clone(),
        };

        let outcome = AssertUnwindSafe(self.context.persist_response(&prepared.actor, request))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ContextError::storage("persistence panicked")));

        if let Err(e) = outcome {
            warn!(
                request_id = %prepared.request_id,
                chat_id = %prepared.chat_id,
                error = %e,
                "Failed to persist response"
            );
            self.event_bus.publish(DomainEvent::PersistenceFailed {
                request_id: prepared.request_id.clone(),
                chat_id: prepared.chat_id.clone(),
                error_message: e.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    fn publish_outcome(&self, prepared: &Prepared, result: &LoopResult) {
        let now = Utc::now();
        for record in &result.tool_calls {
            self.event_bus.publish(DomainEvent::ToolExecuted {
                request_id: prepared.request_id.clone(),
                tool_name: record.tool_name.clone(),
                success: record.is_success(),
                duration_ms: record.duration_ms,
                timestamp: now,
            });
        }

        match result.stopped_reason {
            Some(reason @ (StopReason::MaxIterations | StopReason::MaxToolCalls)) => {
                self.event_bus.publish(DomainEvent::LoopLimitReached {
                    request_id: prepared.request_id.clone(),
                    reason: reason.as_str().to_string(),
                    iterations: result.iterations,
                    tool_calls: result.tool_calls.len(),
                    timestamp: now,
                });
            }
            Some(StopReason::Cancelled) => return,
            None => {}
        }

        self.event_bus.publish(DomainEvent::ResponseGenerated {
            request_id: prepared.request_id.clone(),
            model: result.model.clone(),
            iterations: result.iterations,
            tokens_used: result.usage.total_tokens,
            timestamp: now,
        });
    }

    fn report_failure(&self, request_id: &str, error: &OrchestratorError) {
        warn!(request_id, code = error.code(), error = %error, "Request failed");
        self.event_bus.publish(DomainEvent::ErrorOccurred {
            request_id: request_id.to_string(),
            code: error.code().to_string(),
            error_message: error.to_string(),
            timestamp: Utc::now(),
        });
    }
}

fn request_id_for(input: &OrchestratorInput) -> String {
    input
        .request_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Send one event; `false` once the consumer is gone.
async fn emit(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    tx.send(event).await.is_ok()
}

/// Forwards completed tool batches into the event stream.
struct StreamObserver {
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
}

#[async_trait]
impl LoopObserver for StreamObserver {
    async fn batch_completed(&self, _iteration: u32, records: &[ToolCallRecord]) {
        for record in records {
            for event in StreamEvent::tool_pair(record) {
                if !emit(&self.tx, event).await {
                    self.cancel.cancel();
                    return;
                }
            }
        }
    }
}
