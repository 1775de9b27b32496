//! Shared scripted collaborators for unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kestrel_core::context::{Actor, ContextRequest, ContextService, LayeredContext, PersistRequest};
use kestrel_core::error::{ContextError, ProviderError, ToolError};
use kestrel_core::message::{Message, MessageToolCall};
use kestrel_core::provider::{
    Choice, FinishReason, Provider, ProviderRequest, ProviderResponse, Usage,
};
use kestrel_core::tool::{ToolContext, ToolExecutor, ToolOutcome};

pub fn usage() -> Usage {
    Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    }
}

pub fn tool_context() -> ToolContext {
    ToolContext {
        user_id: "user-1".into(),
        chat_id: "chat-1".into(),
        request_id: "req-1".into(),
    }
}

/// Create a simple text response (no tool calls).
pub fn make_text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        id: "resp".into(),
        model: "mock-model".into(),
        choices: vec![Choice {
            message: Message::assistant(text),
            finish_reason: Some(FinishReason::Stop),
        }],
        usage: usage(),
    }
}

/// Create a response that requests tool calls.
pub fn make_tool_call_response(tool_calls: Vec<MessageToolCall>) -> ProviderResponse {
    ProviderResponse {
        id: "resp".into(),
        model: "mock-model".into(),
        choices: vec![Choice {
            message: Message::assistant_with_tool_calls("", tool_calls),
            finish_reason: Some(FinishReason::ToolCalls),
        }],
        usage: usage(),
    }
}

pub fn make_tool_call(id: &str, name: &str, arguments: &str) -> MessageToolCall {
    MessageToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: arguments.to_string(),
    }
}

/// A mock provider that returns a sequence of scripted responses and
/// records every request it receives.
///
/// Panics if more calls are made than responses provided.
pub struct SequentialMockProvider {
    responses: Mutex<Vec<ProviderResponse>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl SequentialMockProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn single_text(text: &str) -> Self {
        Self::new(vec![make_text_response(text)])
    }

    pub fn tool_then_answer(tool_calls: Vec<MessageToolCall>, answer: &str) -> Self {
        Self::new(vec![
            make_tool_call_response(tool_calls),
            make_text_response(answer),
        ])
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for SequentialMockProvider {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut requests = self.requests.lock().unwrap();
        let responses = self.responses.lock().unwrap();
        let index = requests.len();
        requests.push(request);

        match responses.get(index) {
            Some(response) => Ok(response.clone()),
            None => panic!(
                "SequentialMockProvider: no more responses (call #{}, have {})",
                index,
                responses.len()
            ),
        }
    }
}

/// A provider that requests `per_turn` tool calls on every turn, forever.
pub struct AlwaysToolProvider {
    tool_name: String,
    per_turn: usize,
    calls: AtomicUsize,
}

impl AlwaysToolProvider {
    pub fn new(tool_name: &str, per_turn: usize) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            per_turn,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for AlwaysToolProvider {
    fn name(&self) -> &str {
        "always_tool"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let turn = self.calls.fetch_add(1, Ordering::SeqCst);
        let calls = (0..self.per_turn)
            .map(|i| make_tool_call(&format!("call_{turn}_{i}"), &self.tool_name, "{}"))
            .collect();
        Ok(make_tool_call_response(calls))
    }
}

/// A provider whose every call fails.
pub struct FailingProvider;

#[async_trait]
impl Provider for FailingProvider {
    fn name(&self) -> &str {
        "failing"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::ApiError {
            status_code: 500,
            message: "upstream exploded".into(),
        })
    }
}

/// What a scripted tool does when invoked.
#[derive(Clone)]
pub enum ToolBehavior {
    Succeed(serde_json::Value),
    Fail(String),
    Sleep(Duration),
    /// Wait until every holder of the barrier has arrived.
    Rendezvous(Arc<tokio::sync::Barrier>),
    Panic,
}

/// A tool executor driven by a name → behavior table.
///
/// Unknown tools return `ToolError::NotFound`, except when the table is
/// empty, in which case every call succeeds with `null`.
pub struct ScriptedExecutor {
    behaviors: HashMap<String, ToolBehavior>,
    contexts: Mutex<Vec<ToolContext>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn with(mut self, tool: &str, behavior: ToolBehavior) -> Self {
        self.behaviors.insert(tool.to_string(), behavior);
        self
    }

    pub fn seen_contexts(&self) -> Vec<ToolContext> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        tool_name: &str,
        _input: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutcome, ToolError> {
        self.contexts.lock().unwrap().push(ctx.clone());

        if self.behaviors.is_empty() {
            return Ok(ToolOutcome::ok(serde_json::Value::Null, 1));
        }

        match self.behaviors.get(tool_name).cloned() {
            Some(ToolBehavior::Succeed(value)) => Ok(ToolOutcome::ok(value, 1)),
            Some(ToolBehavior::Fail(reason)) => Ok(ToolOutcome::failed(reason, 1)),
            Some(ToolBehavior::Sleep(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(ToolOutcome::ok(serde_json::json!("late"), duration.as_millis() as u64))
            }
            Some(ToolBehavior::Rendezvous(barrier)) => {
                barrier.wait().await;
                Ok(ToolOutcome::ok(serde_json::json!("met"), 1))
            }
            Some(ToolBehavior::Panic) => panic!("scripted tool panic"),
            None => Err(ToolError::NotFound(tool_name.to_string())),
        }
    }
}

/// A context service returning a fixed context and recording persistence.
pub struct StubContextService {
    context: LayeredContext,
    build_error: Option<ContextError>,
    persist_error: Option<ContextError>,
    persist_panics: bool,
    build_calls: AtomicUsize,
    persisted: Mutex<Vec<PersistRequest>>,
}

impl StubContextService {
    pub fn new(context: LayeredContext) -> Self {
        Self {
            context,
            build_error: None,
            persist_error: None,
            persist_panics: false,
            build_calls: AtomicUsize::new(0),
            persisted: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_build(error: ContextError) -> Self {
        let mut stub = Self::new(LayeredContext::default());
        stub.build_error = Some(error);
        stub
    }

    pub fn failing_persist(mut self, error: ContextError) -> Self {
        self.persist_error = Some(error);
        self
    }

    pub fn panicking_persist(mut self) -> Self {
        self.persist_panics = true;
        self
    }

    pub fn build_calls(&self) -> usize {
        self.build_calls.load(Ordering::SeqCst)
    }

    pub fn persisted(&self) -> Vec<PersistRequest> {
        self.persisted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContextService for StubContextService {
    async fn build_context(
        &self,
        _actor: &Actor,
        _request: &ContextRequest,
    ) -> Result<LayeredContext, ContextError> {
        self.build_calls.fetch_add(1, Ordering::SeqCst);
        match &self.build_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.context.clone()),
        }
    }

    async fn persist_response(
        &self,
        _actor: &Actor,
        request: PersistRequest,
    ) -> Result<(), ContextError> {
        if self.persist_panics {
            panic!("persistence backend crashed");
        }
        self.persisted.lock().unwrap().push(request);
        match &self.persist_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}
