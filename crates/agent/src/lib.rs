//! The bounded orchestration engine at the heart of Kestrel.
//!
//! A request flows strictly downward:
//!
//! 1. **Build context** through the injected [`ContextService`](kestrel_core::ContextService)
//! 2. **Build the prompt**: [`PromptBuilder`] layers instructions, preferences,
//!    memories, knowledge, history, and the current message
//! 3. **Run the tool loop**: [`ToolLoop`] submits the transcript, fans out any
//!    requested tool calls, appends their results, and resubmits until the
//!    model answers or a safety limit trips
//! 4. **Deliver**: [`Orchestrator::run`] returns one aggregate result,
//!    [`Orchestrator::stream`] emits [`StreamEvent`]s as the request progresses
//! 5. **Persist** the final answer, best-effort
//!
//! Every request owns its transcript, counters, and config snapshot. The only
//! shared collaborators are the model client and the tool executor.

pub mod context_store;
pub mod orchestrator;
pub mod prompt;
pub mod stream_event;
pub mod token;
pub mod tool_loop;

#[cfg(test)]
mod test_helpers;

pub use context_store::InMemoryContextService;
pub use orchestrator::{Orchestrator, OrchestratorError, OrchestratorInput, OrchestratorResult};
pub use prompt::{BuiltPrompt, CORE_INSTRUCTIONS, PromptBuilder, PromptInput};
pub use stream_event::StreamEvent;
pub use tool_loop::{
    DEGRADED_RESPONSE, LoopError, LoopInput, LoopObserver, LoopResult, StopReason, ToolLoop,
};
