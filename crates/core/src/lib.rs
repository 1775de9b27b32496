//! # Kestrel Core
//!
//! Domain types, collaborator traits, and error definitions for the Kestrel
//! orchestration engine. This crate has **no framework dependencies**: it
//! defines the model that every other crate implements against.
//!
//! ## Collaborators
//!
//! The engine drives three external capabilities, each defined as a trait here
//! and injected at construction:
//! - [`Provider`]: the model client
//! - [`ToolExecutor`]: the tool-execution boundary
//! - [`ContextService`]: layered-context assembly and response persistence
//!
//! Implementations live in their own crates (or in the host application),
//! which keeps tests free to swap in scripted stand-ins.

pub mod context;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use context::{
    Actor, ContextRequest, ContextService, Formality, KnowledgeSnippet, LayeredContext,
    MemoryItem, PersistRequest, ResponseLength, UserPreferences,
};
pub use error::{ContextError, ProviderError, ToolError};
pub use event::{DomainEvent, EventBus};
pub use message::{Message, MessageToolCall, Role};
pub use provider::{
    Choice, FinishReason, Provider, ProviderRequest, ProviderResponse, StreamChunk,
    ToolDefinition, Usage,
};
pub use tool::{
    Tool, ToolCallRecord, ToolCallStatus, ToolContext, ToolExecutor, ToolOutcome, ToolRegistry,
};
