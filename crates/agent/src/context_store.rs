//! In-memory context service for the CLI, tests and ephemeral sessions.
//!
//! Chats are owned by the first user who writes to them. Memories are
//! returned most important first; knowledge is matched on shared keywords
//! with the incoming message.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kestrel_core::context::{
    Actor, ContextRequest, ContextService, KnowledgeSnippet, LayeredContext, MemoryItem,
    PersistRequest, UserPreferences,
};
use kestrel_core::error::ContextError;
use kestrel_core::message::Message;
use kestrel_core::provider::ToolDefinition;
use tokio::sync::RwLock;
use tracing::debug;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const DEFAULT_MEMORY_LIMIT: usize = 10;
const KNOWLEDGE_LIMIT: usize = 5;
const MIN_KEYWORD_LEN: usize = 4;

struct Chat {
    owner: String,
    messages: Vec<Message>,
}

#[derive(Default)]
struct Store {
    preferences: HashMap<String, UserPreferences>,
    memories: HashMap<String, Vec<MemoryItem>>,
    knowledge: Vec<KnowledgeSnippet>,
    chats: HashMap<String, Chat>,
}

/// A [`ContextService`] that keeps everything in process memory.
pub struct InMemoryContextService {
    system_prompt: String,
    tools: Vec<ToolDefinition>,
    history_limit: usize,
    memory_limit: usize,
    store: Arc<RwLock<Store>>,
}

impl InMemoryContextService {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            tools: Vec::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            store: Arc::new(RwLock::new(Store::default())),
        }
    }

    /// Tools offered to every actor.
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Keep only the most recent `limit` messages of each chat in the context.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = limit;
        self
    }

    pub async fn set_preferences(&self, user_id: &str, preferences: UserPreferences) {
        self.store
            .write()
            .await
            .preferences
            .insert(user_id.to_string(), preferences);
    }

    pub async fn add_memory(&self, user_id: &str, memory: MemoryItem) {
        self.store
            .write()
            .await
            .memories
            .entry(user_id.to_string())
            .or_default()
            .push(memory);
    }

    pub async fn add_knowledge(&self, snippet: KnowledgeSnippet) {
        self.store.write().await.knowledge.push(snippet);
    }

    /// Full stored transcript of a chat, oldest first.
    pub async fn history(&self, chat_id: &str) -> Vec<Message> {
        self.store
            .read()
            .await
            .chats
            .get(chat_id)
            .map(|chat| chat.messages.clone())
            .unwrap_or_default()
    }
}

impl Default for InMemoryContextService {
    fn default() -> Self {
        Self::new("")
    }
}

fn keywords(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= MIN_KEYWORD_LEN)
        .map(str::to_lowercase)
        .collect()
}

fn relevance(snippet: &KnowledgeSnippet, keywords: &[String]) -> usize {
    let haystack = format!("{} {}", snippet.source_title, snippet.content).to_lowercase();
    keywords.iter().filter(|k| haystack.contains(k.as_str())).count()
}

fn forbidden(chat_id: &str) -> ContextError {
    ContextError::new("FORBIDDEN", format!("chat '{chat_id}' belongs to another user"))
}

#[async_trait]
impl ContextService for InMemoryContextService {
    async fn build_context(
        &self,
        actor: &Actor,
        request: &ContextRequest,
    ) -> Result<LayeredContext, ContextError> {
        let store = self.store.read().await;

        let history = match store.chats.get(&request.chat_id) {
            Some(chat) if chat.owner != actor.user_id => return Err(forbidden(&request.chat_id)),
            Some(chat) => {
                let skip = chat.messages.len().saturating_sub(self.history_limit);
                chat.messages[skip..].to_vec()
            }
            None => Vec::new(),
        };

        let mut memories = store
            .memories
            .get(&actor.user_id)
            .cloned()
            .unwrap_or_default();
        memories.sort_by(|a, b| b.importance.total_cmp(&a.importance));
        memories.truncate(self.memory_limit);

        let words = keywords(&request.user_message);
        let mut scored: Vec<(usize, &KnowledgeSnippet)> = store
            .knowledge
            .iter()
            .map(|s| (relevance(s, &words), s))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        let knowledge = scored
            .into_iter()
            .take(KNOWLEDGE_LIMIT)
            .map(|(_, s)| s.clone())
            .collect::<Vec<_>>();

        debug!(
            chat_id = %request.chat_id,
            history = history.len(),
            memories = memories.len(),
            knowledge = knowledge.len(),
            "Context built"
        );

        Ok(LayeredContext {
            system_prompt: self.system_prompt.clone(),
            preferences: store
                .preferences
                .get(&actor.user_id)
                .cloned()
                .unwrap_or_default(),
            memories,
            knowledge,
            history,
            tools: self.tools.clone(),
        })
    }

    async fn persist_response(
        &self,
        actor: &Actor,
        request: PersistRequest,
    ) -> Result<(), ContextError> {
        let mut store = self.store.write().await;
        let chat = store
            .chats
            .entry(request.chat_id.clone())
            .or_insert_with(|| Chat {
                owner: actor.user_id.clone(),
                messages: Vec::new(),
            });
        if chat.owner != actor.user_id {
            return Err(forbidden(&request.chat_id));
        }

        chat.messages.push(Message::user(request.user_message));
        chat.messages.push(Message::assistant(request.response));
        Ok(())
    }
}
