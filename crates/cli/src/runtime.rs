//! Wiring: config in, ready-to-use orchestrator out.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use kestrel_agent::{InMemoryContextService, Orchestrator, OrchestratorInput};
use kestrel_config::AppConfig;
use kestrel_core::context::Actor;
use kestrel_core::tool::ToolExecutor;
use kestrel_providers::OpenAiCompatProvider;

use crate::RequestArgs;

pub fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load_with_env(path),
        None => AppConfig::load(),
    };
    config.context("Failed to load config")
}

pub fn build_orchestrator(config: &AppConfig) -> anyhow::Result<Orchestrator> {
    let Some(api_key) = config.api_key.as_deref() else {
        bail!(
            "No API key found. Set KESTREL_API_KEY (or OPENROUTER_API_KEY / OPENAI_API_KEY), \
             or add api_key to {}",
            AppConfig::config_dir().join("config.toml").display()
        );
    };

    let provider = OpenAiCompatProvider::new("openai_compat", &config.api_url, api_key)
        .context("Failed to create model client")?;

    let registry = kestrel_tools::builtin_registry();
    let context = InMemoryContextService::new(config.system_prompt.clone())
        .with_tools(registry.definitions());
    let tools: Arc<dyn ToolExecutor> = Arc::new(registry);

    tracing::debug!(api_url = %config.api_url, model = %config.default_model, "Orchestrator ready");
    Ok(Orchestrator::new(
        Arc::new(provider),
        tools,
        Arc::new(context),
        config.orchestrator(),
    ))
}

pub fn request(args: &RequestArgs) -> OrchestratorInput {
    OrchestratorInput::new(Actor::user(&args.user), &args.chat, &args.message)
        .with_overrides(args.overrides())
}
