//! `kestrel ask`: one request, one answer.

use kestrel_agent::OrchestratorResult;
use kestrel_config::AppConfig;

use crate::RequestArgs;
use crate::runtime;

pub async fn run(config: &AppConfig, args: RequestArgs) -> anyhow::Result<()> {
    let orchestrator = runtime::build_orchestrator(config)?;
    let result = orchestrator
        .run(runtime::request(&args))
        .await
        .map_err(|e| anyhow::anyhow!("[{}] {e}", e.code()))?;

    println!("{}", result.content);
    eprintln!("{}", summary(&result));
    Ok(())
}

fn summary(result: &OrchestratorResult) -> String {
    let mut line = format!(
        "-- {} | {} iteration(s) | {} tool call(s) | {} tokens",
        result.model,
        result.iterations,
        result.tool_calls.len(),
        result.usage.total_tokens
    );
    if let Some(reason) = result.stopped_reason {
        line.push_str(&format!(" | stopped: {}", reason.as_str()));
    }
    line
}
