//! `kestrel stream`: print each lifecycle event as a JSON line.

use kestrel_agent::StreamEvent;
use kestrel_config::AppConfig;

use crate::RequestArgs;
use crate::runtime;

pub async fn run(config: &AppConfig, args: RequestArgs) -> anyhow::Result<()> {
    let orchestrator = runtime::build_orchestrator(config)?;
    let mut events = orchestrator.stream(runtime::request(&args));

    let mut failed = None;
    while let Some(event) = events.recv().await {
        println!("{}", serde_json::to_string(&event)?);
        if let StreamEvent::Error { code, message } = &event {
            failed = Some(format!("[{code}] {message}"));
        }
    }

    match failed {
        Some(reason) => anyhow::bail!(reason),
        None => Ok(()),
    }
}
