//! Kestrel CLI entry point.
//!
//! Commands:
//! - `ask`     run one request and print the answer
//! - `stream`  run one request and print its events as JSON lines
//! - `config`  print the effective configuration

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use kestrel_config::ConfigOverrides;

mod commands;
mod runtime;

#[derive(Parser)]
#[command(
    name = "kestrel",
    about = "Kestrel: bounded agentic orchestration",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Config file (defaults to ~/.kestrel/config.toml)
    #[arg(short, long, global = true, env = "KESTREL_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message and print the final answer
    Ask(RequestArgs),

    /// Send one message and print every lifecycle event
    Stream(RequestArgs),

    /// Show the effective configuration (API key redacted)
    Config,
}

/// Flags shared by `ask` and `stream`.
#[derive(Args)]
pub struct RequestArgs {
    /// The message to send
    message: String,

    /// Conversation to continue
    #[arg(long, default_value = "cli")]
    chat: String,

    /// User the request runs as
    #[arg(long, default_value = "local", env = "KESTREL_USER")]
    user: String,

    /// Model override for this request
    #[arg(short, long)]
    model: Option<String>,

    /// Temperature override
    #[arg(long)]
    temperature: Option<f32>,

    /// Maximum model calls
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Maximum tool calls across the request
    #[arg(long)]
    max_tool_calls: Option<usize>,

    /// Per-call tool timeout in milliseconds
    #[arg(long)]
    tool_timeout_ms: Option<u64>,
}

impl RequestArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: None,
            max_iterations: self.max_iterations,
            max_tool_calls: self.max_tool_calls,
            tool_call_timeout_ms: self.tool_timeout_ms,
        }
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if verbose { "debug" } else { "info" })
    });

    // Logs go to stderr so stdout stays clean for answers and events
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json);

    let config = runtime::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Ask(args) => commands::ask::run(&config, args).await?,
        Commands::Stream(args) => commands::stream::run(&config, args).await?,
        Commands::Config => commands::config_cmd::show(&config)?,
    }

    Ok(())
}
