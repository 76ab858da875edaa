//! CLI entry point for unillm.
//!
//! This binary provides the `unillm` command with subcommands for sending a
//! prompt to any configured provider, listing models, and checking which
//! providers are usable.

mod helpers;

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};
use unillm_core::registry::{display_name, static_models};
use unillm_core::{
    ChatRequest, Config, ErrorKind, Message, ProviderKind, Response, StreamEvent, connect,
};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// unillm: one client for HTTP and command-line LLM backends.
#[derive(Parser)]
#[command(
    name = "unillm",
    version,
    about = "Talk to Anthropic, OpenAI, Ollama, Claude CLI and Gemini CLI through one interface"
)]
struct Cli {
    /// Path to a TOML config file (falls back to $UNILLM_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a single prompt and print the answer.
    Ask(AskArgs),

    /// List the well-known models of one or every provider.
    Models {
        /// Provider to list (anthropic, openai, ollama, claude-cli, gemini-cli).
        #[arg(long)]
        provider: Option<String>,
    },

    /// Show every provider and whether it can be connected.
    Providers,
}

#[derive(Args)]
struct AskArgs {
    /// Provider to use (falls back to $UNILLM_PROVIDER, then anthropic).
    #[arg(long, short)]
    provider: Option<String>,

    /// Model override; the provider's default model is used otherwise.
    #[arg(long, short)]
    model: Option<String>,

    /// System prompt.
    #[arg(long, short)]
    system: Option<String>,

    /// Upper bound on generated tokens.
    #[arg(long)]
    max_tokens: Option<u32>,

    /// Wait for the whole answer instead of streaming it.
    #[arg(long)]
    no_stream: bool,

    /// The prompt to send.
    prompt: String,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    helpers::init_tracing("warn");

    let config = helpers::load_config(cli.config)?;

    match cli.command {
        Commands::Ask(args) => cmd_ask(&config, args).await,
        Commands::Models { provider } => cmd_models(&config, provider.as_deref()),
        Commands::Providers => cmd_providers(&config),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: ask
// ---------------------------------------------------------------------------

async fn cmd_ask(config: &Config, args: AskArgs) -> Result<()> {
    let kind = helpers::provider_kind(
        args.provider.as_deref(),
        std::env::var(helpers::PROVIDER_ENV_VAR).ok(),
    )?;
    let provider =
        connect(kind, config).with_context(|| format!("failed to connect to {kind}"))?;

    let mut request = ChatRequest::new(vec![Message::user(args.prompt)])
        .with_cancel(helpers::cancel_on_ctrl_c());
    if let Some(system) = args.system {
        request = request.with_system_prompt(system);
    }
    if let Some(model) = args.model {
        request = request.with_model(model);
    }
    if let Some(max_tokens) = args.max_tokens {
        request = request.with_max_tokens(max_tokens);
    }

    info!(provider = %kind, stream = !args.no_stream, "sending prompt");

    let result = if args.no_stream {
        provider.chat(&request).await.map(|response| {
            println!("{}", response.text());
            response
        })
    } else {
        let mut on_event = |event: StreamEvent| {
            if let StreamEvent::Delta(text) = event {
                print!("{text}");
                io::stdout().flush().ok();
            }
        };
        let result = provider.chat_stream(&request, &mut on_event).await;
        println!();
        result
    };

    match result {
        Ok(response) => {
            log_usage(&response);
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::Cancelled => {
            eprintln!("  Interrupted.");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("{} request failed", display_name(kind))),
    }
}

fn log_usage(response: &Response) {
    if let Some(usage) = &response.usage {
        debug!(
            model = %response.model,
            stop_reason = ?response.stop_reason,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "request complete"
        );
    }
}

// ---------------------------------------------------------------------------
// Subcommand: models
// ---------------------------------------------------------------------------

fn cmd_models(config: &Config, provider: Option<&str>) -> Result<()> {
    let kinds = match provider {
        Some(name) => vec![helpers::provider_kind(Some(name), None)?],
        None => ProviderKind::ALL.to_vec(),
    };

    for kind in kinds {
        let default_model = config.default_model(kind);
        println!("{} ({kind})", display_name(kind));
        for model in static_models(kind) {
            let marker = if model == default_model { " (default)" } else { "" };
            println!("  {model}{marker}");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: providers
// ---------------------------------------------------------------------------

fn cmd_providers(config: &Config) -> Result<()> {
    println!("  {:<12} {:<18} {:<26} STATUS", "KIND", "NAME", "DEFAULT MODEL");
    for kind in ProviderKind::ALL {
        let status = match connect(kind, config) {
            Ok(_) => "ready".to_owned(),
            Err(e) => e.to_string(),
        };
        println!(
            "  {:<12} {:<18} {:<26} {status}",
            kind.as_str(),
            display_name(kind),
            config.default_model(kind)
        );
    }
    Ok(())
}
