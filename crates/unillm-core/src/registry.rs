//! Build providers from configuration.

use std::sync::Arc;

use crate::cli::{ClaudeCliBackend, CliBackend, CliProvider, GeminiCliBackend};
use crate::config::Config;
use crate::error::Result;
use crate::http::{AnthropicBackend, HttpBackend, HttpProvider, OpenAiBackend};
use crate::provider::{Provider, ProviderKind};

/// Create the provider for `kind` using the settings in `config`.
///
/// Fails when a required API key is missing or a CLI executable cannot be
/// found.
pub fn connect(kind: ProviderKind, config: &Config) -> Result<Arc<dyn Provider>> {
    let settings = config.settings(kind);
    tracing::debug!(provider = %kind, model = %settings.default_model, "connecting provider");

    let provider: Arc<dyn Provider> = match kind {
        ProviderKind::Anthropic => Arc::new(HttpProvider::new(AnthropicBackend, settings)?),
        ProviderKind::OpenAi => Arc::new(HttpProvider::new(OpenAiBackend::openai(), settings)?),
        ProviderKind::Ollama => Arc::new(HttpProvider::new(OpenAiBackend::ollama(), settings)?),
        ProviderKind::ClaudeCli => Arc::new(CliProvider::new(ClaudeCliBackend, settings)?),
        ProviderKind::GeminiCli => Arc::new(CliProvider::new(GeminiCliBackend, settings)?),
    };
    Ok(provider)
}

/// Human-readable name for `kind`, without connecting.
pub fn display_name(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Anthropic => AnthropicBackend.display_name(),
        ProviderKind::OpenAi => OpenAiBackend::openai().display_name(),
        ProviderKind::Ollama => OpenAiBackend::ollama().display_name(),
        ProviderKind::ClaudeCli => ClaudeCliBackend.display_name(),
        ProviderKind::GeminiCli => GeminiCliBackend.display_name(),
    }
}

/// The well-known models for `kind`.
///
/// Needs no credentials or executable, so it works before anything is
/// configured.
pub fn static_models(kind: ProviderKind) -> Vec<String> {
    match kind {
        ProviderKind::Anthropic => AnthropicBackend.models(),
        ProviderKind::OpenAi => OpenAiBackend::openai().models(),
        ProviderKind::Ollama => OpenAiBackend::ollama().models(),
        ProviderKind::ClaudeCli => ClaudeCliBackend.models(),
        ProviderKind::GeminiCli => GeminiCliBackend.models(),
    }
}

/// Provider kinds that `config` has enough settings to connect.
///
/// HTTP backends need a key unless they are keyless; CLI backends are
/// always listed since their executable is only checked on connect.
pub fn configured_kinds(config: &Config) -> Vec<ProviderKind> {
    ProviderKind::ALL
        .into_iter()
        .filter(|kind| match kind {
            ProviderKind::Anthropic | ProviderKind::OpenAi => !config.api_key(*kind).is_empty(),
            _ => true,
        })
        .collect()
}
