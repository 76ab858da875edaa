//! Shared helper functions used across CLI subcommands.
//!
//! Includes tracing initialization, configuration loading, provider
//! selection, and Ctrl-C handling.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use unillm_core::{Config, ProviderKind};

/// Environment variable naming a config file when `--config` is absent.
pub const CONFIG_ENV_VAR: &str = "UNILLM_CONFIG";

/// Environment variable naming the provider when `--provider` is absent.
pub const PROVIDER_ENV_VAR: &str = "UNILLM_PROVIDER";

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
///
/// Logs go to stderr so streamed answers on stdout stay clean.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Pick the config file: the flag wins, then `UNILLM_CONFIG`.
pub fn config_path(flag: Option<PathBuf>, env_value: Option<String>) -> Option<PathBuf> {
    flag.or_else(|| env_value.filter(|v| !v.is_empty()).map(PathBuf::from))
}

/// Load the config file (if any) and overlay the process environment.
pub fn load_config(flag: Option<PathBuf>) -> Result<Config> {
    let config = match config_path(flag, std::env::var(CONFIG_ENV_VAR).ok()) {
        Some(path) => Config::load(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    Ok(config.with_env_overrides())
}

// ---------------------------------------------------------------------------
// Provider selection
// ---------------------------------------------------------------------------

/// Resolve the provider: the flag wins, then `UNILLM_PROVIDER`, then Anthropic.
pub fn provider_kind(flag: Option<&str>, env_value: Option<String>) -> Result<ProviderKind> {
    match flag.map(str::to_owned).or(env_value.filter(|v| !v.is_empty())) {
        Some(name) => name
            .parse()
            .with_context(|| format!("unknown provider '{name}'")),
        None => Ok(ProviderKind::Anthropic),
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// A token that is cancelled when the user presses Ctrl-C.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    cancel
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_flag_beats_environment() {
        let kind = provider_kind(Some("ollama"), Some("openai".into())).unwrap();
        assert_eq!(kind, ProviderKind::Ollama);

        let kind = provider_kind(None, Some("gemini-cli".into())).unwrap();
        assert_eq!(kind, ProviderKind::GeminiCli);
    }

    #[test]
    fn provider_defaults_to_anthropic() {
        assert_eq!(provider_kind(None, None).unwrap(), ProviderKind::Anthropic);
        assert_eq!(
            provider_kind(None, Some(String::new())).unwrap(),
            ProviderKind::Anthropic
        );
    }

    #[test]
    fn unknown_provider_is_reported() {
        let err = provider_kind(Some("palm"), None).unwrap_err();
        assert!(err.to_string().contains("palm"));
    }

    #[test]
    fn config_flag_beats_environment() {
        let path = config_path(Some("a.toml".into()), Some("b.toml".into()));
        assert_eq!(path, Some(PathBuf::from("a.toml")));
        assert_eq!(config_path(None, Some("b.toml".into())), Some(PathBuf::from("b.toml")));
        assert_eq!(config_path(None, Some(String::new())), None);
    }
}
