//! Provider configuration.
//!
//! Credentials and defaults are carried by an explicit [`Config`] value,
//! built from an optional TOML file and then overlaid with environment
//! variables:
//!
//! ```toml
//! [providers.anthropic]
//! api_key = "sk-ant-..."
//! default_model = "claude-sonnet-4-20250514"
//!
//! [providers.claude-cli]
//! executable = "/opt/claude/bin/claude"
//! persist_session = true
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cli::claude::CLAUDE_CLI_DEFAULT_MODEL;
use crate::cli::gemini::GEMINI_CLI_DEFAULT_MODEL;
use crate::error::{LlmError, Result};
use crate::http::anthropic::{ANTHROPIC_BASE_URL, ANTHROPIC_DEFAULT_MODEL};
use crate::http::openai::{OLLAMA_BASE_URL, OLLAMA_DEFAULT_MODEL, OPENAI_BASE_URL, OPENAI_DEFAULT_MODEL};
use crate::provider::ProviderKind;
use crate::types::DEFAULT_MAX_TOKENS;

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

// ---------------------------------------------------------------------------
// Per-provider settings
// ---------------------------------------------------------------------------

/// Fully resolved settings for one provider.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// API key; empty when the backend needs none.
    pub api_key: String,

    /// Base URL for HTTP backends; unused by CLI backends.
    pub base_url: String,

    /// Model used when a request names none.
    pub default_model: String,

    /// `max_tokens` used when a request leaves it at 0.
    pub max_tokens: u32,

    /// HTTP request timeout.
    pub timeout_secs: u64,

    /// Explicit path to a CLI executable.
    pub executable: Option<PathBuf>,

    /// Resume the CLI session reported by the previous call.
    pub persist_session: bool,
}

impl ProviderSettings {
    /// Built-in defaults for `kind`, with no credentials.
    pub fn for_kind(kind: ProviderKind) -> Self {
        let (base_url, default_model) = match kind {
            ProviderKind::Anthropic => (ANTHROPIC_BASE_URL, ANTHROPIC_DEFAULT_MODEL),
            ProviderKind::OpenAi => (OPENAI_BASE_URL, OPENAI_DEFAULT_MODEL),
            ProviderKind::Ollama => (OLLAMA_BASE_URL, OLLAMA_DEFAULT_MODEL),
            ProviderKind::ClaudeCli => ("", CLAUDE_CLI_DEFAULT_MODEL),
            ProviderKind::GeminiCli => ("", GEMINI_CLI_DEFAULT_MODEL),
        };
        Self {
            api_key: String::new(),
            base_url: base_url.to_owned(),
            default_model: default_model.to_owned(),
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            executable: None,
            persist_session: false,
        }
    }

    fn apply(&mut self, overrides: &ProviderOverrides) {
        if let Some(key) = &overrides.api_key {
            self.api_key.clone_from(key);
        }
        if let Some(url) = &overrides.base_url {
            self.base_url.clone_from(url);
        }
        if let Some(model) = &overrides.default_model {
            self.default_model.clone_from(model);
        }
        if let Some(max_tokens) = overrides.max_tokens {
            self.max_tokens = max_tokens;
        }
        if let Some(timeout) = overrides.timeout_secs {
            self.timeout_secs = timeout;
        }
        if let Some(path) = &overrides.executable {
            self.executable = Some(path.clone());
        }
        if let Some(persist) = overrides.persist_session {
            self.persist_session = persist;
        }
    }
}

// The API key must never end up in logs.
impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("api_key", &if self.api_key.is_empty() { "" } else { "<redacted>" })
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .field("max_tokens", &self.max_tokens)
            .field("timeout_secs", &self.timeout_secs)
            .field("executable", &self.executable)
            .field("persist_session", &self.persist_session)
            .finish()
    }
}

/// One `[providers.<kind>]` table; unset fields keep the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderOverrides {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub max_tokens: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub executable: Option<PathBuf>,
    pub persist_session: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    providers: HashMap<String, ProviderOverrides>,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Settings for every provider kind.
#[derive(Debug, Clone, Default)]
pub struct Config {
    providers: HashMap<ProviderKind, ProviderOverrides>,
}

impl Config {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content).map_err(|e| LlmError::Config {
            reason: format!("failed to parse TOML config: {e}"),
        })?;

        let mut providers = HashMap::with_capacity(file.providers.len());
        for (name, overrides) in file.providers {
            let kind: ProviderKind = name.parse()?;
            providers.insert(kind, overrides);
        }
        Ok(Self { providers })
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| LlmError::Config {
            reason: format!("failed to read config file {}: {e}", path.display()),
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), providers = config.providers.len(), "config loaded");
        Ok(config)
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Overlay values from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
    }

    /// Overlay values from `lookup`, which plays the role of the environment.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        for (kind, key_var, url_var) in [
            (ProviderKind::Anthropic, "ANTHROPIC_API_KEY", "ANTHROPIC_BASE_URL"),
            (ProviderKind::OpenAi, "OPENAI_API_KEY", "OPENAI_BASE_URL"),
        ] {
            if let Some(key) = lookup(key_var) {
                self.providers.entry(kind).or_default().api_key = Some(key);
            }
            if let Some(url) = lookup(url_var) {
                self.providers.entry(kind).or_default().base_url = Some(url);
            }
        }

        if let Some(host) = lookup("OLLAMA_HOST") {
            self.providers
                .entry(ProviderKind::Ollama)
                .or_default()
                .base_url = Some(ollama_base_url(&host));
        }

        for kind in ProviderKind::ALL {
            if let Some(model) = lookup(&model_env_var(kind)) {
                self.providers.entry(kind).or_default().default_model = Some(model);
            }
        }

        self
    }

    /// Replace the overrides for one provider.
    pub fn set(&mut self, kind: ProviderKind, overrides: ProviderOverrides) {
        self.providers.insert(kind, overrides);
    }

    /// Resolved settings for `kind`.
    pub fn settings(&self, kind: ProviderKind) -> ProviderSettings {
        let mut settings = ProviderSettings::for_kind(kind);
        if let Some(overrides) = self.providers.get(&kind) {
            settings.apply(overrides);
        }
        settings
    }

    pub fn api_key(&self, kind: ProviderKind) -> String {
        self.settings(kind).api_key
    }

    pub fn base_url(&self, kind: ProviderKind) -> String {
        self.settings(kind).base_url
    }

    pub fn default_model(&self, kind: ProviderKind) -> String {
        self.settings(kind).default_model
    }
}

/// `UNILLM_CLAUDE_CLI_MODEL` for `claude-cli`, and so on.
pub fn model_env_var(kind: ProviderKind) -> String {
    format!(
        "UNILLM_{}_MODEL",
        kind.as_str().to_ascii_uppercase().replace('-', "_")
    )
}

/// `OLLAMA_HOST` holds the server address (`host:port`, scheme optional);
/// the OpenAI-compatible API lives under `/v1`.
fn ollama_base_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{host}/v1")
    } else {
        format!("http://{host}/v1")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
