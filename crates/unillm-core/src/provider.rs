//! The provider contract.
//!
//! Every backend, HTTP or subprocess, is driven through [`Provider`].  The
//! tool-use loop and the blocking wrapper only ever see this trait.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use crate::error::{LlmError, Result};
use crate::types::{ChatRequest, Response};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// The backends this crate knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Anthropic Messages API.
    Anthropic,
    /// OpenAI Chat Completions API.
    OpenAi,
    /// Ollama through its OpenAI-compatible endpoint.
    Ollama,
    /// The `claude` command-line tool.
    ClaudeCli,
    /// The `gemini` command-line tool.
    GeminiCli,
}

impl ProviderKind {
    /// Every known kind, in display order.
    pub const ALL: [ProviderKind; 5] = [
        Self::Anthropic,
        Self::OpenAi,
        Self::Ollama,
        Self::ClaudeCli,
        Self::GeminiCli,
    ];

    /// Stable identifier used in configuration and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
            Self::ClaudeCli => "claude-cli",
            Self::GeminiCli => "gemini-cli",
        }
    }

    /// Whether this backend runs as a local subprocess.
    pub fn is_cli(&self) -> bool {
        matches!(self, Self::ClaudeCli | Self::GeminiCli)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            "claude-cli" | "claude_cli" => Ok(Self::ClaudeCli),
            "gemini-cli" | "gemini_cli" => Ok(Self::GeminiCli),
            other => Err(LlmError::Config {
                reason: format!("unknown provider `{other}`"),
            }),
        }
    }
}

/// Who a provider is and what it uses by default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderIdentity {
    pub kind: ProviderKind,
    pub display_name: String,
    pub default_model: String,
}

// ---------------------------------------------------------------------------
// Streaming notifications
// ---------------------------------------------------------------------------

/// Notifications emitted by [`Provider::chat_stream`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Emitted once, before any delta.
    Start,
    /// Newly generated text; never repeats earlier text.
    Delta(String),
    /// The completed response.
    End(Response),
}

/// Callback receiving [`StreamEvent`]s.
pub type StreamCallback<'a> = dyn FnMut(StreamEvent) + Send + 'a;

/// Wraps a [`StreamCallback`] to enforce emission order.
///
/// `Start` is sent at most once and always before the first `Delta`.
/// Nothing is emitted after the request's cancellation token fires.
pub struct StreamSink<'a, 'b> {
    callback: &'a mut StreamCallback<'b>,
    cancel: &'a tokio_util::sync::CancellationToken,
    started: bool,
}

impl<'a, 'b> StreamSink<'a, 'b> {
    pub fn new(
        callback: &'a mut StreamCallback<'b>,
        cancel: &'a tokio_util::sync::CancellationToken,
    ) -> Self {
        Self {
            callback,
            cancel,
            started: false,
        }
    }

    /// Emit `Start` unless it was already emitted.
    pub fn start(&mut self) {
        if self.started || self.cancel.is_cancelled() {
            return;
        }
        self.started = true;
        (self.callback)(StreamEvent::Start);
    }

    /// Emit a text delta, preceded by `Start` if needed.
    pub fn delta(&mut self, text: &str) {
        if text.is_empty() || self.cancel.is_cancelled() {
            return;
        }
        self.start();
        (self.callback)(StreamEvent::Delta(text.to_owned()));
    }

    /// Emit the terminal `End` notification.
    pub fn end(&mut self, response: &Response) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.start();
        (self.callback)(StreamEvent::End(response.clone()));
    }
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// The capability every backend implements.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Issue a chat completion and wait for the whole response.
    async fn chat(&self, request: &ChatRequest) -> Result<Response>;

    /// Issue a chat completion, reporting progress through `on_event`.
    ///
    /// On failure no `End` is emitted; deltas already delivered remain
    /// delivered.
    async fn chat_stream(
        &self,
        request: &ChatRequest,
        on_event: &mut StreamCallback<'_>,
    ) -> Result<Response>;

    /// Kind, display name, and default model.
    fn identity(&self) -> ProviderIdentity;

    /// Models this provider is known to serve.
    fn list_models(&self) -> Vec<String>;
}
