//! Unified LLM client layer.
//!
//! One provider-agnostic conversation model in, one provider-agnostic
//! [`Response`] out, whether the backend is a REST API or a local CLI.
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────────┐
//!            │  Tool-use loop   │  runtime::react_loop
//!            └────────┬─────────┘
//!                     │ dyn Provider
//!          ┌──────────┴───────────┐
//!   ┌──────┴───────┐       ┌──────┴──────┐
//!   │ HttpProvider │       │ CliProvider │
//!   │  + backend   │       │  + backend  │
//!   └──────┬───────┘       └──────┬──────┘
//!   SSE reducers           NDJSON line parsers
//! ```
//!
//! ## Modules
//!
//! - [`types`] -- Messages, content blocks, tools, responses.
//! - [`provider`] -- The `Provider` trait and stream events.
//! - [`http`] -- REST transport with Anthropic and OpenAI-style backends.
//! - [`streaming`] / [`streaming_openai`] -- SSE decoding and stream reducers.
//! - [`cli`] -- Subprocess transport with Claude and Gemini CLI backends.
//! - [`runtime`] -- The tool-use loop and tool executor trait.
//! - [`blocking`] -- Synchronous wrapper.
//! - [`config`] / [`registry`] -- Settings and provider construction.
//! - [`error`] -- Error types.

pub mod blocking;
pub mod cli;
pub mod config;
pub mod error;
pub mod http;
pub mod provider;
pub mod registry;
pub mod runtime;
pub mod streaming;
pub mod streaming_openai;
pub mod types;

// Re-export the most commonly used types at the crate root.
pub use blocking::BlockingProvider;
pub use cli::{ClaudeCliBackend, CliBackend, CliProvider, GeminiCliBackend};
pub use config::{Config, ProviderOverrides, ProviderSettings};
pub use error::{ErrorKind, LlmError, Result};
pub use http::{AnthropicBackend, HttpBackend, HttpProvider, OpenAiBackend};
pub use provider::{Provider, ProviderIdentity, ProviderKind, StreamCallback, StreamEvent};
pub use registry::connect;
pub use runtime::{AgentConfig, AgentResponse, NoTools, ToolExecutor, ToolSet, react_loop};
pub use types::{
    ChatRequest, ContentBlock, Message, Response, Role, StopReason, Tool, ToolCall, ToolParameter,
    Usage,
};
